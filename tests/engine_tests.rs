//! Engine integration tests
//!
//! Drive `DownloadEngine` against a scripted daemon: notifications are fed
//! by hand through the channel the dispatcher reads, and the heartbeat runs
//! on a short period.

mod mock_daemon;

use gosh_aria2::{
    DownloadEngine, DownloadEvent, EngineConfig, EngineError, Notification, NotificationKind,
    Progress, StatusSnapshot, SubmitOptions, TaskEvent, TaskListener, TaskState, TransferFailure,
    TransferStatus,
};
use mock_daemon::{wait_until, RecordingListener, ScriptedRpc};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

const MAGNET: &str = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=episode";
const WAIT: Duration = Duration::from_secs(5);

fn test_config(temp_dir: &TempDir, heartbeat: Duration) -> EngineConfig {
    EngineConfig::default()
        .download_dir(temp_dir.path())
        .trackers(vec!["udp://tracker.example:1337/announce".to_string()])
        .heartbeat_interval(heartbeat)
}

/// Engine on a scripted daemon, plus the sender feeding its dispatcher
fn create_test_engine(
    temp_dir: &TempDir,
    heartbeat: Duration,
) -> (DownloadEngine, Arc<ScriptedRpc>, mpsc::UnboundedSender<Notification>) {
    let rpc = ScriptedRpc::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let engine =
        DownloadEngine::with_rpc(test_config(temp_dir, heartbeat), rpc.clone(), Some(rx))
            .expect("Failed to create engine");
    (engine, rpc, tx)
}

async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<DownloadEvent>,
    predicate: F,
) -> Option<DownloadEvent>
where
    F: Fn(&DownloadEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    })
    .await
    .unwrap_or(None)
}

fn progress(completed: u64, total: u64) -> impl Fn(&TaskEvent) -> bool {
    move |event| {
        matches!(
            event,
            TaskEvent::Progress(Progress { completed_bytes, total_bytes, .. })
                if *completed_bytes == completed && *total_bytes == total
        )
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_metadata_error_rejects_task() {
    let temp_dir = TempDir::new().unwrap();
    let (engine, rpc, notify) = create_test_engine(&temp_dir, Duration::from_secs(60));
    let listener = RecordingListener::new();

    let pending = engine
        .submit("ep1", MAGNET, SubmitOptions::new().listener(listener.clone()))
        .await
        .unwrap();
    assert_eq!(pending.gid().as_str(), "meta-1");

    rpc.set_status(
        StatusSnapshot::new("meta-1", TransferStatus::Error).with_error("X", "tracker timeout"),
    );
    notify
        .send(Notification::new(NotificationKind::DownloadError, "meta-1"))
        .unwrap();

    let err = timeout(WAIT, pending).await.unwrap().unwrap_err();
    let failure = err.transfer_failure().expect("transfer failure");
    assert_eq!(failure.code, "X");
    assert_eq!(failure.message, "tracker timeout");

    assert_eq!(listener.count(|e| matches!(e, TaskEvent::Error(_))), 1);
    assert!(engine.status("ep1").is_none());
}

#[tokio::test]
async fn test_two_file_completion() {
    let temp_dir = TempDir::new().unwrap();
    let (engine, rpc, notify) = create_test_engine(&temp_dir, Duration::from_millis(20));
    let listener = RecordingListener::new();
    let mut events = engine.subscribe();

    let pending = engine
        .submit("ep2", MAGNET, SubmitOptions::new().listener(listener.clone()))
        .await
        .unwrap();

    rpc.set_status(StatusSnapshot::new("g1", TransferStatus::Active).with_lengths(0, 100));
    rpc.set_status(StatusSnapshot::new("g2", TransferStatus::Active).with_lengths(0, 200));
    rpc.set_status(
        StatusSnapshot::new("meta-1", TransferStatus::Complete)
            .with_lengths(16, 16)
            .with_followed_by(["g1", "g2"]),
    );
    notify
        .send(Notification::new(NotificationKind::BtDownloadComplete, "meta-1"))
        .unwrap();

    assert!(
        wait_until(WAIT, || engine
            .status("ep2")
            .is_some_and(|s| s.state == TaskState::Downloading))
        .await
    );
    let snapshot = engine.status("ep2").unwrap();
    assert_eq!(snapshot.file_gids.len(), 2);

    rpc.set_status(
        StatusSnapshot::new("g1", TransferStatus::Complete)
            .with_lengths(100, 100)
            .with_file(temp_dir.path().join("a.mkv"), 100),
    );
    rpc.set_status(StatusSnapshot::new("g2", TransferStatus::Active).with_lengths(50, 200));

    let seen = wait_for_event(&mut events, |e| match e {
        DownloadEvent::Update { event, .. } => progress(150, 300)(event),
        _ => false,
    })
    .await;
    assert!(seen.is_some(), "no 150/300 progress event");
    assert_eq!(engine.status("ep2").unwrap().state, TaskState::Downloading);

    rpc.set_status(
        StatusSnapshot::new("g2", TransferStatus::Complete)
            .with_lengths(200, 200)
            .with_file(temp_dir.path().join("b.mkv"), 200),
    );

    let downloaded = timeout(WAIT, pending).await.unwrap().unwrap();
    assert_eq!(
        downloaded.files,
        vec![temp_dir.path().join("a.mkv"), temp_dir.path().join("b.mkv")]
    );

    let completes: Vec<_> = listener
        .events()
        .into_iter()
        .filter(|e| matches!(e, TaskEvent::Complete(_)))
        .collect();
    assert_eq!(completes.len(), 1);
    assert!(matches!(
        completes[0],
        TaskEvent::Complete(Progress { completed_bytes: 300, total_bytes: 300, .. })
    ));
    assert_eq!(
        listener.count(|e| matches!(e, TaskEvent::MetadataComplete(_))),
        1
    );
}

#[tokio::test]
async fn test_submission_sends_transfer_options() {
    let temp_dir = TempDir::new().unwrap();
    let (engine, rpc, _notify) = create_test_engine(&temp_dir, Duration::from_secs(60));

    let _pending = engine
        .submit("ep3", MAGNET, SubmitOptions::new())
        .await
        .unwrap();

    let added = rpc.added();
    assert_eq!(added.len(), 1);
    let (uris, options) = &added[0];
    assert_eq!(uris, &vec![MAGNET.to_string()]);
    assert_eq!(
        options.dir.as_deref(),
        Some(temp_dir.path().to_string_lossy().as_ref())
    );
    assert_eq!(
        options.bt_tracker.as_deref(),
        Some("udp://tracker.example:1337/announce")
    );
    assert!(options.all_proxy.is_none());
}

#[tokio::test]
async fn test_identical_snapshots_fire_once() {
    let temp_dir = TempDir::new().unwrap();
    let (engine, rpc, notify) = create_test_engine(&temp_dir, Duration::from_secs(60));
    let listener = RecordingListener::new();

    rpc.set_status(StatusSnapshot::new("meta-1", TransferStatus::Active).with_lengths(10, 100));
    let _pending = engine
        .submit("ep4", MAGNET, SubmitOptions::new().listener(listener.clone()))
        .await
        .unwrap();

    for _ in 0..3 {
        notify
            .send(Notification::new(NotificationKind::DownloadStart, "meta-1"))
            .unwrap();
    }

    assert!(wait_until(WAIT, || rpc.status_calls() >= 3).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        listener.count(|e| matches!(e, TaskEvent::MetadataProgress(_))),
        1
    );
    assert_eq!(engine.status("ep4").unwrap().state, TaskState::Metadata);
}

#[tokio::test]
async fn test_heartbeat_alone_completes_single_transfer() {
    let temp_dir = TempDir::new().unwrap();
    let rpc = ScriptedRpc::new();
    let engine = DownloadEngine::with_rpc(
        test_config(&temp_dir, Duration::from_millis(20)),
        rpc.clone(),
        None,
    )
    .unwrap();

    rpc.set_status(
        StatusSnapshot::new("meta-1", TransferStatus::Complete)
            .with_lengths(42, 42)
            .with_file(temp_dir.path().join("single.mkv"), 42),
    );
    let downloaded = timeout(WAIT, engine.download("ep5", MAGNET, SubmitOptions::new()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(downloaded.files, vec![temp_dir.path().join("single.mkv")]);
    assert!(engine.active_tasks().is_empty());
}

#[tokio::test]
async fn test_status_failures_are_retried() {
    let temp_dir = TempDir::new().unwrap();
    let (engine, rpc, _notify) = create_test_engine(&temp_dir, Duration::from_millis(20));

    rpc.fail_status("meta-1", true);
    rpc.set_status(
        StatusSnapshot::new("meta-1", TransferStatus::Error).with_error("2", "network problem"),
    );
    let mut pending = engine
        .submit("ep6", MAGNET, SubmitOptions::new())
        .await
        .unwrap();

    assert!(wait_until(WAIT, || rpc.status_calls() >= 3).await);
    assert!(timeout(Duration::from_millis(50), &mut pending).await.is_err());

    rpc.fail_status("meta-1", false);
    let err = timeout(WAIT, pending).await.unwrap().unwrap_err();
    assert_eq!(err.transfer_failure().unwrap().code, "2");
}

#[tokio::test]
async fn test_updates_after_completion_are_ignored() {
    let temp_dir = TempDir::new().unwrap();
    let (engine, rpc, notify) = create_test_engine(&temp_dir, Duration::from_millis(20));
    let listener = RecordingListener::new();

    rpc.set_status(
        StatusSnapshot::new("meta-1", TransferStatus::Complete)
            .with_file(temp_dir.path().join("x.mkv"), 1),
    );
    let pending = engine
        .submit("ep7", MAGNET, SubmitOptions::new().listener(listener.clone()))
        .await
        .unwrap();
    timeout(WAIT, pending).await.unwrap().unwrap();

    rpc.set_status(StatusSnapshot::new("meta-1", TransferStatus::Error).with_error("1", "late"));
    notify
        .send(Notification::new(NotificationKind::DownloadError, "meta-1"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let events = listener.events();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], TaskEvent::Complete(_)));
}

/// Records like `RecordingListener` but holds the first 50-byte progress
/// callback long enough for another update source to catch up
struct SlowListener {
    inner: Arc<RecordingListener>,
    stalled: AtomicBool,
}

impl TaskListener for SlowListener {
    fn on_metadata_progress(&self, p: Progress) {
        self.inner.on_metadata_progress(p);
    }

    fn on_metadata_complete(&self, p: Progress) {
        self.inner.on_metadata_complete(p);
    }

    fn on_progress(&self, p: Progress) {
        self.inner.on_progress(p);
        if p.completed_bytes == 50 && !self.stalled.swap(true, Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(300));
        }
    }

    fn on_complete(&self, p: Progress) {
        self.inner.on_complete(p);
    }

    fn on_error(&self, failure: &TransferFailure) {
        self.inner.on_error(failure);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_completion_settles_once_in_order() {
    let temp_dir = TempDir::new().unwrap();
    let (engine, rpc, notify) = create_test_engine(&temp_dir, Duration::from_millis(15));
    let recorded = RecordingListener::new();
    let listener = Arc::new(SlowListener {
        inner: recorded.clone(),
        stalled: AtomicBool::new(false),
    });
    let mut events = engine.subscribe();

    rpc.set_status(StatusSnapshot::new("g1", TransferStatus::Active).with_lengths(50, 100));
    rpc.set_status(
        StatusSnapshot::new("meta-1", TransferStatus::Complete)
            .with_lengths(16, 16)
            .with_followed_by(["g1"]),
    );
    let pending = engine
        .submit("race", MAGNET, SubmitOptions::new().listener(listener.clone()))
        .await
        .unwrap();

    // The heartbeat is now inside the 50/100 callback
    assert!(wait_until(WAIT, || listener.stalled.load(Ordering::SeqCst)).await);
    rpc.set_status(
        StatusSnapshot::new("g1", TransferStatus::Complete)
            .with_lengths(100, 100)
            .with_file(temp_dir.path().join("race.mkv"), 100),
    );
    notify
        .send(Notification::new(NotificationKind::BtDownloadComplete, "g1"))
        .unwrap();

    let downloaded = timeout(WAIT, pending).await.unwrap().unwrap();
    assert_eq!(downloaded.files, vec![temp_dir.path().join("race.mkv")]);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    let resolved: Vec<usize> = seen
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, DownloadEvent::Resolved { .. }))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(resolved.len(), 1, "{seen:?}");
    assert!(
        !seen[resolved[0]..]
            .iter()
            .any(|e| matches!(e, DownloadEvent::Update { .. })),
        "update after resolution: {seen:?}"
    );

    let callbacks = recorded.events();
    assert_eq!(
        recorded.count(|e| matches!(e, TaskEvent::Complete(_))),
        1,
        "{callbacks:?}"
    );
    let stalled_at = callbacks.iter().position(progress(50, 100)).unwrap();
    let completed_at = callbacks
        .iter()
        .position(|e| matches!(e, TaskEvent::Complete(_)))
        .unwrap();
    assert!(stalled_at < completed_at, "{callbacks:?}");
}

// =============================================================================
// API edges
// =============================================================================

#[tokio::test]
async fn test_cancel_rejects_and_removes_transfers() {
    let temp_dir = TempDir::new().unwrap();
    let (engine, rpc, _notify) = create_test_engine(&temp_dir, Duration::from_secs(60));

    let pending = engine
        .submit("ep8", MAGNET, SubmitOptions::new())
        .await
        .unwrap();
    assert!(engine.cancel("ep8").await.unwrap());

    let err = timeout(WAIT, pending).await.unwrap().unwrap_err();
    assert!(matches!(err, EngineError::Canceled { ref key } if key == "ep8"));
    assert_eq!(rpc.removed(), vec![gosh_aria2::Gid::new("meta-1")]);
    assert!(!engine.cancel("ep8").await.unwrap());
}

#[tokio::test]
async fn test_duplicate_key_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let (engine, rpc, _notify) = create_test_engine(&temp_dir, Duration::from_secs(60));

    let _first = engine
        .submit("ep9", MAGNET, SubmitOptions::new())
        .await
        .unwrap();
    let err = engine
        .submit("ep9", MAGNET, SubmitOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(ref key) if key == "ep9"));
    assert_eq!(rpc.added().len(), 1);
}

#[tokio::test]
async fn test_invalid_magnet_is_rejected_before_start() {
    let temp_dir = TempDir::new().unwrap();
    let (engine, rpc, _notify) = create_test_engine(&temp_dir, Duration::from_secs(60));

    let err = engine
        .submit("bad", "https://example.com/a.torrent", SubmitOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput { field: "magnet", .. }));
    assert!(rpc.added().is_empty());
    assert!(!engine.is_started());
}

#[tokio::test]
async fn test_close_rejects_pending_tasks() {
    let temp_dir = TempDir::new().unwrap();
    let (engine, rpc, _notify) = create_test_engine(&temp_dir, Duration::from_secs(60));
    let mut events = engine.subscribe();

    let pending = engine
        .submit("ep10", MAGNET, SubmitOptions::new())
        .await
        .unwrap();

    rpc.set_shutdown_answer("busy");
    assert!(!engine.close().await);
    assert!(engine.status("ep10").is_some());

    rpc.set_shutdown_answer("OK");
    assert!(engine.close().await);
    assert!(!engine.is_started());

    let err = timeout(WAIT, pending).await.unwrap().unwrap_err();
    assert!(matches!(err, EngineError::Shutdown));
    assert!(wait_for_event(&mut events, |e| matches!(e, DownloadEvent::Rejected { key, .. } if key == "ep10"))
        .await
        .is_some());
    assert!(engine.status("ep10").is_none());
}

#[tokio::test]
async fn test_submit_emits_added_event() {
    let temp_dir = TempDir::new().unwrap();
    let (engine, _rpc, _notify) = create_test_engine(&temp_dir, Duration::from_secs(60));
    let mut events = engine.subscribe();

    let pending = engine
        .submit("ep11", MAGNET, SubmitOptions::new().directory(PathBuf::from("/srv/anime")))
        .await
        .unwrap();
    assert_eq!(pending.key(), "ep11");

    let event = wait_for_event(&mut events, |e| matches!(e, DownloadEvent::Added { .. })).await;
    assert!(matches!(
        event,
        Some(DownloadEvent::Added { ref key, ref gid }) if key == "ep11" && gid.as_str() == "meta-1"
    ));
}
