//! Download Engine - Main entry point
//!
//! The `DownloadEngine` turns magnet links into files on disk by driving an
//! aria2 daemon. It owns the daemon session, starts the event dispatcher and
//! the heartbeat poller on first use, and hands every submission back as a
//! [`PendingDownload`] future.

use crate::config::EngineConfig;
use crate::coordinator::Coordinator;
use crate::daemon::DaemonSession;
use crate::error::{EngineError, Result, RpcErrorKind};
use crate::protocol::{DownloadEvent, Downloaded, Gid, SubmitOptions, TaskSnapshot};
use crate::reconciler::Task;
use crate::registry::{TaskRegistry, TrackedTask};
use crate::rpc::{Notification, TransferOptions, TransferRpc};
use crate::{dispatcher, heartbeat};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Maximum number of events to buffer
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Where RPC calls and notifications come from
enum Transport {
    /// A daemon session, spawned or attached
    Session(DaemonSession),
    /// A pre-connected RPC implementation
    Injected {
        rpc: Arc<dyn TransferRpc>,
        notifications: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
    },
}

/// Background machinery of a started engine
struct Runtime {
    coordinator: Arc<Coordinator>,
    shutdown: CancellationToken,
    dispatcher: Option<JoinHandle<()>>,
    heartbeat: JoinHandle<()>,
}

impl Runtime {
    fn stop(self) {
        self.shutdown.cancel();
        if let Some(dispatcher) = self.dispatcher {
            dispatcher.abort();
        }
        self.heartbeat.abort();
        self.coordinator.teardown();
    }
}

/// The main download engine
pub struct DownloadEngine {
    config: EngineConfig,
    transport: Transport,
    /// Serializes start and close
    lifecycle: tokio::sync::Mutex<()>,
    runtime: RwLock<Option<Runtime>>,
    event_tx: broadcast::Sender<DownloadEvent>,
}

impl DownloadEngine {
    /// Create an engine; the daemon is spawned or attached per `config.daemon.spawn`
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let session = DaemonSession::new(config.daemon.clone(), config.rpc_call_timeout());
        Ok(Self::build(config, Transport::Session(session)))
    }

    /// Create an engine that attaches to an already running daemon
    pub fn attach(mut config: EngineConfig) -> Result<Self> {
        config.daemon.spawn = false;
        Self::new(config)
    }

    /// Create an engine on top of a connected RPC implementation.
    ///
    /// Without a notification stream the engine runs on heartbeat polls alone.
    pub fn with_rpc(
        config: EngineConfig,
        rpc: Arc<dyn TransferRpc>,
        notifications: Option<mpsc::UnboundedReceiver<Notification>>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(
            config,
            Transport::Injected {
                rpc,
                notifications: Mutex::new(notifications),
            },
        ))
    }

    fn build(config: EngineConfig, transport: Transport) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            transport,
            lifecycle: tokio::sync::Mutex::new(()),
            runtime: RwLock::new(None),
            event_tx,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.runtime.read().is_some()
    }

    /// Daemon version from the handshake, when running on a daemon session
    pub fn daemon_version(&self) -> Option<String> {
        match &self.transport {
            Transport::Session(session) => session.version(),
            Transport::Injected { .. } => None,
        }
    }

    /// Start the daemon session and the background tasks. Idempotent.
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_started() {
            return Ok(());
        }

        let (rpc, notifications) = match &self.transport {
            Transport::Session(session) => {
                session.start().await?;
                let rpc: Arc<dyn TransferRpc> = session.rpc().ok_or_else(|| {
                    EngineError::rpc(RpcErrorKind::NotConnected, "daemon session has no connection")
                })?;
                (rpc, session.take_notifications())
            }
            Transport::Injected { rpc, notifications } => {
                (Arc::clone(rpc), notifications.lock().take())
            }
        };

        let coordinator = Arc::new(Coordinator::new(
            rpc,
            Arc::new(TaskRegistry::new()),
            self.event_tx.clone(),
        ));
        let shutdown = CancellationToken::new();

        let dispatcher = match notifications {
            Some(rx) => Some(tokio::spawn(dispatcher::run(
                Arc::clone(&coordinator),
                rx,
                shutdown.clone(),
            ))),
            None => {
                tracing::warn!("No notification stream; task updates come from heartbeat polls only");
                None
            }
        };
        let heartbeat = tokio::spawn(heartbeat::run(
            Arc::clone(&coordinator),
            self.config.heartbeat_period(),
            shutdown.clone(),
        ));

        *self.runtime.write() = Some(Runtime {
            coordinator,
            shutdown,
            dispatcher,
            heartbeat,
        });
        tracing::info!("Download engine started");
        Ok(())
    }

    fn coordinator(&self) -> Option<Arc<Coordinator>> {
        self.runtime
            .read()
            .as_ref()
            .map(|runtime| Arc::clone(&runtime.coordinator))
    }

    /// Submit a magnet under `key` and get a future for its files.
    ///
    /// Starts the engine if needed. The future resolves once every file of
    /// the torrent is complete and rejects on the first transfer error.
    pub async fn submit(
        &self,
        key: impl Into<String>,
        magnet: &str,
        options: SubmitOptions,
    ) -> Result<PendingDownload> {
        let key = key.into();
        if key.is_empty() {
            return Err(EngineError::invalid_input("key", "Must not be empty"));
        }
        validate_magnet(magnet)?;

        self.start().await?;
        let coordinator = self.coordinator().ok_or(EngineError::Shutdown)?;
        if coordinator.registry().contains_key(&key) {
            return Err(EngineError::AlreadyExists(key));
        }

        let transfer = self.transfer_options(&options);
        let gid = coordinator
            .rpc()
            .add_uri(&[magnet.to_string()], &transfer)
            .await?;

        let (task, result) = TrackedTask::new(
            Task::new(key.clone(), magnet, gid.clone()),
            options.listener,
        );
        if let Err(e) = coordinator.registry().track(&task) {
            // Lost a race for the key; the transfer we just added is orphaned
            if let Err(remove) = coordinator.rpc().force_remove(&gid).await {
                tracing::debug!("Removing orphaned transfer {}: {}", gid, remove);
            }
            return Err(e);
        }
        coordinator.registry().register(gid.clone(), &task);

        tracing::info!("Submitted task {} as {}", key, gid);
        let _ = self.event_tx.send(DownloadEvent::Added {
            key: key.clone(),
            gid: gid.clone(),
        });

        Ok(PendingDownload { key, gid, result })
    }

    /// Submit and wait for the files
    pub async fn download(
        &self,
        key: impl Into<String>,
        magnet: &str,
        options: SubmitOptions,
    ) -> Result<Downloaded> {
        self.submit(key, magnet, options).await?.await
    }

    /// Cancel a live task. Returns false if no live task has this key.
    pub async fn cancel(&self, key: &str) -> Result<bool> {
        let Some(coordinator) = self.coordinator() else {
            return Ok(false);
        };
        let Some(task) = coordinator.registry().find(key) else {
            return Ok(false);
        };
        let canceled = coordinator.cancel(&task).await;
        if canceled {
            tracing::info!("Canceled task {}", key);
        }
        Ok(canceled)
    }

    /// Snapshot of a live task
    pub fn status(&self, key: &str) -> Option<TaskSnapshot> {
        self.coordinator()?
            .registry()
            .find(key)
            .map(|task| task.snapshot())
    }

    /// Snapshots of every live task
    pub fn active_tasks(&self) -> Vec<TaskSnapshot> {
        self.coordinator()
            .map(|coordinator| {
                coordinator
                    .registry()
                    .tasks()
                    .iter()
                    .map(|task| task.snapshot())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.event_tx.subscribe()
    }

    /// Shut the daemon down.
    ///
    /// Returns false, leaving everything running, when the daemon does not
    /// confirm. On confirmation the background tasks stop and every task
    /// still in flight rejects with [`EngineError::Shutdown`].
    pub async fn close(&self) -> bool {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.is_started() {
            return false;
        }

        let coordinator = self.coordinator();
        if let Some(coordinator) = &coordinator {
            coordinator.set_closing(true);
        }

        let confirmed = match &self.transport {
            Transport::Session(session) => session.close().await,
            Transport::Injected { rpc, .. } => match rpc.shutdown().await {
                Ok(answer) => answer == "OK",
                Err(e) => {
                    tracing::warn!("Shutdown call failed: {}", e);
                    false
                }
            },
        };
        if !confirmed {
            if let Some(coordinator) = &coordinator {
                coordinator.set_closing(false);
            }
            tracing::warn!("Daemon did not confirm shutdown; engine keeps running");
            return false;
        }

        let runtime = self.runtime.write().take();
        if let Some(runtime) = runtime {
            runtime.stop();
        }
        tracing::info!("Download engine stopped");
        true
    }

    fn transfer_options(&self, options: &SubmitOptions) -> TransferOptions {
        let dir = options
            .directory
            .as_ref()
            .unwrap_or(&self.config.download_dir);
        TransferOptions {
            dir: Some(dir.to_string_lossy().into_owned()),
            bt_tracker: (!self.config.trackers.is_empty()).then(|| self.config.trackers.join(",")),
            all_proxy: self.config.proxy.resolve(),
        }
    }
}

impl Drop for DownloadEngine {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.stop();
        }
    }
}

/// Check that `magnet` is a magnet URI with an exact topic
fn validate_magnet(magnet: &str) -> Result<()> {
    let url = Url::parse(magnet)
        .map_err(|e| EngineError::invalid_input("magnet", format!("Not a URI: {}", e)))?;
    if url.scheme() != "magnet" {
        return Err(EngineError::invalid_input(
            "magnet",
            format!("Expected a magnet URI, got scheme '{}'", url.scheme()),
        ));
    }
    if !url
        .query_pairs()
        .any(|(name, value)| name == "xt" && !value.is_empty())
    {
        return Err(EngineError::invalid_input("magnet", "Missing 'xt' parameter"));
    }
    Ok(())
}

/// Future returned by [`DownloadEngine::submit`].
///
/// Dropping it does not cancel the task; use [`DownloadEngine::cancel`].
#[derive(Debug)]
pub struct PendingDownload {
    key: String,
    gid: Gid,
    result: oneshot::Receiver<Result<Downloaded>>,
}

impl PendingDownload {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// gid of the metadata transfer
    pub fn gid(&self) -> &Gid {
        &self.gid
    }
}

impl Future for PendingDownload {
    type Output = Result<Downloaded>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the engine went away before settling
        Pin::new(&mut self.result)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(EngineError::Shutdown)))
    }
}
