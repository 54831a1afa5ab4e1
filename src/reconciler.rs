//! State Reconciler
//!
//! A [`Task`] is the state machine for one submitted magnet. Every status
//! snapshot for one of its gids, whether it came from a push notification or
//! a heartbeat poll, goes through [`Task::reconcile`], which mutates the task
//! in place and returns a [`Transition`] describing what the caller has to do:
//! register newly discovered gids, emit an event, and settle the result.
//!
//! The function does no I/O. Once the task is `complete` or `error` it
//! ignores every further snapshot, which makes duplicate notifications and
//! overlapping heartbeat polls harmless.

use crate::protocol::{
    Gid, GidState, Progress, StatusSnapshot, TaskEvent, TaskSnapshot, TaskState,
    TransferFailure, TransferStatus,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Last observed progress of one gid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GidProgress {
    pub state: GidState,
    pub completed: u64,
    pub total: u64,
    pub connections: u32,
    pub speed: u64,
}

impl GidProgress {
    fn observe(snapshot: &StatusSnapshot) -> Self {
        Self {
            state: GidState::Active,
            completed: snapshot.completed_length,
            total: snapshot.total_length,
            connections: snapshot.connections,
            speed: snapshot.download_speed,
        }
    }

    fn update(&mut self, snapshot: &StatusSnapshot) {
        self.completed = snapshot.completed_length;
        self.total = snapshot.total_length;
        self.connections = snapshot.connections;
        self.speed = snapshot.download_speed;
    }
}

/// How a task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// All content transfers finished; file lists still have to be collected
    Completed,
    /// Metadata or a content transfer failed, or the task was canceled
    Failed(TransferFailure),
}

/// Result of feeding one snapshot to a task
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Transition {
    /// Listener-visible change, if anything changed
    pub event: Option<TaskEvent>,
    /// Content gids discovered when metadata resolved
    pub discovered: Vec<Gid>,
    /// Set exactly once per task, on the transition into a terminal state
    pub outcome: Option<Outcome>,
}

impl Transition {
    pub fn is_empty(&self) -> bool {
        self.event.is_none() && self.discovered.is_empty() && self.outcome.is_none()
    }
}

/// State machine for one submitted magnet
#[derive(Debug, Clone)]
pub struct Task {
    key: String,
    magnet: String,
    state: TaskState,
    metadata_gid: Gid,
    file_gids: Vec<Gid>,
    progress: HashMap<Gid, GidProgress>,
    failure: Option<TransferFailure>,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(key: impl Into<String>, magnet: impl Into<String>, metadata_gid: Gid) -> Self {
        Self {
            key: key.into(),
            magnet: magnet.into(),
            state: TaskState::Waiting,
            metadata_gid,
            file_gids: Vec::new(),
            progress: HashMap::new(),
            failure: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn metadata_gid(&self) -> &Gid {
        &self.metadata_gid
    }

    pub fn file_gids(&self) -> &[Gid] {
        &self.file_gids
    }

    pub fn failure(&self) -> Option<&TransferFailure> {
        self.failure.as_ref()
    }

    pub fn gid_progress(&self, gid: &Gid) -> Option<&GidProgress> {
        self.progress.get(gid)
    }

    /// Metadata gid followed by every content gid
    pub fn gids(&self) -> Vec<Gid> {
        std::iter::once(self.metadata_gid.clone())
            .chain(self.file_gids.iter().cloned())
            .collect()
    }

    /// Gids whose file lists make up the download.
    ///
    /// A magnet whose metadata transfer spawned nothing is its own content.
    pub fn content_gids(&self) -> Vec<Gid> {
        if self.file_gids.is_empty() {
            vec![self.metadata_gid.clone()]
        } else {
            self.file_gids.clone()
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            key: self.key.clone(),
            magnet: self.magnet.clone(),
            state: self.state,
            metadata_gid: self.metadata_gid.clone(),
            file_gids: self.file_gids.clone(),
            progress: self.overall_progress(),
            failure: self.failure.clone(),
            created_at: self.created_at,
            finished_at: self.finished_at,
        }
    }

    /// Feed one status snapshot through the state machine
    pub fn reconcile(&mut self, snapshot: &StatusSnapshot) -> Transition {
        if self.state.is_terminal() {
            return Transition::default();
        }

        let gid = &snapshot.gid;
        let is_metadata = *gid == self.metadata_gid;
        if !is_metadata && !self.file_gids.contains(gid) {
            tracing::debug!("Task {} does not own gid {}", self.key, gid);
            return Transition::default();
        }

        let old_state = self.state;
        let force = !self.progress.contains_key(gid);
        let progress = self
            .progress
            .entry(gid.clone())
            .or_insert_with(|| GidProgress::observe(snapshot));
        let before = *progress;
        let mut discovered = Vec::new();

        match snapshot.status {
            TransferStatus::Active => {
                if before.state == GidState::Active {
                    progress.update(snapshot);
                }
                if is_metadata && self.state == TaskState::Waiting {
                    self.state = TaskState::Metadata;
                }
            }
            TransferStatus::Error | TransferStatus::Removed => {
                progress.state = GidState::Error;
                progress.update(snapshot);
                self.state = TaskState::Error;
            }
            TransferStatus::Complete => {
                progress.state = GidState::Complete;
                progress.update(snapshot);
                if is_metadata && matches!(self.state, TaskState::Waiting | TaskState::Metadata) {
                    for follower in &snapshot.followed_by {
                        if *follower != self.metadata_gid && !discovered.contains(follower) {
                            discovered.push(follower.clone());
                        }
                    }
                    self.file_gids = discovered.clone();
                    self.state = if discovered.is_empty() {
                        TaskState::Complete
                    } else {
                        TaskState::Downloading
                    };
                }
            }
            TransferStatus::Paused => {
                tracing::warn!("Download task {} was unexpectedly paused", self.key);
            }
            TransferStatus::Waiting => {}
        }

        let after = *progress;
        let mut transition = Transition {
            discovered,
            ..Transition::default()
        };

        let changed = force || old_state != self.state || before != after;
        if !changed {
            return transition;
        }

        if is_metadata {
            self.metadata_emission(old_state, snapshot, &after, &mut transition);
        } else {
            self.content_emission(snapshot, &after, &mut transition);
        }

        if self.state.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        transition
    }

    /// Move a live task to `error` with the `canceled` code
    pub fn cancel(&mut self) -> Option<Transition> {
        if self.state.is_terminal() {
            return None;
        }
        let failure = TransferFailure::canceled();
        self.state = TaskState::Error;
        self.failure = Some(failure.clone());
        self.finished_at = Some(Utc::now());
        Some(Transition {
            event: Some(TaskEvent::Error(failure.clone())),
            discovered: Vec::new(),
            outcome: Some(Outcome::Failed(failure)),
        })
    }

    fn metadata_emission(
        &mut self,
        old_state: TaskState,
        snapshot: &StatusSnapshot,
        progress: &GidProgress,
        transition: &mut Transition,
    ) {
        let payload = Progress {
            completed_bytes: progress.completed,
            total_bytes: progress.total,
            connections: snapshot.connections,
            speed: snapshot.download_speed,
        };

        match self.state {
            TaskState::Metadata => {
                transition.event = Some(TaskEvent::MetadataProgress(payload));
            }
            TaskState::Downloading => {
                // Later metadata snapshots after discovery carry nothing new
                if old_state != TaskState::Downloading {
                    transition.event = Some(TaskEvent::MetadataComplete(payload));
                }
            }
            TaskState::Complete => {
                transition.event = Some(TaskEvent::Complete(payload));
                transition.outcome = Some(Outcome::Completed);
            }
            TaskState::Error => self.fail(snapshot, transition),
            TaskState::Waiting => {
                tracing::debug!("Download task {} is still waiting for the daemon", self.key);
            }
        }
    }

    fn content_emission(
        &mut self,
        snapshot: &StatusSnapshot,
        progress: &GidProgress,
        transition: &mut Transition,
    ) {
        if self.state == TaskState::Error {
            self.fail(snapshot, transition);
            return;
        }

        let (completed, total) = self.content_totals();
        let payload = Progress {
            completed_bytes: completed,
            total_bytes: total,
            connections: snapshot.connections,
            speed: snapshot.download_speed,
        };

        match progress.state {
            GidState::Complete if self.all_content_complete() => {
                self.state = TaskState::Complete;
                transition.event = Some(TaskEvent::Complete(payload));
                transition.outcome = Some(Outcome::Completed);
            }
            GidState::Active | GidState::Complete => {
                transition.event = Some(TaskEvent::Progress(payload));
            }
            GidState::Error => self.fail(snapshot, transition),
        }
    }

    fn fail(&mut self, snapshot: &StatusSnapshot, transition: &mut Transition) {
        let failure = snapshot.failure();
        self.state = TaskState::Error;
        self.failure = Some(failure.clone());
        transition.event = Some(TaskEvent::Error(failure.clone()));
        transition.outcome = Some(Outcome::Failed(failure));
    }

    /// Sum of completed/total bytes over content gids with a known record
    fn content_totals(&self) -> (u64, u64) {
        self.file_gids
            .iter()
            .filter_map(|gid| self.progress.get(gid))
            .fold((0, 0), |(completed, total), p| {
                (completed + p.completed, total + p.total)
            })
    }

    /// Every content gid has been observed and reported `complete`
    fn all_content_complete(&self) -> bool {
        !self.file_gids.is_empty()
            && self.file_gids.iter().all(|gid| {
                self.progress
                    .get(gid)
                    .is_some_and(|p| p.state == GidState::Complete)
            })
    }

    fn overall_progress(&self) -> Progress {
        if self.file_gids.is_empty() {
            return self
                .progress
                .get(&self.metadata_gid)
                .map(|p| Progress {
                    completed_bytes: p.completed,
                    total_bytes: p.total,
                    connections: p.connections,
                    speed: p.speed,
                })
                .unwrap_or_default();
        }

        let (completed_bytes, total_bytes) = self.content_totals();
        let (connections, speed) = self
            .file_gids
            .iter()
            .filter_map(|gid| self.progress.get(gid))
            .filter(|p| p.state == GidState::Active)
            .fold((0, 0), |(c, s), p| (c + p.connections, s + p.speed));
        Progress {
            completed_bytes,
            total_bytes,
            connections,
            speed,
        }
    }
}
