//! Submission options and listener hooks

use super::error::TransferFailure;
use super::events::TaskEvent;
use super::types::Progress;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Callbacks for one submitted task.
///
/// Every method defaults to a no-op. Calls happen on the engine's
/// background tasks, so implementations should hand work off rather than
/// block.
pub trait TaskListener: Send + Sync {
    fn on_metadata_progress(&self, _progress: Progress) {}

    fn on_metadata_complete(&self, _progress: Progress) {}

    fn on_progress(&self, _progress: Progress) {}

    fn on_complete(&self, _progress: Progress) {}

    fn on_error(&self, _failure: &TransferFailure) {}
}

/// Route an emission to the matching listener method
pub(crate) fn notify_listener(listener: &dyn TaskListener, event: &TaskEvent) {
    match event {
        TaskEvent::MetadataProgress(p) => listener.on_metadata_progress(*p),
        TaskEvent::MetadataComplete(p) => listener.on_metadata_complete(*p),
        TaskEvent::Progress(p) => listener.on_progress(*p),
        TaskEvent::Complete(p) => listener.on_complete(*p),
        TaskEvent::Error(failure) => listener.on_error(failure),
    }
}

/// Options for submitting a magnet
#[derive(Clone, Default)]
pub struct SubmitOptions {
    /// Progress/completion callbacks
    pub listener: Option<Arc<dyn TaskListener>>,
    /// Overrides the configured download directory
    pub directory: Option<PathBuf>,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listener(mut self, listener: Arc<dyn TaskListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.directory = Some(dir.into());
        self
    }
}

impl fmt::Debug for SubmitOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmitOptions")
            .field("listener", &self.listener.is_some())
            .field("directory", &self.directory)
            .finish()
    }
}
