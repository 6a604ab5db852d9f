use crate::Gvk;
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The API server does not serve the kind.
    #[error("no matches for kind {0}")]
    NoMatch(Gvk),

    #[error("watch for {gvk} failed: {source}")]
    Failed {
        gvk: Gvk,
        #[source]
        source: anyhow::Error,
    },

    #[error("watch registrar is closed")]
    Closed,
}

/// Holds watch event delivery paused. Delivery resumes when the guard is
/// dropped or [`PauseGuard::resume`] is called, so a pause can't outlive the
/// scope that took it.
pub struct PauseGuard {
    resume: Option<Box<dyn FnOnce() + Send>>,
}

/// Starts and stops watches on arbitrary kinds, routing their events to the
/// sync handler.
#[async_trait::async_trait]
pub trait Registrar: Send + Sync {
    /// Starts watching the kind. Adding an already-watched kind is a no-op.
    async fn add_watch(&self, gvk: &Gvk) -> Result<(), WatchError>;

    /// Stops watching the kind. Removing an unwatched kind is a no-op.
    async fn remove_watch(&self, gvk: &Gvk) -> Result<(), WatchError>;

    /// Stops routing watch events until the returned guard is released. Waits
    /// for in-flight deliveries to finish.
    async fn pause(&self) -> Result<PauseGuard, WatchError>;
}

// === impl PauseGuard ===

impl PauseGuard {
    pub fn new(resume: impl FnOnce() + Send + 'static) -> Self {
        Self {
            resume: Some(Box::new(resume)),
        }
    }

    pub fn resume(self) {
        drop(self);
    }
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        if let Some(resume) = self.resume.take() {
            resume();
        }
    }
}

impl fmt::Debug for PauseGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PauseGuard")
            .field("paused", &self.resume.is_some())
            .finish()
    }
}

// === impl WatchError ===

impl WatchError {
    pub fn is_no_match(&self) -> bool {
        matches!(self, Self::NoMatch(_))
    }
}
