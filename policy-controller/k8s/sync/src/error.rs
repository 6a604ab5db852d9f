use gatekeeper_policy_controller_core::{ClientError, DataError, GvkSet, WatchError};
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing required dependency: {0}")]
    MissingDependency(&'static str),

    #[error("object has no type information")]
    MissingType,

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error("failed to parse {kind}: {source}")]
    Parse {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to pause watch delivery: {0}")]
    Pause(#[source] WatchError),

    /// Some part of a convergence pass did not complete. Whatever did complete
    /// is kept; the next pass retries the rest.
    #[error("watch convergence incomplete: {watch}; unpopulated kinds: {unpopulated}; stale data: {stale}")]
    Convergence {
        watch: WatchFailures,
        unpopulated: GvkSet,
        stale: bool,
    },

    #[error("cancelled")]
    Cancelled,
}

/// The watch start/stop failures of one convergence pass.
#[derive(Debug, Default)]
pub struct WatchFailures(pub Vec<WatchError>);

// === impl WatchFailures ===

impl WatchFailures {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for WatchFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("no watch failures");
        }
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            fmt::Display::fmt(error, f)?;
        }
        Ok(())
    }
}
