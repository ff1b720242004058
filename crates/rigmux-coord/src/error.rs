use rigmux_protocol::LockError;
use rigmux_tracker::TrackerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("gate '{0}' not found or not accessible")]
    GateNotFound(String),
    #[error("gate '{0}' is already closed - nothing to park on")]
    GateClosed(String),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl CoordError {
    /// Worth retrying: contention or a failing tracker, not a bad request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Lock(LockError::Timeout { .. }) | Self::Tracker(TrackerError::CommandFailed { .. })
        )
    }
}
