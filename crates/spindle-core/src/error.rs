use std::time::Duration;

use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, SpindleError>;

#[derive(Debug, Error)]
pub enum SpindleError {
    /// Precondition: a scheduled run needs a positive initial delay.
    #[error("initial delay must be greater than zero")]
    ZeroInitialDelay,

    /// Precondition: every submission needs at least one observer.
    #[error("at least one observer is required")]
    NoObservers,

    /// Engine fault: a result arrived for a key with no registered
    /// observers. This signals an engine logic error, not a caller error.
    #[error("no observers registered for task {0}")]
    MissingObservers(String),

    /// Engine fault: an aggregate firing's members did not all finish
    /// within the fan-in ceiling.
    #[error("aggregate fan-in did not finish within {0:?}")]
    FanInCeilingExceeded(Duration),
}
