//! Error taxonomy shared by every component. Everything is resolved at a
//! component or dispatcher boundary; nothing propagates past the worker loop.

use thiserror::Error;

/// Completion status of a driver operation.
///
/// `CantWait` is a signal, not a failure: the operation needs to block and
/// the caller asked it not to, so it should be resubmitted through the
/// deferred path. `Media` wraps device and structural-validation failures;
/// at mount time those are converted into a raw/blank fallback instead of
/// being surfaced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("insufficient resources to admit the request")]
    InsufficientResources,
    #[error("operation would block; retry with waiting allowed")]
    CantWait,
    #[error("volume is not mounted")]
    VolumeNotMounted,
    #[error("volume is no longer available")]
    VolumeUnavailable,
    #[error("object has a delete pending")]
    DeletePending,
    #[error("object already has a deferred close queued")]
    AlreadyQueued,
    #[error("volume is not locked by this handle")]
    NotLocked,
    #[error("access denied")]
    AccessDenied,
    #[error("object not found")]
    NotFound,
    #[error("object is not a directory")]
    NotADirectory,
    #[error("object is a directory")]
    IsADirectory,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("media failure: {0}")]
    Media(String),
    #[error("internal error")]
    Internal,
}

impl DriverError {
    /// Whether the condition is expected contention/state noise rather than
    /// a fault worth escalating to the event sink.
    pub fn is_expected(&self) -> bool {
        !matches!(self, DriverError::Internal | DriverError::Media(_))
    }
}
