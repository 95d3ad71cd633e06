use std::time::SystemTime;

use tokio::sync::oneshot;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the lease subsystem.
///
/// Conflicts (`Held`, `NotHeld`, `InvalidHolder`) and validation failures
/// (`Invalid`) are never retried; only `Unavailable` is eligible for
/// backoff retry before escalating to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Another holder has an unexpired lease on the key.
    #[error("lease held by {holder}")]
    Held { holder: String, expiry: SystemTime },

    /// No lease exists for the key.
    #[error("lease not held")]
    NotHeld,

    /// The lease exists but is held by someone else.
    #[error("lease held by another holder: {holder}")]
    InvalidHolder { holder: String },

    /// Malformed request or configuration; fatal to the call.
    #[error("invalid: {0}")]
    Invalid(String),

    /// The caller's deadline or cancellation fired while waiting.
    #[error("cancelled")]
    Cancelled,

    /// Transient store or connectivity failure.
    #[error("lease store unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn unavailable<E: Into<anyhow::Error>>(err: E) -> Error {
        Error::Unavailable(err.into())
    }

    /// Whether the error is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Unavailable(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Identity of the conflicting holder, if the error reports one.
    pub fn held_by(&self) -> Option<&str> {
        match self {
            Error::Held { holder, .. } => Some(holder),
            Error::InvalidHolder { holder } => Some(holder),
            _ => None,
        }
    }
}

// Channel endpoints only close when the peer task has shut down; surface
// that to callers as a cancellation rather than a distinct failure.
impl<T> From<flume::SendError<T>> for Error {
    fn from(_: flume::SendError<T>) -> Error {
        Error::Cancelled
    }
}

impl From<flume::RecvError> for Error {
    fn from(_: flume::RecvError) -> Error {
        Error::Cancelled
    }
}

impl From<oneshot::error::RecvError> for Error {
    fn from(_: oneshot::error::RecvError) -> Error {
        Error::Cancelled
    }
}
