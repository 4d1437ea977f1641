//! Error taxonomy shared across the daemon core.
//!
//! One enum covers every failure the core can produce; handlers map it to a
//! wire status in [`crate::response`]. Validation errors carry the message
//! verbatim to the client, so they are written in user-facing language.

use thiserror::Error;

use crate::start::supervisor::ExitInfo;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad name, bad field, tilde in HOME, unknown filter field.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// A registry uniqueness invariant would be violated.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Missing required env, bad working directory.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// The launcher child exited non-zero or was killed by a signal.
    #[error("launcher failed: {0}")]
    ChildFailed(ExitInfo),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::Invalid(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
