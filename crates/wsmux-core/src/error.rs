//! Error types for wsmux.

use thiserror::Error;

use crate::session::SessionId;

/// Main error type for wsmux operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// PTY allocation or control failure.
    #[error("pty error: {message}")]
    Pty { message: String },

    /// Fork/exec failure while starting a child process.
    #[error("spawn error: {message}")]
    Spawn { message: String },

    /// Session not found for given ID.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// Operation invalid for the session's current lifecycle state.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Malformed session id string.
    #[error("invalid session id: {message}")]
    InvalidSessionId { message: String },

    /// Channel to a background task is closed.
    #[error("channel error: {message}")]
    Channel { message: String },
}

impl Error {
    /// Returns true if this error came from calling an operation against a
    /// missing session or one in the wrong lifecycle state.
    ///
    /// These indicate a stale handle or a caller bug; retrying the same call
    /// without changing registry state won't help.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Error::SessionNotFound(_) | Error::InvalidState { .. }
        )
    }

    /// Returns true if this error came from the OS layer (descriptor,
    /// fork/exec, or plain I/O failure).
    pub fn is_system(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Pty { .. } | Error::Spawn { .. }
        )
    }
}

/// Convenience result type for wsmux operations.
pub type Result<T> = std::result::Result<T, Error>;
