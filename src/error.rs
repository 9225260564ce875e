//! Typed error taxonomy shared across the execution dispatch core.

use std::fmt;

/// Stable classification of a [`CoreError`], independent of the human-readable cause.
///
/// Callers branch on `kind()`; the `Display` output is for humans/logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    RuntimeUnavailable,
    ImageUnavailable,
    Timeout,
    SandboxUnavailable,
    InputFileError,
    SessionNotFound,
    SessionExpired,
    Cancelled,
    InternalError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::RuntimeUnavailable => "runtime_unavailable",
            ErrorKind::ImageUnavailable => "image_unavailable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::SandboxUnavailable => "sandbox_unavailable",
            ErrorKind::InputFileError => "input_file_error",
            ErrorKind::SessionNotFound => "session_not_found",
            ErrorKind::SessionExpired => "session_expired",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InternalError => "internal_error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("no image available, tried: {tried:?}")]
    ImageUnavailable { tried: Vec<String> },

    #[error("timed out during {where_}")]
    Timeout { where_: String },

    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    #[error("input file {id} rejected: {cause}")]
    InputFileError { id: String, cause: String },

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("session {0} expired")]
    SessionExpired(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    InternalError(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::RuntimeUnavailable(_) => ErrorKind::RuntimeUnavailable,
            CoreError::ImageUnavailable { .. } => ErrorKind::ImageUnavailable,
            CoreError::Timeout { .. } => ErrorKind::Timeout,
            CoreError::SandboxUnavailable(_) => ErrorKind::SandboxUnavailable,
            CoreError::InputFileError { .. } => ErrorKind::InputFileError,
            CoreError::SessionNotFound(_) => ErrorKind::SessionNotFound,
            CoreError::SessionExpired(_) => ErrorKind::SessionExpired,
            CoreError::Cancelled => ErrorKind::Cancelled,
            CoreError::InternalError(_) => ErrorKind::InternalError,
        }
    }

    pub fn cause(&self) -> String {
        self.to_string()
    }

    pub fn internal(cause: impl Into<String>) -> Self {
        CoreError::InternalError(cause.into())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::InternalError(e.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
