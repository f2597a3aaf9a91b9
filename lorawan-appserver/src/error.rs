//! The error taxonomy shared by every component of the server.
//!
//! Variants carry a stable machine-readable name so peers and
//! transports can match on them without parsing messages.

/// Errors produced by the application server and its collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("entity not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("no application session key for device {dev_eui} and session {session_key_id}")]
    SessionKeyUnknown { dev_eui: String, session_key_id: String },

    #[error("payload formatter failed: {0}")]
    Formatter(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// Stable name of the error kind.
    pub fn name(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::Unauthenticated => "unauthenticated",
            Error::PermissionDenied(_) => "permission_denied",
            Error::SessionKeyUnknown { .. } => "session_key_unknown",
            Error::Formatter(_) => "formatter_error",
            Error::Transient(_) => "transient",
            Error::Fatal(_) => "fatal",
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
