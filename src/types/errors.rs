//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and carry a
//! stable wire code so they survive a round trip through the coordination
//! service transport.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for jobkeeper.
#[derive(Error, Debug)]
pub enum Error {
    /// A call or one of its arguments cannot be serialized into a state blob.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Optimistic concurrency violation on a CAS write.
    #[error("version conflict: {0}")]
    VersionConflict(String),

    /// Key or job not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Create-if-absent hit an existing key.
    #[error("entry exists: {0}")]
    EntryExists(String),

    /// The coordination session is gone (expired or closed).
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// Transport to the coordination service failed; the outcome of any
    /// in-flight write is unknown.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Rule registered against a hook that a strict group never defined.
    #[error("undefined hook: {0}")]
    UndefinedHook(String),

    /// Validation errors.
    #[error("validation error: {0}")]
    Validation(String),

    /// Invalid job state transition.
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Map to the wire error code used by the coordination service transport.
    pub fn to_ipc_error_code(&self) -> &'static str {
        match self {
            Error::Encoding(_) => "ENCODING",
            Error::VersionConflict(_) => "VERSION_CONFLICT",
            Error::NotFound(_) => "NOT_FOUND",
            Error::EntryExists(_) => "ENTRY_EXISTS",
            Error::SessionExpired(_) => "SESSION_EXPIRED",
            Error::ConnectionLost(_) => "CONNECTION_LOST",
            Error::UndefinedHook(_) => "UNDEFINED_HOOK",
            Error::Validation(_) => "INVALID_ARGUMENT",
            Error::StateTransition(_) => "FAILED_PRECONDITION",
            Error::Internal(_) | Error::Serialization(_) | Error::Io(_) => "INTERNAL",
        }
    }

    /// Rebuild an error received over the wire.
    pub fn from_ipc_error(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            "ENCODING" => Error::Encoding(message),
            "VERSION_CONFLICT" => Error::VersionConflict(message),
            "NOT_FOUND" => Error::NotFound(message),
            "ENTRY_EXISTS" => Error::EntryExists(message),
            "SESSION_EXPIRED" => Error::SessionExpired(message),
            "CONNECTION_LOST" => Error::ConnectionLost(message),
            "UNDEFINED_HOOK" => Error::UndefinedHook(message),
            "INVALID_ARGUMENT" => Error::Validation(message),
            "FAILED_PRECONDITION" => Error::StateTransition(message),
            _ => Error::Internal(message),
        }
    }

    /// Errors a caller may recover from by re-reading state and retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::VersionConflict(_) | Error::ConnectionLost(_))
    }
}

// Convenience constructors
impl Error {
    pub fn encoding(msg: impl Into<String>) -> Self {
        Self::Encoding(msg.into())
    }

    pub fn version_conflict(msg: impl Into<String>) -> Self {
        Self::VersionConflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn entry_exists(msg: impl Into<String>) -> Self {
        Self::EntryExists(msg.into())
    }

    pub fn session_expired(msg: impl Into<String>) -> Self {
        Self::SessionExpired(msg.into())
    }

    pub fn connection_lost(msg: impl Into<String>) -> Self {
        Self::ConnectionLost(msg.into())
    }

    pub fn undefined_hook(msg: impl Into<String>) -> Self {
        Self::UndefinedHook(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes_round_trip() {
        let errors = vec![
            Error::encoding("e"),
            Error::version_conflict("v"),
            Error::not_found("n"),
            Error::entry_exists("x"),
            Error::session_expired("s"),
            Error::connection_lost("c"),
            Error::undefined_hook("h"),
            Error::validation("i"),
            Error::state_transition("t"),
        ];

        for err in errors {
            let code = err.to_ipc_error_code();
            let back = Error::from_ipc_error(code, "msg");
            assert_eq!(back.to_ipc_error_code(), code);
        }
    }

    #[test]
    fn test_unknown_code_is_internal() {
        let err = Error::from_ipc_error("SOMETHING_ELSE", "boom");
        assert!(matches!(err, Error::Internal(ref m) if m == "boom"));
    }

    #[test]
    fn test_retryable() {
        assert!(Error::version_conflict("x").is_retryable());
        assert!(Error::connection_lost("x").is_retryable());
        assert!(!Error::encoding("x").is_retryable());
        assert!(!Error::undefined_hook("x").is_retryable());
    }
}
