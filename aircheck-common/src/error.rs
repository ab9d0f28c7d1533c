//! Common error types for aircheck

use thiserror::Error;

/// Common result type for aircheck operations
pub type Result<T> = std::result::Result<T, Error>;

/// How a failure should be treated by the escalation policy.
///
/// The kind is attached at the point the error is raised, so callers switch
/// on it instead of string-matching messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network failure, timeout, or server-side 5xx. Retried in place,
    /// then escalated to the fallback model.
    Transient,
    /// Credential/permission failure. Never retried; a different model
    /// cannot fix a bad key.
    Auth,
    /// Model output did not match the expected schema. One repair attempt,
    /// then fatal for the item.
    Validation,
    /// Bad input data (missing field, malformed time, unparseable date).
    /// Fatal for the item, never retried.
    Data,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Auth => "auth",
            ErrorKind::Validation => "validation",
            ErrorKind::Data => "data",
        };
        write!(f, "{}", s)
    }
}

/// Common error type across the aircheck pipeline
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Inference call failure, classified for the escalation policy
    #[error("Inference error ({kind}): {message}")]
    Inference { kind: ErrorKind, message: String },

    /// Bad input data on an item; fatal for that item
    #[error("Invalid data: {0}")]
    Data(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classification used by the escalation policy.
    ///
    /// Store and I/O failures are treated as transient at the call site
    /// that retries them; data errors are terminal for the item.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Inference { kind, .. } => *kind,
            Error::Data(_) => ErrorKind::Data,
            Error::Database(_) | Error::Io(_) => ErrorKind::Transient,
            Error::Config(_) | Error::NotFound(_) | Error::Internal(_) => ErrorKind::Data,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Error::Inference {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Error::Inference {
            kind: ErrorKind::Auth,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Inference {
            kind: ErrorKind::Validation,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inference_errors_carry_their_kind() {
        assert_eq!(Error::transient("503").kind(), ErrorKind::Transient);
        assert_eq!(Error::auth("bad key").kind(), ErrorKind::Auth);
        assert_eq!(Error::validation("no json").kind(), ErrorKind::Validation);
    }

    #[test]
    fn data_errors_are_terminal() {
        let err = Error::Data("start_time after end_time".into());
        assert_eq!(err.kind(), ErrorKind::Data);
    }

    #[test]
    fn display_includes_kind() {
        let err = Error::auth("API key was not set");
        assert_eq!(
            err.to_string(),
            "Inference error (auth): API key was not set"
        );
    }
}
