//! Error types for modelops.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for modelops.
#[derive(Error, Debug)]
pub enum Error {
    #[error("subprocess failed with code {code}")]
    ProcessFailure { code: i32 },

    #[error("error in child process: {0}")]
    RemoteExecution(RemoteError),

    #[error("operation failed in worker {worker}: {source}")]
    OperationFailed {
        worker: usize,
        #[source]
        source: RemoteError,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("No operation named '{0}' is registered with this worker")]
    UnknownOperation(String),

    #[error("Model persistence error: {0}")]
    Persist(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for modelops operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The remote error carried by this failure, if it came from operation code.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::RemoteExecution(e) | Self::OperationFailed { source: e, .. } => Some(e),
            _ => None,
        }
    }
}

/// A failure raised by operation code, in a form that can cross a process boundary.
///
/// Operations return this from [`ModelOp::apply`](crate::ModelOp::apply) and
/// [`Task::run`](crate::Task::run). The worker sends it back over its result channel and the
/// parent rebuilds it unchanged, so `kind` is the only thing callers should match on.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    /// Short machine-readable category (e.g. `ZeroDivision`, `panic`).
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Error type returned by operation code.
pub type OpError = RemoteError;

impl RemoteError {
    /// Create an error of the given kind.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            payload: None,
        }
    }

    /// Attach structured details.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Build an error from a caught panic payload.
    pub fn from_panic(panic: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = panic.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = panic.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::new("panic", message)
    }
}

impl From<Error> for RemoteError {
    fn from(err: Error) -> Self {
        match err {
            Error::RemoteExecution(e) | Error::OperationFailed { source: e, .. } => e,
            other => Self::new("modelops", other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_process_failure_message() {
        let err = Error::ProcessFailure { code: 3 };
        assert_eq!(err.to_string(), "subprocess failed with code 3");
    }

    #[test]
    fn test_remote_execution_wraps_original() {
        let err = Error::RemoteExecution(RemoteError::new("ZeroDivision", "division by zero"));
        let msg = err.to_string();
        assert!(msg.contains("child process"));
        assert!(msg.contains("division by zero"));
        assert_eq!(err.remote().unwrap().kind, "ZeroDivision");
    }

    #[test]
    fn test_operation_failed_has_source() {
        use std::error::Error as _;

        let err = Error::OperationFailed {
            worker: 2,
            source: RemoteError::new("ValueError", "bad item"),
        };
        assert!(err.to_string().contains("worker 2"));
        assert_eq!(err.source().unwrap().to_string(), "ValueError: bad item");
    }

    #[test]
    fn test_remote_error_serialization() {
        let err = RemoteError::new("KeyError", "missing item 7")
            .with_payload(serde_json::json!({"item": 7}));
        let json = serde_json::to_string(&err).unwrap();
        let back: RemoteError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);

        let bare = serde_json::to_string(&RemoteError::new("x", "y")).unwrap();
        assert!(!bare.contains("payload"));
    }

    #[test]
    fn test_remote_error_from_panic() {
        let caught = std::panic::catch_unwind(|| panic!("boom {}", 42)).unwrap_err();
        let err = RemoteError::from_panic(caught);
        assert_eq!(err.kind, "panic");
        assert_eq!(err.message, "boom 42");

        let caught = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(RemoteError::from_panic(caught).message, "static");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed");
        let err: Error = io_err.into();
        assert!(err.to_string().contains("pipe closed"));
        assert!(err.remote().is_none());
    }

    #[test]
    fn test_error_into_remote() {
        let remote: RemoteError = Error::Config("bad".into()).into();
        assert_eq!(remote.kind, "modelops");
        assert!(remote.message.contains("bad"));
    }
}
