//! Messages exchanged with worker processes.
//!
//! Every message is one codec frame. The parent writes to the worker's stdin, the worker
//! answers on its result channel. The first frame a worker reads is always a [`Bootstrap`].

use crate::error::RemoteError;
use crate::sharing::ModelHandle;
use crate::worker::WorkerKind;
use serde::{Deserialize, Serialize};

/// Model binding for a pooled worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolBinding {
    /// Persisted model, fetched once by the worker.
    pub model: ModelHandle,
    /// Thread budget for numeric libraries inside the worker.
    pub child_jobs: usize,
}

/// Once-per-process initialization data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bootstrap {
    /// Registered name of the operation or task to run.
    pub operation: String,
    /// Nesting level of the worker (parent level + 1).
    pub level: usize,
    /// Whether the worker should emit JSON records for the parent's log relay.
    pub relay_logs: bool,
    /// Present for pooled workers only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding: Option<PoolBinding>,
}

impl Bootstrap {
    /// Bootstrap for a one-shot isolated task.
    pub fn isolated(operation: impl Into<String>, level: usize, relay_logs: bool) -> Self {
        Self {
            operation: operation.into(),
            level,
            relay_logs,
            binding: None,
        }
    }

    /// Bootstrap for a pool worker bound to `model`.
    pub fn pooled(
        operation: impl Into<String>,
        level: usize,
        relay_logs: bool,
        model: ModelHandle,
        child_jobs: usize,
    ) -> Self {
        Self {
            operation: operation.into(),
            level,
            relay_logs,
            binding: Some(PoolBinding { model, child_jobs }),
        }
    }

    /// Which kind of worker this bootstrap starts.
    pub fn kind(&self) -> WorkerKind {
        if self.binding.is_some() {
            WorkerKind::Pooled
        } else {
            WorkerKind::Isolated
        }
    }
}

/// Request from parent to a pooled worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkRequest<A> {
    /// Apply the bound operation to one set of arguments.
    Invoke {
        /// Position of the input in the caller's sequence.
        seq: u64,
        args: A,
    },
    /// Graceful shutdown request.
    Exit,
}

/// Response from a pooled worker to its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkResponse<R> {
    /// Bootstrap finished; the worker is ready for work.
    Ready { pid: u32 },
    /// Bootstrap failed; the worker exits after sending this.
    InitFailed { error: RemoteError },
    /// Successful invocation.
    Output { seq: u64, value: R },
    /// The operation returned an error or panicked.
    Failed { seq: u64, error: RemoteError },
}

/// Outcome of an isolated task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSlot<T> {
    Success(T),
    Failure(RemoteError),
}

impl<T> From<Result<T, RemoteError>> for ResultSlot<T> {
    fn from(result: Result<T, RemoteError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(error) => Self::Failure(error),
        }
    }
}

impl<T> ResultSlot<T> {
    /// Convert back into a `Result`.
    pub fn into_result(self) -> Result<T, RemoteError> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{BufferCodec, Codec, JsonCodec};
    use crate::sharing::{PersistMethod, persist};
    use std::io::Cursor;

    #[test]
    fn test_work_request_serialization() {
        let req = WorkRequest::Invoke {
            seq: 7,
            args: (1u32, 2u32),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("invoke"));
        assert!(json.contains("\"seq\":7"));

        let parsed: WorkRequest<(u32, u32)> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, req);

        let exit = serde_json::to_string(&WorkRequest::<()>::Exit).unwrap();
        assert_eq!(exit, "\"exit\"");
    }

    #[test]
    fn test_work_response_serialization() {
        let ready = WorkResponse::<f64>::Ready { pid: 42 };
        let json = serde_json::to_string(&ready).unwrap();
        assert!(json.contains("ready"));

        let failed = WorkResponse::<f64>::Failed {
            seq: 3,
            error: RemoteError::new("ZeroDivision", "division by zero"),
        };
        let json = serde_json::to_string(&failed).unwrap();
        let parsed: WorkResponse<f64> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, failed);
    }

    #[test]
    fn test_bootstrap_kind() {
        let boot = Bootstrap::isolated("add", 1, true);
        assert_eq!(boot.kind(), WorkerKind::Isolated);
        let json = serde_json::to_string(&boot).unwrap();
        assert!(!json.contains("binding"));

        let persisted = persist(&vec![1u8, 2, 3], PersistMethod::Inline).unwrap();
        let boot = Bootstrap::pooled("score", 1, false, persisted.handle().clone(), 2);
        assert_eq!(boot.kind(), WorkerKind::Pooled);
    }

    #[test]
    fn test_bootstrap_through_both_codecs() {
        let persisted = persist(&vec![0.5f64; 16], PersistMethod::Inline).unwrap();
        let boot = Bootstrap::pooled("score", 2, true, persisted.handle().clone(), 3);

        let mut bytes = Vec::new();
        BufferCodec.write_frame(&mut bytes, &boot).unwrap();
        let back: Bootstrap = BufferCodec
            .read_frame(&mut Cursor::new(bytes))
            .unwrap()
            .unwrap();
        assert_eq!(back, boot);

        let mut bytes = Vec::new();
        JsonCodec.write_frame(&mut bytes, &boot).unwrap();
        let back: Bootstrap = JsonCodec
            .read_frame(&mut Cursor::new(bytes))
            .unwrap()
            .unwrap();
        assert_eq!(back, boot);
        assert_eq!(back.binding.unwrap().model.get::<Vec<f64>>().unwrap().len(), 16);
    }

    #[test]
    fn test_result_slot_conversion() {
        let ok: ResultSlot<i64> = Ok(5).into();
        assert_eq!(ok.clone().into_result(), Ok(5));

        let err: ResultSlot<i64> = Err(RemoteError::new("ZeroDivision", "division by zero")).into();
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("failure"));
        let back: ResultSlot<i64> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.into_result().unwrap_err().kind, "ZeroDivision");
    }
}
