//! Error types for the worker pool

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for pool operations
pub type Result<T> = std::result::Result<T, PoolError>;

/// A failure raised by task or start logic
///
/// Worker code can fail in two ways and the distinction survives the
/// process boundary: a genuine error (message plus optional stack text)
/// or an arbitrary value that was thrown as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Fault {
    /// A reconstructable error
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },

    /// A non-error value delivered verbatim
    Value { value: serde_json::Value },
}

impl Fault {
    /// Create an error fault
    pub fn error(message: impl Into<String>) -> Self {
        Fault::Error {
            message: message.into(),
            stack: None,
        }
    }

    /// Create an error fault carrying stack text
    pub fn error_with_stack(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Fault::Error {
            message: message.into(),
            stack: Some(stack.into()),
        }
    }

    /// Create a fault for a thrown non-error value
    pub fn value(value: serde_json::Value) -> Self {
        Fault::Value { value }
    }

    /// Whether this fault is a genuine error object
    pub fn is_error_object(&self) -> bool {
        matches!(self, Fault::Error { .. })
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fault::Error { message, .. } => write!(f, "{}", message),
            Fault::Value { value } => write!(f, "thrown value: {}", value),
        }
    }
}

/// Errors produced by the scheduler, its workers and the RPC layer
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// Task (or start) logic failed
    #[error("{0}")]
    Task(Fault),

    /// Worker failed to start after its attempt budget
    #[error("worker {worker} failed to start: {source}")]
    Init {
        worker: String,
        #[source]
        source: Box<PoolError>,
    },

    /// Task was canceled before it was scheduled
    #[error("task canceled: {0}")]
    Canceled(String),

    /// Task waited in the queue longer than its timeout
    #[error("TIMEOUT")]
    QueueTimeout,

    /// Pool start left no usable worker
    #[error("no pools are available")]
    NoPoolsAvailable,

    /// Kill could not confirm that the process exited
    #[error("process {pid} is still alive after kill")]
    ProcessStillAlive { pid: u32 },

    /// Channel was torn down with requests in flight
    #[error("destination was closed")]
    DestinationClosed,

    /// RPC request was not answered in time
    #[error("rpc request timed out after {0:?}")]
    RpcTimeout(Duration),

    /// Every correlation id is pending or waiting for a late reply
    #[error("correlation ids exhausted")]
    CorrelationExhausted,

    /// Kill mode string did not name a known mode
    #[error("unknown kill mode: {0}")]
    UnknownKillMode(String),

    /// Worker behavior has no task logic
    #[error("worker does not implement execute_task")]
    MissingExecuteTask,

    /// Worker behavior has no restart logic
    #[error("restart is not supported by this worker")]
    RestartUnsupported,

    /// Remote side answered with something we did not expect
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// I/O error (process spawn, pipes)
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    /// Envelope encoding or decoding error
    #[error("codec error: {0}")]
    Codec(String),
}

impl PoolError {
    /// Create a task error from a message
    pub fn task(message: impl Into<String>) -> Self {
        PoolError::Task(Fault::error(message))
    }

    /// Create a task error for a thrown non-error value
    pub fn thrown(value: serde_json::Value) -> Self {
        PoolError::Task(Fault::value(value))
    }

    /// Convert into a fault suitable for crossing a process boundary
    ///
    /// Thrown values stay values; every other error becomes an error
    /// object carrying its display text.
    pub fn to_fault(&self) -> Fault {
        match self {
            PoolError::Task(fault) => fault.clone(),
            other => Fault::Error {
                message: other.to_string(),
                stack: std::error::Error::source(other).map(|source| source.to_string()),
            },
        }
    }

    /// The thrown value, if this error carries one
    pub fn thrown_value(&self) -> Option<&serde_json::Value> {
        match self {
            PoolError::Task(Fault::Value { value }) => Some(value),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PoolError {
    fn from(err: std::io::Error) -> Self {
        PoolError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for PoolError {
    fn from(err: serde_json::Error) -> Self {
        PoolError::Codec(err.to_string())
    }
}

impl From<Fault> for PoolError {
    fn from(fault: Fault) -> Self {
        PoolError::Task(fault)
    }
}
