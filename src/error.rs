//! Error types for worker-hub.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::worker::WorkerId;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Raised synchronously by worker construction.
#[derive(Debug, thiserror::Error)]
pub enum ConstructionError {
    #[error("No worker source given: set exactly one of inline code or file")]
    MissingSource,

    #[error("Ambiguous worker source: both inline code and file {file} were given")]
    AmbiguousSource { file: PathBuf },

    #[error("Failed to spawn worker from {origin}: {reason}")]
    Spawn { origin: String, reason: String },
}

/// Errors returned by operations on a single worker handle.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Invalid payload: {reason}")]
    InvalidPayload { reason: String },

    #[error("Worker {id} is stopped")]
    Stopped { id: WorkerId },

    #[error("Worker {id} disconnected: its execution unit no longer accepts messages")]
    Disconnected { id: WorkerId },

    #[error("Failed to terminate worker {id}: {reason}")]
    Terminate { id: WorkerId, reason: String },
}

/// Failures collected by a full `stop_all` pass.
#[derive(Debug, thiserror::Error)]
#[error("{} worker(s) failed to stop cleanly", .failures.len())]
pub struct StopAllError {
    pub failures: Vec<(WorkerId, WorkerError)>,
}

/// Kind of runtime fault reported by an execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The unit wrote to its error stream.
    Stderr,
    /// The unit exited on its own with a non-success status.
    Exit,
    /// Reading from or writing to the unit failed.
    Io,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stderr => "stderr",
            Self::Exit => "exit",
            Self::Io => "io",
        };
        write!(f, "{s}")
    }
}

/// A runtime fault of an execution unit.
///
/// Never returned from a call; always delivered asynchronously through the
/// owning handle's `error` event, serialized as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub occurred_at: DateTime<Utc>,
}

impl ExecutionFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            exit_code: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn exited(code: Option<i32>) -> Self {
        let message = match code {
            Some(code) => format!("worker exited with status {code}"),
            None => "worker was terminated by a signal".to_string(),
        };
        Self {
            exit_code: code,
            ..Self::new(FailureKind::Exit, message)
        }
    }

    /// JSON form handed to `error` subscribers.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind,
            "message": self.message,
            "exit_code": self.exit_code,
            "occurred_at": self.occurred_at,
        })
    }
}
