//! Error taxonomy for fanout.
//!
//! Three layers:
//! - [`ParseError`]: the input source could not be normalized; the job never starts.
//! - [`ExecutionError`]: one attempt of one item failed; recovered locally by the
//!   orchestrator and captured on the item.
//! - [`JobError`]: the job invocation itself failed (bad config, unreadable input,
//!   durability failure).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::item::ItemStatus;

/// Errors raised while normalizing an input source into work items.
///
/// `index` is the 0-based record index within the source (data rows for
/// tabular sources, elements for structured lists, lines for JSON Lines).
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("record {index}: missing required field `{field}`")]
    MissingField { index: usize, field: String },

    #[error("record {index}: {message}")]
    InvalidRecord { index: usize, message: String },

    #[error("record {index}: duplicate item id `{id}`")]
    DuplicateId { id: String, index: usize },

    #[error("tabular header has no `{0}` column")]
    MissingColumn(String),

    #[error("record {index}: malformed JSON: {source}")]
    Json {
        index: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed tabular input: {0}")]
    Csv(#[from] csv::Error),

    #[error("failed to read input: {0}")]
    Io(#[from] std::io::Error),
}

/// Classifies an execution failure for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Timeout, connectivity, rate-limited or 5xx from the destination.
    Transient,
    /// Invalid payload or the destination rejected the request as malformed.
    Permanent,
    /// The per-item deadline elapsed before the work function returned.
    DeadlineExceeded,
}

impl ErrorKind {
    /// Transient failures and missed deadlines are eligible for another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::DeadlineExceeded)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Permanent => write!(f, "permanent"),
            ErrorKind::DeadlineExceeded => write!(f, "deadline_exceeded"),
        }
    }
}

/// Failure of a single attempt returned by a [`WorkExecutor`](crate::executor::WorkExecutor).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} failure: {message}")]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
    /// Minimum wait requested by the destination (e.g. a `Retry-After` header).
    pub retry_after: Option<Duration>,
}

impl ExecutionError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn deadline_exceeded(timeout: Duration) -> Self {
        Self {
            kind: ErrorKind::DeadlineExceeded,
            message: format!("no result within {}ms", timeout.as_millis()),
            retry_after: None,
        }
    }

    /// Rate-limited by the destination; retried no sooner than `retry_after`.
    pub fn rate_limited(retry_after: Duration) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: format!("rate limited, retry after {}ms", retry_after.as_millis()),
            retry_after: Some(retry_after),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Errors that fail a whole job invocation.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid job configuration: {0}")]
    InvalidConfig(String),

    #[error("input error: {0}")]
    Parse(#[from] ParseError),

    #[error("checkpoint {path} is unreadable: {reason}")]
    CheckpointRead { path: PathBuf, reason: String },

    #[error("failed to write checkpoint {path}: {source}")]
    CheckpointWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to persist result to {path}: {source}")]
    ResultWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("item {id}: cannot transition from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: ItemStatus,
        to: ItemStatus,
    },

    #[error("item {id}: processing panicked: {message}")]
    ItemPanicked { id: String, message: String },
}
