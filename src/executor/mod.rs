//! The injected work function.
//!
//! The orchestrator knows nothing about what an item *does*; it hands each
//! attempt to a [`WorkExecutor`] and classifies the [`ExecutionError`] it gets
//! back. Query execution, discovery or benchmarking are separate
//! implementations of the same trait.

pub mod http;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::time::Instant;

use crate::error::ExecutionError;
use crate::item::{Metadata, WorkItem};

pub use http::HttpExecutor;

/// Everything an executor gets for one attempt.
#[derive(Debug, Clone)]
pub struct WorkRequest {
    pub item_id: String,
    pub destination: String,
    pub payload: Value,
    pub metadata: Metadata,
    /// 1-based attempt number.
    pub attempt: u32,
    /// The attempt is abandoned at this instant.
    pub deadline: Instant,
}

impl WorkRequest {
    /// Request for the current attempt of `item`.
    pub fn for_item(item: &WorkItem, destination: &str, deadline: Instant) -> Self {
        Self {
            item_id: item.id.clone(),
            destination: destination.to_string(),
            payload: item.payload.clone(),
            metadata: item.metadata.clone(),
            attempt: item.attempts,
            deadline,
        }
    }

    /// Time left until the deadline (zero once it has passed).
    pub fn remaining(&self) -> std::time::Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// A unit of work that can be invoked concurrently from many workers.
#[async_trait]
pub trait WorkExecutor: Send + Sync {
    async fn execute(&self, request: &WorkRequest) -> Result<Value, ExecutionError>;
}

/// Returns the payload without doing any I/O. Used for dry runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoExecutor;

#[async_trait]
impl WorkExecutor for EchoExecutor {
    async fn execute(&self, request: &WorkRequest) -> Result<Value, ExecutionError> {
        Ok(json!({
            "id": request.item_id,
            "payload": request.payload,
        }))
    }
}
