//! Concurrent, resumable execution of independent work items.
//!
//! Input records are normalized into [`item::WorkItem`]s and handed to an
//! [`orchestrator::Orchestrator`], which runs them through an injected
//! [`executor::WorkExecutor`] with rate limiting, retries, deduplication,
//! health tracking and checkpointing.

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod dedup;
pub mod error;
pub mod executor;
pub mod health;
pub mod item;
pub mod logging;
pub mod normalize;
pub mod orchestrator;
pub mod output;
pub mod rate_limit;
pub mod ui;

pub use error::{ErrorKind, ExecutionError, JobError, ParseError};
pub use executor::{EchoExecutor, HttpExecutor, WorkExecutor, WorkRequest};
pub use item::{ItemStatus, JobConfig, JobResult, WorkItem};
pub use orchestrator::{JobObserver, Orchestrator};
