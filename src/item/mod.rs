mod job;
mod status;
mod work_item;

pub use job::{ExecutionMode, JobConfig, JobResult, RetryPolicy};
pub use status::ItemStatus;
pub use work_item::{ItemError, Metadata, SkipReason, WorkItem};
