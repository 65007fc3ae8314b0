use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::ItemStatus;
use crate::error::{ErrorKind, ExecutionError, JobError};

/// Key-value annotations carried from the input record through to output.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Structured failure captured on a failed item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ExecutionError> for ItemError {
    fn from(err: &ExecutionError) -> Self {
        Self {
            kind: err.kind,
            message: err.message.clone(),
        }
    }
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Why an item ended up Skipped instead of Success or Failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// The result was equivalent to one already produced by `first_id`.
    Duplicate { first_id: String },
    /// An earlier item failed and the job does not continue on error.
    Aborted,
    /// The job was cancelled before this item could finish.
    Cancelled,
    /// Already terminal in a previous run; restored from the checkpoint.
    Resumed,
}

impl SkipReason {
    /// Skipped items that were actually processed and must not run again on resume.
    pub fn is_processed(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Duplicate { first_id } => write!(f, "duplicate of item {first_id}"),
            SkipReason::Aborted => write!(f, "job aborted"),
            SkipReason::Cancelled => write!(f, "job cancelled"),
            SkipReason::Resumed => write!(f, "completed in a previous run"),
        }
    }
}

/// One independent unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Stable id: the explicit id of the input record, else its 1-based position.
    pub id: String,
    /// 0-based index in the normalized input sequence.
    pub position: usize,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: Metadata,
    pub status: ItemStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ItemError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    /// Where the result was persisted, when a result sink is attached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_location: Option<String>,
    /// Restored from a checkpoint rather than processed in this run.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub resumed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, position: usize, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            position,
            payload,
            metadata: Metadata::new(),
            status: ItemStatus::Pending,
            attempts: 0,
            result: None,
            error: None,
            skip_reason: None,
            result_location: None,
            resumed: false,
            started_at: None,
            finished_at: None,
            duration_ms: 0,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to a new status, stamping timestamps on entry to Processing and on
    /// reaching a terminal status.
    pub fn transition_to(&mut self, target: ItemStatus) -> Result<(), JobError> {
        if !self.status.can_transition_to(target) {
            return Err(JobError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: target,
            });
        }

        let now = Utc::now();
        self.status = target;
        match target {
            ItemStatus::Processing => self.started_at = Some(now),
            s if s.is_terminal() => {
                self.finished_at = Some(now);
                self.duration_ms = self
                    .started_at
                    .map(|start| (now - start).num_milliseconds().max(0) as u64)
                    .unwrap_or(0);
            }
            _ => {}
        }
        Ok(())
    }

    /// Pending → Processing.
    pub fn start(&mut self) -> Result<(), JobError> {
        self.transition_to(ItemStatus::Processing)
    }

    /// Count one more execution try. Returns the new attempt number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub fn succeed(&mut self, result: serde_json::Value) -> Result<(), JobError> {
        self.transition_to(ItemStatus::Success)?;
        self.result = Some(result);
        Ok(())
    }

    pub fn fail(&mut self, error: ItemError) -> Result<(), JobError> {
        self.transition_to(ItemStatus::Failed)?;
        self.error = Some(error);
        Ok(())
    }

    pub fn skip(&mut self, reason: SkipReason) -> Result<(), JobError> {
        self.transition_to(ItemStatus::Skipped)?;
        self.skip_reason = Some(reason);
        Ok(())
    }

    /// Restore a status recorded by a previous run.
    ///
    /// The result itself is not reloaded; `location` points at where it was
    /// persisted. A non-terminal recorded status is treated as Skipped.
    pub fn restore(&mut self, status: ItemStatus, location: Option<String>) {
        self.status = if status.is_terminal() {
            status
        } else {
            ItemStatus::Skipped
        };
        if self.status == ItemStatus::Skipped {
            self.skip_reason = Some(SkipReason::Resumed);
        }
        self.result_location = location;
        self.resumed = true;
        self.finished_at = Some(Utc::now());
    }

    /// Whether this terminal item should be recorded in the checkpoint, i.e.
    /// must not be dispatched again when the job is resumed.
    pub fn is_checkpointable(&self) -> bool {
        match self.status {
            ItemStatus::Success | ItemStatus::Failed => true,
            ItemStatus::Skipped => self
                .skip_reason
                .as_ref()
                .is_some_and(SkipReason::is_processed),
            ItemStatus::Pending | ItemStatus::Processing => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item() -> WorkItem {
        WorkItem::new("1", 0, json!("SELECT * WHERE { ?s ?p ?o }"))
    }

    #[test]
    fn new_item_is_pending() {
        let item = item();
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.attempts, 0);
        assert!(item.result.is_none());
        assert!(item.error.is_none());
        assert!(item.started_at.is_none());
    }

    #[test]
    fn success_path_sets_result_and_timestamps() {
        let mut item = item();
        item.start().unwrap();
        assert!(item.started_at.is_some());
        assert_eq!(item.begin_attempt(), 1);

        item.succeed(json!({"rows": 3})).unwrap();
        assert_eq!(item.status, ItemStatus::Success);
        assert_eq!(item.result, Some(json!({"rows": 3})));
        assert!(item.error.is_none());
        assert!(item.finished_at.is_some());
    }

    #[test]
    fn failure_sets_error_only() {
        let mut item = item();
        item.start().unwrap();
        item.begin_attempt();
        item.fail(ItemError {
            kind: ErrorKind::Permanent,
            message: "bad query".into(),
        })
        .unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
        assert!(item.result.is_none());
        assert_eq!(item.error.as_ref().unwrap().to_string(), "permanent: bad query");
    }

    #[test]
    fn terminal_items_reject_further_transitions() {
        let mut item = item();
        item.start().unwrap();
        item.succeed(json!(1)).unwrap();

        let err = item.fail(ItemError {
            kind: ErrorKind::Transient,
            message: "late".into(),
        });
        assert!(matches!(err, Err(JobError::InvalidTransition { .. })));
        assert!(item.error.is_none());
    }

    #[test]
    fn double_start_is_rejected() {
        let mut item = item();
        item.start().unwrap();
        assert!(item.start().is_err());
    }

    #[test]
    fn never_dispatched_item_can_be_skipped() {
        let mut item = item();
        item.skip(SkipReason::Aborted).unwrap();
        assert_eq!(item.status, ItemStatus::Skipped);
        assert_eq!(item.duration_ms, 0);
        assert_eq!(item.skip_reason.as_ref().unwrap().to_string(), "job aborted");
    }

    #[test]
    fn checkpointable_only_when_processed() {
        let mut dup = item();
        dup.start().unwrap();
        dup.skip(SkipReason::Duplicate {
            first_id: "0".into(),
        })
        .unwrap();
        assert!(dup.is_checkpointable());

        let mut cancelled = item();
        cancelled.skip(SkipReason::Cancelled).unwrap();
        assert!(!cancelled.is_checkpointable());

        assert!(!item().is_checkpointable());
    }

    #[test]
    fn restore_keeps_prior_terminal_status() {
        let mut item = item();
        item.restore(ItemStatus::Failed, Some("errors.jsonl:4".into()));
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.result_location.as_deref(), Some("errors.jsonl:4"));
        assert!(item.resumed);

        let mut unknown = WorkItem::new("2", 1, json!("q"));
        unknown.restore(ItemStatus::Pending, None);
        assert_eq!(unknown.status, ItemStatus::Skipped);
        assert_eq!(unknown.skip_reason, Some(SkipReason::Resumed));
    }

    #[test]
    fn serialization_skips_empty_fields() {
        let json = serde_json::to_value(item()).unwrap();
        assert_eq!(json["status"], "pending");
        assert!(json.get("result").is_none());
        assert!(json.get("metadata").is_none());

        let back: WorkItem = serde_json::from_value(json).unwrap();
        assert_eq!(back.id, "1");
    }
}
