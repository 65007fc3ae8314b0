//! Durable result output.
//!
//! A job's output directory looks like this:
//!
//! ```text
//! <output>/
//!   results.jsonl     one line per Success or Duplicate item
//!   errors.jsonl      one line per Failed item
//!   health.json       destination health at the end of the run
//!   summary.json      counts and timings
//!   checkpoint.json   default checkpoint location
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::JobError;
use crate::health::HealthSnapshot;
use crate::item::{ItemError, ItemStatus, JobResult, Metadata, SkipReason, WorkItem};

pub const RESULTS_FILE: &str = "results.jsonl";
pub const ERRORS_FILE: &str = "errors.jsonl";
pub const HEALTH_FILE: &str = "health.json";
pub const SUMMARY_FILE: &str = "summary.json";
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Persists terminal items before they are checkpointed.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Durably store `item` and return a pointer to where it was written.
    ///
    /// Called only for items that will be checkpointed: Success, Failed and
    /// duplicates. The data must be on disk when this returns.
    async fn persist(&self, item: &WorkItem) -> Result<String, JobError>;
}

/// Shape of one line in `results.jsonl` / `errors.jsonl`.
#[derive(Debug, Serialize)]
struct ItemRecord<'a> {
    id: &'a str,
    position: usize,
    status: ItemStatus,
    attempts: u32,
    payload: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a Metadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a ItemError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duplicate_of: Option<&'a str>,
    duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    finished_at: Option<DateTime<Utc>>,
}

impl<'a> ItemRecord<'a> {
    fn from_item(item: &'a WorkItem) -> Self {
        let duplicate_of = match &item.skip_reason {
            Some(SkipReason::Duplicate { first_id }) => Some(first_id.as_str()),
            _ => None,
        };
        Self {
            id: &item.id,
            position: item.position,
            status: item.status,
            attempts: item.attempts,
            payload: &item.payload,
            metadata: (!item.metadata.is_empty()).then_some(&item.metadata),
            result: item.result.as_ref(),
            error: item.error.as_ref(),
            duplicate_of,
            duration_ms: item.duration_ms,
            finished_at: item.finished_at,
        }
    }
}

#[derive(Debug)]
struct JsonlFile {
    name: &'static str,
    path: PathBuf,
    file: File,
    lines: u64,
}

impl JsonlFile {
    async fn open(dir: &Path, name: &'static str) -> std::io::Result<Self> {
        let path = dir.join(name);
        // Continue numbering after whatever a previous run left behind.
        let lines = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                if bytes.last().is_some_and(|&b| b != b'\n') {
                    drop_torn_line(&path, &bytes).await?;
                }
                bytes.iter().filter(|&&b| b == b'\n').count() as u64
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            name,
            path,
            file,
            lines,
        })
    }

    async fn append(&mut self, line: &[u8]) -> std::io::Result<String> {
        self.file.write_all(line).await?;
        self.file.write_all(b"\n").await?;
        self.file.flush().await?;
        self.file.sync_data().await?;
        self.lines += 1;
        Ok(format!("{}:{}", self.name, self.lines))
    }
}

/// Cut a partial last line (an interrupted write) so the next record starts
/// on a line of its own.
async fn drop_torn_line(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let keep = bytes.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
    tracing::warn!(
        path = %path.display(),
        dropped_bytes = bytes.len() - keep,
        "discarding incomplete last line"
    );
    let file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(keep as u64).await?;
    file.sync_data().await
}

/// Appends items as JSON Lines to `results.jsonl` and `errors.jsonl`.
#[derive(Debug)]
pub struct JsonlSink {
    results: Mutex<JsonlFile>,
    errors: Mutex<JsonlFile>,
}

impl JsonlSink {
    /// Open (creating if needed) the output files under `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, JobError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| JobError::ResultWrite {
                path: dir.clone(),
                source,
            })?;

        let results = open_jsonl(&dir, RESULTS_FILE).await?;
        let errors = open_jsonl(&dir, ERRORS_FILE).await?;

        Ok(Self {
            results: Mutex::new(results),
            errors: Mutex::new(errors),
        })
    }
}

async fn open_jsonl(dir: &Path, name: &'static str) -> Result<JsonlFile, JobError> {
    JsonlFile::open(dir, name)
        .await
        .map_err(|source| JobError::ResultWrite {
            path: dir.join(name),
            source,
        })
}

#[async_trait]
impl ResultSink for JsonlSink {
    async fn persist(&self, item: &WorkItem) -> Result<String, JobError> {
        let target = match item.status {
            ItemStatus::Failed => &self.errors,
            _ => &self.results,
        };
        let line = serde_json::to_vec(&ItemRecord::from_item(item));

        let mut file = target.lock().await;
        let written = match line {
            Ok(line) => file.append(&line).await,
            Err(e) => Err(e.into()),
        };
        written.map_err(|source| JobError::ResultWrite {
            path: file.path.clone(),
            source,
        })
    }
}

/// Contents of `summary.json`.
#[derive(Debug, Serialize)]
pub struct JobSummary<'a> {
    pub job_id: Uuid,
    pub destination: &'a str,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub resumed: usize,
    pub aborted: bool,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl<'a> From<&'a JobResult> for JobSummary<'a> {
    fn from(result: &'a JobResult) -> Self {
        Self {
            job_id: result.job_id,
            destination: &result.destination,
            total: result.total,
            succeeded: result.succeeded,
            failed: result.failed,
            skipped: result.skipped,
            resumed: result.resumed,
            aborted: result.aborted,
            cancelled: result.cancelled,
            started_at: result.started_at,
            finished_at: result.finished_at,
            duration_ms: result.duration_ms(),
        }
    }
}

/// Write `summary.json` and `health.json` for a finished job.
pub async fn write_report(dir: &Path, result: &JobResult) -> Result<(), JobError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| JobError::ResultWrite {
            path: dir.to_path_buf(),
            source,
        })?;

    let health = result.destination_health.clone().unwrap_or_default();
    write_json(&dir.join(HEALTH_FILE), &health).await?;
    write_json(&dir.join(SUMMARY_FILE), &JobSummary::from(result)).await?;
    tracing::debug!(dir = %dir.display(), "job report written");
    Ok(())
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), JobError> {
    let to_err = |source: std::io::Error| JobError::ResultWrite {
        path: path.to_path_buf(),
        source,
    };
    let mut bytes = serde_json::to_vec_pretty(value).map_err(|e| to_err(e.into()))?;
    bytes.push(b'\n');
    tokio::fs::write(path, bytes).await.map_err(to_err)
}

/// Read back a health report written by [`write_report`].
pub async fn read_health(dir: &Path) -> std::io::Result<HealthSnapshot> {
    let bytes = tokio::fs::read(dir.join(HEALTH_FILE)).await?;
    Ok(serde_json::from_slice(&bytes)?)
}
