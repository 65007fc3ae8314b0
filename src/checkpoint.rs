//! Durable record of which items reached a terminal state.
//!
//! The checkpoint is a small JSON document rewritten atomically on every
//! flush: serialize, write `<file>.tmp`, fsync, rename over the target. A crash
//! mid-write leaves the previous checkpoint intact.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::JobError;
use crate::item::{ItemStatus, WorkItem};

const CHECKPOINT_VERSION: u32 = 1;

/// Terminal status of a completed item and where its result was persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultPointer {
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl ResultPointer {
    pub fn for_item(item: &WorkItem) -> Self {
        Self {
            status: item.status,
            location: item.result_location.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub completed_ids: BTreeSet<String>,
    #[serde(default)]
    pub result_pointers: BTreeMap<String, ResultPointer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Utc>>,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            completed_ids: BTreeSet::new(),
            result_pointers: BTreeMap::new(),
            saved_at: None,
        }
    }
}

impl Checkpoint {
    pub fn is_empty(&self) -> bool {
        self.completed_ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.completed_ids.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.completed_ids.contains(id)
    }

    pub fn pointer(&self, id: &str) -> Option<&ResultPointer> {
        self.result_pointers.get(id)
    }

    fn record(&mut self, id: String, pointer: ResultPointer) {
        self.result_pointers.insert(id.clone(), pointer);
        self.completed_ids.insert(id);
    }
}

/// Items split by whether a previous run already finished them.
#[derive(Debug, Default)]
pub struct ResumePlan {
    /// Restored to their recorded terminal status, in input order.
    pub completed: Vec<WorkItem>,
    /// Still to be dispatched, in input order.
    pub pending: Vec<WorkItem>,
}

/// Split normalized items against a loaded checkpoint.
///
/// Items listed as completed take the status recorded in their result pointer;
/// without a pointer they are marked Skipped (resumed).
pub fn plan_resume(checkpoint: &Checkpoint, items: Vec<WorkItem>) -> ResumePlan {
    let mut plan = ResumePlan::default();
    for mut item in items {
        if checkpoint.contains(&item.id) {
            match checkpoint.pointer(&item.id) {
                Some(pointer) => item.restore(pointer.status, pointer.location.clone()),
                None => item.restore(ItemStatus::Skipped, None),
            }
            plan.completed.push(item);
        } else {
            plan.pending.push(item);
        }
    }
    plan
}

/// File-backed checkpoint with a single writer at a time.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    /// What is on disk; read lazily before the first write.
    state: Mutex<Option<Checkpoint>>,
}

impl CheckpointStore {
    /// Bind a store to `path`. Nothing is read until [`load`](Self::load).
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the checkpoint. A missing or empty file is an empty checkpoint.
    pub async fn load(&self) -> Result<Checkpoint, JobError> {
        let checkpoint = read_checkpoint(&self.path).await?;
        *self.state.lock().await = Some(checkpoint.clone());
        Ok(checkpoint)
    }

    /// Record one completed item and rewrite the file.
    pub async fn append(
        &self,
        id: impl Into<String>,
        pointer: ResultPointer,
    ) -> Result<(), JobError> {
        self.append_all(vec![(id.into(), pointer)]).await
    }

    /// Record a batch of completed items with one atomic rewrite.
    pub async fn append_all(&self, entries: Vec<(String, ResultPointer)>) -> Result<(), JobError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        if state.is_none() {
            *state = Some(read_checkpoint(&self.path).await?);
        }
        let mut next = state.clone().unwrap_or_default();
        let added = entries.len();
        for (id, pointer) in entries {
            next.record(id, pointer);
        }
        next.saved_at = Some(Utc::now());

        write_atomic(&self.path, &next)
            .await
            .map_err(|source| JobError::CheckpointWrite {
                path: self.path.clone(),
                source,
            })?;

        tracing::debug!(
            path = %self.path.display(),
            added,
            completed = next.len(),
            "checkpoint written"
        );
        *state = Some(next);
        Ok(())
    }
}

async fn read_checkpoint(path: &Path) -> Result<Checkpoint, JobError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Checkpoint::default()),
        Err(e) => {
            return Err(JobError::CheckpointRead {
                path: path.to_path_buf(),
                reason: e.to_string(),
            });
        }
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Checkpoint::default());
    }
    serde_json::from_slice(&bytes).map_err(|e| JobError::CheckpointRead {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name: OsString = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("checkpoint"));
    name.push(".tmp");
    path.with_file_name(name)
}

async fn write_atomic(path: &Path, checkpoint: &Checkpoint) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    let bytes = serde_json::to_vec_pretty(checkpoint)?;
    let tmp = temp_path(path);
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await
}
