//! Durable recording of task and workflow outcomes
//!
//! The engine itself keeps registry state in memory only. A recorder is an
//! optional collaborator that receives every terminal task record and every
//! finished workflow. Recorder failures are logged by the caller, never fatal.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use orch_core::{Result, TaskRecord};

use crate::orchestrator::WorkflowOutcome;

#[async_trait]
pub trait TaskRecorder: Send + Sync {
    async fn record_task(&self, record: &TaskRecord) -> Result<()>;

    async fn record_workflow(&self, outcome: &WorkflowOutcome) -> Result<()>;
}

/// Keeps everything in memory; handy for tests and inspection.
#[derive(Default)]
pub struct MemoryRecorder {
    tasks: Mutex<Vec<TaskRecord>>,
    workflows: Mutex<Vec<WorkflowOutcome>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn tasks(&self) -> Vec<TaskRecord> {
        self.tasks.lock().await.clone()
    }

    pub async fn workflows(&self) -> Vec<WorkflowOutcome> {
        self.workflows.lock().await.clone()
    }
}

#[async_trait]
impl TaskRecorder for MemoryRecorder {
    async fn record_task(&self, record: &TaskRecord) -> Result<()> {
        self.tasks.lock().await.push(record.clone());
        Ok(())
    }

    async fn record_workflow(&self, outcome: &WorkflowOutcome) -> Result<()> {
        self.workflows.lock().await.push(outcome.clone());
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
enum Entry<'a> {
    Task(&'a TaskRecord),
    Workflow(&'a WorkflowOutcome),
}

/// Appends one JSON object per line to a file.
pub struct JsonLinesRecorder {
    path: PathBuf,
    // serializes appends so lines never interleave
    lock: Mutex<()>,
}

impl JsonLinesRecorder {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, entry: Entry<'_>) -> Result<()> {
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl TaskRecorder for JsonLinesRecorder {
    async fn record_task(&self, record: &TaskRecord) -> Result<()> {
        self.append(Entry::Task(record)).await
    }

    async fn record_workflow(&self, outcome: &WorkflowOutcome) -> Result<()> {
        self.append(Entry::Workflow(outcome)).await
    }
}
