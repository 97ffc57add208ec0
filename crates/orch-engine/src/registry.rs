//! Task Registry - single source of truth for task existence and state
//!
//! Records live in exactly one of three partitions: active (Spawning/Running),
//! completed, or failed (Failed/Timeout). All mutation goes through one mutex,
//! so a terminal transition and the partition move happen atomically and
//! snapshot reads always see a consistent point in time.
//!
//! Every record owns a completion signal (`watch` channel) resolved exactly once
//! at its terminal transition with the terminal record itself; waiters await it
//! instead of polling. Records are never evicted: once registered, a task id
//! stays in exactly one partition for the registry's lifetime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use orch_core::{Error, Result, StatusUpdate, TaskRecord, TaskStatus};

use crate::metrics::OrchestratorMetrics;
use crate::recorder::TaskRecorder;

/// Registry partition a record currently lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    Active,
    Completed,
    Failed,
}

impl Partition {
    fn for_status(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Spawning | TaskStatus::Running => Partition::Active,
            TaskStatus::Completed => Partition::Completed,
            TaskStatus::Failed | TaskStatus::Timeout => Partition::Failed,
        }
    }
}

/// Event emitted when task state changes
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Registered(TaskRecord),
    StatusChanged {
        task_id: String,
        agent_type: String,
        status: TaskStatus,
    },
}

/// Counts per partition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Default)]
struct RegistryState {
    active: HashMap<String, TaskRecord>,
    completed: HashMap<String, TaskRecord>,
    failed: HashMap<String, TaskRecord>,
    signals: HashMap<String, watch::Sender<Option<TaskRecord>>>,
}

impl RegistryState {
    fn find(&self, task_id: &str) -> Option<(&TaskRecord, Partition)> {
        self.active
            .get(task_id)
            .map(|r| (r, Partition::Active))
            .or_else(|| self.completed.get(task_id).map(|r| (r, Partition::Completed)))
            .or_else(|| self.failed.get(task_id).map(|r| (r, Partition::Failed)))
    }

    fn partition_mut(&mut self, partition: Partition) -> &mut HashMap<String, TaskRecord> {
        match partition {
            Partition::Active => &mut self.active,
            Partition::Completed => &mut self.completed,
            Partition::Failed => &mut self.failed,
        }
    }
}

fn sorted(mut records: Vec<TaskRecord>) -> Vec<TaskRecord> {
    records.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.task_id.cmp(&b.task_id)));
    records
}

/// Task registry. Owned and injected; never global.
pub struct TaskRegistry {
    state: Mutex<RegistryState>,
    metrics: Arc<OrchestratorMetrics>,
    recorder: Option<Arc<dyn TaskRecorder>>,
    event_sender: broadcast::Sender<TaskEvent>,
}

impl TaskRegistry {
    pub fn new(metrics: Arc<OrchestratorMetrics>) -> Self {
        let (event_sender, _) = broadcast::channel(1000);
        Self {
            state: Mutex::new(RegistryState::default()),
            metrics,
            recorder: None,
            event_sender,
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn TaskRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn metrics(&self) -> &Arc<OrchestratorMetrics> {
        &self.metrics
    }

    /// Subscribe to task events
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.event_sender.subscribe()
    }

    /// Insert a new record in the Spawning state.
    pub async fn register(&self, record: TaskRecord) -> Result<()> {
        if record.status != TaskStatus::Spawning {
            return Err(Error::internal(format!(
                "task {} must be registered in spawning state, got {}",
                record.task_id, record.status
            )));
        }

        let mut state = self.state.lock().await;
        if state.find(&record.task_id).is_some() {
            warn!(task_id = %record.task_id, "Duplicate task registration rejected");
            return Err(Error::DuplicateTask(record.task_id));
        }

        let (signal, _) = watch::channel(None);
        state.signals.insert(record.task_id.clone(), signal);
        state.active.insert(record.task_id.clone(), record.clone());
        drop(state);

        self.metrics.task_spawned();
        debug!(task_id = %record.task_id, agent = %record.agent_type, "Task registered");
        let _ = self.event_sender.send(TaskEvent::Registered(record));
        Ok(())
    }

    /// Apply a status update. Terminal transitions move the record out of the
    /// active partition in the same critical section; the completion signal
    /// resolves once the transition is fully recorded. Returns the updated record.
    pub async fn transition(&self, task_id: &str, update: StatusUpdate) -> Result<TaskRecord> {
        let mut state = self.state.lock().await;

        let (current, partition) = match state.find(task_id) {
            Some((record, partition)) => (record.clone(), partition),
            None => return Err(Error::TaskNotFound(task_id.to_string())),
        };

        let mut updated = current;
        if let Err(err) = updated.apply(update) {
            if updated.is_terminal() {
                self.metrics.duplicate_terminal_rejected();
            }
            return Err(err);
        }

        let target = Partition::for_status(updated.status);
        if target != partition {
            state.partition_mut(partition).remove(task_id);
        }
        state
            .partition_mut(target)
            .insert(task_id.to_string(), updated.clone());

        drop(state);

        let _ = self.event_sender.send(TaskEvent::StatusChanged {
            task_id: task_id.to_string(),
            agent_type: updated.agent_type.clone(),
            status: updated.status,
        });

        if updated.is_terminal() {
            self.metrics
                .task_finished(updated.status, updated.duration_ms());
            info!(
                task_id = %task_id,
                agent = %updated.agent_type,
                status = %updated.status,
                duration_ms = updated.duration_ms(),
                "Task reached terminal state"
            );
            if let Some(recorder) = &self.recorder {
                if let Err(e) = recorder.record_task(&updated).await {
                    warn!(task_id = %task_id, error = %e, "Failed to record task");
                }
            }
        } else {
            debug!(task_id = %task_id, status = %updated.status, "Task status updated");
        }

        // Waiters wake only after the recorder has seen the record.
        if updated.is_terminal() {
            let signal = self.state.lock().await.signals.remove(task_id);
            if let Some(signal) = signal {
                signal.send_replace(Some(updated.clone()));
            }
        }

        Ok(updated)
    }

    pub async fn get(&self, task_id: &str) -> Option<TaskRecord> {
        let state = self.state.lock().await;
        state.find(task_id).map(|(record, _)| record.clone())
    }

    pub async fn partition_of(&self, task_id: &str) -> Option<Partition> {
        let state = self.state.lock().await;
        state.find(task_id).map(|(_, partition)| partition)
    }

    pub async fn list_active(&self) -> Vec<TaskRecord> {
        let state = self.state.lock().await;
        sorted(state.active.values().cloned().collect())
    }

    pub async fn list_completed(&self) -> Vec<TaskRecord> {
        let state = self.state.lock().await;
        sorted(state.completed.values().cloned().collect())
    }

    pub async fn list_failed(&self) -> Vec<TaskRecord> {
        let state = self.state.lock().await;
        sorted(state.failed.values().cloned().collect())
    }

    /// Every record spawned for one agent type, any partition
    pub async fn list_by_agent(&self, agent_type: &str) -> Vec<TaskRecord> {
        let state = self.state.lock().await;
        sorted(
            state
                .active
                .values()
                .chain(state.completed.values())
                .chain(state.failed.values())
                .filter(|r| r.agent_type == agent_type)
                .cloned()
                .collect(),
        )
    }

    /// Running records past their deadline at `now`
    pub async fn overdue(&self, now: DateTime<Utc>) -> Vec<TaskRecord> {
        let state = self.state.lock().await;
        sorted(
            state
                .active
                .values()
                .filter(|r| r.is_overdue(now))
                .cloned()
                .collect(),
        )
    }

    pub async fn stats(&self) -> RegistryStats {
        let state = self.state.lock().await;
        RegistryStats {
            active: state.active.len(),
            completed: state.completed.len(),
            failed: state.failed.len(),
        }
    }

    /// Wait until the task reaches a terminal state and return the terminal
    /// record as it was when the transition happened.
    pub async fn wait_for_terminal(&self, task_id: &str) -> Result<TaskRecord> {
        let mut signal = {
            let state = self.state.lock().await;
            match (state.signals.get(task_id), state.find(task_id)) {
                (Some(sender), _) => sender.subscribe(),
                (None, Some((record, _))) if record.is_terminal() => return Ok(record.clone()),
                (None, Some(_)) => {
                    return Err(Error::internal(format!(
                        "task {} has no completion signal",
                        task_id
                    )))
                }
                (None, None) => return Err(Error::TaskNotFound(task_id.to_string())),
            }
        };

        let terminal = signal
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|record| record.clone());
        if let Some(record) = terminal {
            return Ok(record);
        }

        // Sender dropped before our receiver saw the value
        match self.get(task_id).await {
            Some(record) if record.is_terminal() => Ok(record),
            Some(_) => Err(Error::internal(format!(
                "task {} lost its completion signal",
                task_id
            ))),
            None => Err(Error::TaskNotFound(task_id.to_string())),
        }
    }
}
