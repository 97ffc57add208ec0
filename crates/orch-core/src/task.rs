//! Task records and the task lifecycle state machine
//!
//! Every worker invocation is tracked by one [`TaskRecord`]:
//!
//! ```text
//! Spawning -> Running -> { Completed | Failed | Timeout }
//! ```
//!
//! Terminal states are final. Any update attempted from a terminal state is
//! rejected with [`Error::InvalidTransition`] and leaves the record untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

static TASK_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Record created, worker not yet handed its context
    Spawning,
    /// Worker is executing
    Running,
    /// Worker returned a result
    Completed,
    /// Worker raised or returned an unacceptable result
    Failed,
    /// Worker missed its deadline
    Timeout,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout
        )
    }

    /// Whether `next` is reachable from `self` in one step.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Spawning, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Timeout)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Spawning => write!(f, "spawning"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// A requested status change together with the data it carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "payload", rename_all = "snake_case")]
pub enum StatusUpdate {
    Running,
    Completed(Value),
    Failed(String),
    TimedOut(String),
}

impl StatusUpdate {
    pub fn status(&self) -> TaskStatus {
        match self {
            StatusUpdate::Running => TaskStatus::Running,
            StatusUpdate::Completed(_) => TaskStatus::Completed,
            StatusUpdate::Failed(_) => TaskStatus::Failed,
            StatusUpdate::TimedOut(_) => TaskStatus::Timeout,
        }
    }
}

/// Record of a single worker invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique task ID (worker name + timestamp + sequence)
    pub task_id: String,
    /// Worker name
    pub agent_type: String,
    /// Lifecycle status
    pub status: TaskStatus,
    /// Creation time
    pub start_time: DateTime<Utc>,
    /// Set iff the status is terminal
    pub end_time: Option<DateTime<Utc>>,
    /// Present iff the status is Completed
    pub result: Option<Value>,
    /// Present iff the status is Failed or Timeout
    pub error: Option<String>,
    /// Workflow run (or caller task) that spawned this task
    pub parent_task_id: Option<String>,
    /// Deadline in milliseconds, measured from `start_time`
    pub timeout_ms: Option<u64>,
}

impl TaskRecord {
    /// Create a new record in the Spawning state
    pub fn new(agent_type: &str, parent_task_id: Option<String>) -> Self {
        Self {
            task_id: Self::generate_id(agent_type),
            agent_type: agent_type.to_string(),
            status: TaskStatus::Spawning,
            start_time: Utc::now(),
            end_time: None,
            result: None,
            error: None,
            parent_task_id,
            timeout_ms: None,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// `{agent}-{unix millis}-{sequence}`; the sequence keeps ids unique within a millisecond.
    pub fn generate_id(agent_type: &str) -> String {
        let seq = TASK_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{}", agent_type, Utc::now().timestamp_millis(), seq)
    }

    /// Apply a status update, enforcing the lifecycle rules.
    pub fn apply(&mut self, update: StatusUpdate) -> Result<()> {
        let next = update.status();
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                task_id: self.task_id.clone(),
                from: self.status,
                to: next,
            });
        }

        match update {
            StatusUpdate::Running => {}
            StatusUpdate::Completed(result) => {
                self.result = Some(result);
                self.end_time = Some(Utc::now());
            }
            StatusUpdate::Failed(error) | StatusUpdate::TimedOut(error) => {
                self.error = Some(error);
                self.end_time = Some(Utc::now());
            }
        }
        self.status = next;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Running past its deadline at `now`.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.timeout_ms) {
            (TaskStatus::Running, Some(ms)) => {
                (now - self.start_time).num_milliseconds() > ms as i64
            }
            _ => false,
        }
    }

    /// Elapsed time until `end_time` (or now for unfinished tasks)
    pub fn duration_ms(&self) -> u64 {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).num_milliseconds().max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ALL: [TaskStatus; 5] = [
        TaskStatus::Spawning,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Timeout,
    ];

    #[test]
    fn test_legal_transitions() {
        let legal: Vec<_> = ALL
            .iter()
            .flat_map(|from| ALL.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| from.can_transition_to(*to))
            .collect();

        assert_eq!(
            legal,
            vec![
                (TaskStatus::Spawning, TaskStatus::Running),
                (TaskStatus::Running, TaskStatus::Completed),
                (TaskStatus::Running, TaskStatus::Failed),
                (TaskStatus::Running, TaskStatus::Timeout),
            ]
        );
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Timeout] {
            assert!(terminal.is_terminal());
            assert!(ALL.iter().all(|next| !terminal.can_transition_to(*next)));
        }
    }

    #[test]
    fn test_record_lifecycle() {
        let mut record = TaskRecord::new("parse", Some("wf-1".into()));
        assert_eq!(record.status, TaskStatus::Spawning);
        assert!(record.task_id.starts_with("parse-"));
        assert!(record.end_time.is_none());

        record.apply(StatusUpdate::Running).unwrap();
        assert_eq!(record.status, TaskStatus::Running);
        assert!(record.end_time.is_none());

        record
            .apply(StatusUpdate::Completed(json!({"actions": []})))
            .unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert!(record.end_time.is_some());
        assert_eq!(record.result, Some(json!({"actions": []})));
        assert!(record.error.is_none());
    }

    #[test]
    fn test_rejected_update_leaves_record_unchanged() {
        let mut record = TaskRecord::new("dedupe", None);
        record.apply(StatusUpdate::Running).unwrap();
        record.apply(StatusUpdate::Failed("no actions".into())).unwrap();
        let before = record.clone();

        let err = record
            .apply(StatusUpdate::Completed(json!(1)))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: TaskStatus::Failed,
                to: TaskStatus::Completed,
                ..
            }
        ));
        assert_eq!(record, before);
    }

    #[test]
    fn test_cannot_skip_running() {
        let mut record = TaskRecord::new("convert", None);
        assert!(record.apply(StatusUpdate::Completed(json!(null))).is_err());
        assert_eq!(record.status, TaskStatus::Spawning);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = TaskRecord::generate_id("parse");
        let b = TaskRecord::generate_id("parse");
        assert_ne!(a, b);
    }

    #[test]
    fn test_overdue() {
        let mut record = TaskRecord::new("slow", None).with_timeout_ms(10);
        record.start_time = Utc::now() - chrono::Duration::milliseconds(50);
        assert!(!record.is_overdue(Utc::now()));

        record.apply(StatusUpdate::Running).unwrap();
        assert!(record.is_overdue(Utc::now()));
    }
}
