//! Coordinator dispatch loop
//!
//! Receives task-complete / task-failed messages addressed to the coordinator
//! and applies them to the registry. Between polls it sweeps RUNNING tasks past
//! their deadline to TIMEOUT, so a lost completion message cannot leave a task
//! running forever. Duplicate terminal updates are rejected by the registry.
//! On shutdown the coordinator queue is drained and applied before exiting.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use orch_core::{Error, Message, MessageType, OrchestratorConfig, StatusUpdate};

use crate::bus::MessageBus;
use crate::registry::TaskRegistry;

pub struct Dispatcher {
    registry: Arc<TaskRegistry>,
    bus: Arc<MessageBus>,
    coordinator_name: String,
    poll_interval: Duration,
    sweep_interval: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<TaskRegistry>,
        bus: Arc<MessageBus>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            bus,
            coordinator_name: config.coordinator_name.clone(),
            poll_interval: config.receive_poll_interval,
            sweep_interval: config.health_check_interval,
        }
    }

    /// Run until `shutdown` flips to true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(coordinator = %self.coordinator_name, "Dispatcher started");
        let mut last_sweep = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                message = self.bus.receive(&self.coordinator_name, self.poll_interval) => {
                    if let Some(message) = message {
                        self.handle(message).await;
                    }
                }
            }

            if last_sweep.elapsed() >= self.sweep_interval {
                self.sweep().await;
                last_sweep = Instant::now();
            }
        }

        let pending = self.bus.drain(&self.coordinator_name).await;
        if !pending.is_empty() {
            debug!(count = pending.len(), "Applying messages queued before shutdown");
        }
        for message in pending {
            self.handle(message).await;
        }

        info!(coordinator = %self.coordinator_name, "Dispatcher stopped");
    }

    /// Apply one message addressed to the coordinator
    pub async fn handle(&self, message: Message) {
        if let Some((task_id, update)) = message.as_task_update() {
            match self.registry.transition(&task_id, update).await {
                Ok(record) => {
                    debug!(task_id = %task_id, status = %record.status, from = %message.from_agent, "Applied task update");
                }
                Err(err @ Error::InvalidTransition { .. }) => {
                    warn!(
                        task_id = %task_id,
                        message_id = %message.message_id,
                        error = %err,
                        "Rejected task update for already-finished task"
                    );
                }
                Err(err) => {
                    warn!(task_id = %task_id, error = %err, "Failed to apply task update");
                }
            }
            return;
        }

        match message.message_type {
            MessageType::StatusUpdate => {
                info!(from = %message.from_agent, payload = %message.payload, "Status update");
            }
            MessageType::TaskComplete | MessageType::TaskFailed => {
                warn!(
                    message_id = %message.message_id,
                    from = %message.from_agent,
                    "Task message without task_id ignored"
                );
            }
            MessageType::Request | MessageType::Response => {
                debug!(
                    message_id = %message.message_id,
                    from = %message.from_agent,
                    message_type = ?message.message_type,
                    "Coordinator ignores request/response traffic"
                );
            }
        }
    }

    /// Move every overdue RUNNING task to TIMEOUT. Returns how many moved.
    pub async fn sweep(&self) -> usize {
        let mut timed_out = 0;
        for record in self.registry.overdue(Utc::now()).await {
            let limit = record.timeout_ms.unwrap_or_default();
            let update = StatusUpdate::TimedOut(format!("task exceeded deadline of {}ms", limit));
            match self.registry.transition(&record.task_id, update).await {
                Ok(_) => {
                    warn!(task_id = %record.task_id, agent = %record.agent_type, "Task timed out");
                    timed_out += 1;
                }
                // Finished between the scan and the transition
                Err(err) => debug!(task_id = %record.task_id, error = %err, "Sweep skipped task"),
            }
        }
        timed_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::OrchestratorMetrics;
    use orch_core::{TaskRecord, TaskStatus};
    use serde_json::json;

    fn setup() -> (Arc<TaskRegistry>, Arc<MessageBus>, OrchestratorConfig) {
        let config = OrchestratorConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_health_check_interval(Duration::from_millis(10));
        let registry = Arc::new(TaskRegistry::new(Arc::new(OrchestratorMetrics::new().unwrap())));
        let bus = Arc::new(MessageBus::from_config(&config));
        (registry, bus, config)
    }

    async fn running(registry: &TaskRegistry, record: TaskRecord) -> String {
        let id = record.task_id.clone();
        registry.register(record).await.unwrap();
        registry.transition(&id, StatusUpdate::Running).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_completion_message_applied() {
        let (registry, bus, config) = setup();
        let id = running(&registry, TaskRecord::new("parse", None)).await;

        let (tx, rx) = watch::channel(false);
        let loop_handle = tokio::spawn(Dispatcher::new(registry.clone(), bus.clone(), &config).run(rx));

        bus.publish(Message::task_complete("parse", "orchestrator", &id, json!({"actions": []})))
            .await
            .unwrap();

        let record = registry.wait_for_terminal(&id).await.unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result, Some(json!({"actions": []})));

        tx.send(true).unwrap();
        loop_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_completion_is_rejected() {
        let (registry, bus, config) = setup();
        let id = running(&registry, TaskRecord::new("parse", None)).await;
        let dispatcher = Dispatcher::new(registry.clone(), bus, &config);

        dispatcher
            .handle(Message::task_complete("parse", "orchestrator", &id, json!(1)))
            .await;
        let first = registry.get(&id).await.unwrap();

        dispatcher
            .handle(Message::task_complete("parse", "orchestrator", &id, json!(2)))
            .await;
        dispatcher
            .handle(Message::task_failed("parse", "orchestrator", &id, "late", false))
            .await;

        let after = registry.get(&id).await.unwrap();
        assert_eq!(after.result, Some(json!(1)));
        assert_eq!(after.end_time, first.end_time);
        assert_eq!(registry.metrics().duplicate_terminal_count(), 2);
    }

    #[tokio::test]
    async fn test_sweep_times_out_overdue_tasks() {
        let (registry, bus, config) = setup();
        let mut record = TaskRecord::new("slow", None).with_timeout_ms(5);
        record.start_time = Utc::now() - chrono::Duration::milliseconds(50);
        let id = running(&registry, record).await;
        let fresh = running(&registry, TaskRecord::new("fast", None).with_timeout_ms(60_000)).await;

        let dispatcher = Dispatcher::new(registry.clone(), bus, &config);
        assert_eq!(dispatcher.sweep().await, 1);

        let record = registry.get(&id).await.unwrap();
        assert_eq!(record.status, TaskStatus::Timeout);
        assert!(record.error.unwrap().contains("deadline"));
        assert_eq!(registry.get(&fresh).await.unwrap().status, TaskStatus::Running);
        assert_eq!(dispatcher.sweep().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_applies_queued_messages() {
        let (registry, bus, config) = setup();
        let id = running(&registry, TaskRecord::new("parse", None)).await;
        bus.publish(Message::task_failed("parse", "orchestrator", &id, "late", false))
            .await
            .unwrap();

        let (tx, rx) = watch::channel(true);
        Dispatcher::new(registry.clone(), bus.clone(), &config)
            .run(rx)
            .await;
        drop(tx);

        assert_eq!(registry.get(&id).await.unwrap().status, TaskStatus::Failed);
        assert_eq!(bus.depth().await, 0);
    }

    #[tokio::test]
    async fn test_stops_when_sender_dropped() {
        let (registry, bus, config) = setup();
        let (tx, rx) = watch::channel(false);
        let loop_handle = tokio::spawn(Dispatcher::new(registry, bus, &config).run(rx));

        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), loop_handle)
            .await
            .unwrap()
            .unwrap();
    }
}
