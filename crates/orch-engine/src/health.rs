//! Health reporting

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bus::MessageBus;
use crate::registry::{RegistryStats, TaskRegistry};
use crate::worker::WorkerRegistry;

/// Individual worker health
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub name: String,
    pub healthy: bool,
}

/// Task past its deadline that is still RUNNING
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverdueTask {
    pub task_id: String,
    pub agent_type: String,
    pub running_ms: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub workers: Vec<WorkerHealth>,
    pub tasks: RegistryStats,
    pub overdue: Vec<OverdueTask>,
    pub bus_depth: usize,
    pub bus_capacity: usize,
    pub dispatcher_running: bool,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Healthy means every worker reports healthy, nothing is overdue and the
    /// dispatcher loop is alive.
    pub async fn collect(
        workers: &WorkerRegistry,
        registry: &TaskRegistry,
        bus: &MessageBus,
        dispatcher_running: bool,
    ) -> Self {
        let mut worker_status = Vec::with_capacity(workers.len());
        for (name, worker) in workers.iter() {
            worker_status.push(WorkerHealth {
                name: name.clone(),
                healthy: worker.is_healthy().await,
            });
        }
        worker_status.sort_by(|a, b| a.name.cmp(&b.name));

        let now = Utc::now();
        let overdue: Vec<OverdueTask> = registry
            .overdue(now)
            .await
            .into_iter()
            .map(|r| OverdueTask {
                running_ms: r.duration_ms(),
                task_id: r.task_id,
                agent_type: r.agent_type,
            })
            .collect();

        let healthy =
            dispatcher_running && overdue.is_empty() && worker_status.iter().all(|w| w.healthy);

        Self {
            healthy,
            workers: worker_status,
            tasks: registry.stats().await,
            overdue,
            bus_depth: bus.depth().await,
            bus_capacity: bus.capacity(),
            dispatcher_running,
            checked_at: now,
        }
    }

    pub fn unhealthy_workers(&self) -> Vec<&str> {
        self.workers
            .iter()
            .filter(|w| !w.healthy)
            .map(|w| w.name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::OrchestratorMetrics;
    use crate::worker::Worker;
    use async_trait::async_trait;
    use orch_core::ExecutionContext;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;

    struct Flaky {
        healthy: bool,
    }

    #[async_trait]
    impl Worker for Flaky {
        fn name(&self) -> &str {
            if self.healthy {
                "steady"
            } else {
                "flaky"
            }
        }

        async fn execute(&self, _context: ExecutionContext) -> anyhow::Result<Value> {
            Ok(Value::Null)
        }

        async fn is_healthy(&self) -> bool {
            self.healthy
        }
    }

    #[tokio::test]
    async fn test_unhealthy_worker_marks_report() {
        let workers = WorkerRegistry::new()
            .with_worker(Flaky { healthy: true })
            .unwrap()
            .with_worker(Flaky { healthy: false })
            .unwrap();
        let registry = TaskRegistry::new(Arc::new(OrchestratorMetrics::new().unwrap()));
        let bus = MessageBus::new(10, Duration::from_millis(10));

        let report = HealthReport::collect(&workers, &registry, &bus, true).await;
        assert!(!report.healthy);
        assert_eq!(report.unhealthy_workers(), vec!["flaky"]);
        assert_eq!(report.bus_capacity, 10);
    }

    #[tokio::test]
    async fn test_empty_engine_is_healthy() {
        let registry = TaskRegistry::new(Arc::new(OrchestratorMetrics::new().unwrap()));
        let bus = MessageBus::new(10, Duration::from_millis(10));

        let report = HealthReport::collect(&WorkerRegistry::new(), &registry, &bus, true).await;
        assert!(report.healthy);
        assert_eq!(report.tasks, RegistryStats::default());

        let stopped = HealthReport::collect(&WorkerRegistry::new(), &registry, &bus, false).await;
        assert!(!stopped.healthy);
    }
}
