use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};

use orch_core::{Error, Result, TaskStatus};

/// Orchestrator metrics collector
#[derive(Clone)]
pub struct OrchestratorMetrics {
    tasks_spawned: IntCounter,
    active_tasks: IntGauge,
    tasks_completed: IntCounter,
    tasks_failed: IntCounter,
    tasks_timed_out: IntCounter,
    /// Terminal updates rejected because the task was already terminal
    duplicate_terminal: IntCounter,
    messages_published: IntCounter,
    publish_rejected: IntCounter,
    bus_depth: IntGauge,
    task_duration: Histogram,
    registry: Registry,
}

fn register<T: prometheus::core::Collector + Clone + 'static>(
    registry: &Registry,
    metric: T,
) -> std::result::Result<T, prometheus::Error> {
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl OrchestratorMetrics {
    /// Create a collector with its own private registry
    pub fn new() -> Result<Self> {
        Self::build().map_err(|e| Error::internal(format!("metrics setup failed: {}", e)))
    }

    fn build() -> std::result::Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let tasks_spawned = register(
            &registry,
            IntCounter::new("orch_tasks_spawned_total", "Total number of tasks spawned")?,
        )?;
        let active_tasks = register(
            &registry,
            IntGauge::new("orch_active_tasks", "Number of tasks not yet terminal")?,
        )?;
        let tasks_completed = register(
            &registry,
            IntCounter::new("orch_tasks_completed_total", "Tasks that completed")?,
        )?;
        let tasks_failed = register(
            &registry,
            IntCounter::new("orch_tasks_failed_total", "Tasks that failed")?,
        )?;
        let tasks_timed_out = register(
            &registry,
            IntCounter::new("orch_tasks_timed_out_total", "Tasks that missed their deadline")?,
        )?;
        let duplicate_terminal = register(
            &registry,
            IntCounter::new(
                "orch_duplicate_terminal_total",
                "Terminal updates rejected for already-terminal tasks",
            )?,
        )?;
        let messages_published = register(
            &registry,
            IntCounter::new("orch_messages_published_total", "Messages accepted by the bus")?,
        )?;
        let publish_rejected = register(
            &registry,
            IntCounter::new("orch_publish_rejected_total", "Publishes that hit BusFull")?,
        )?;
        let bus_depth = register(
            &registry,
            IntGauge::new("orch_bus_depth", "Deliveries currently queued on the bus")?,
        )?;
        let task_duration = register(
            &registry,
            Histogram::with_opts(
                HistogramOpts::new("orch_task_duration_seconds", "Task duration in seconds")
                    .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0]),
            )?,
        )?;

        Ok(Self {
            tasks_spawned,
            active_tasks,
            tasks_completed,
            tasks_failed,
            tasks_timed_out,
            duplicate_terminal,
            messages_published,
            publish_rejected,
            bus_depth,
            task_duration,
            registry,
        })
    }

    pub fn task_spawned(&self) {
        self.tasks_spawned.inc();
        self.active_tasks.inc();
    }

    /// Record a terminal transition
    pub fn task_finished(&self, status: TaskStatus, duration_ms: u64) {
        match status {
            TaskStatus::Completed => self.tasks_completed.inc(),
            TaskStatus::Failed => self.tasks_failed.inc(),
            TaskStatus::Timeout => self.tasks_timed_out.inc(),
            TaskStatus::Spawning | TaskStatus::Running => return,
        }
        self.active_tasks.dec();
        self.task_duration.observe(duration_ms as f64 / 1000.0);
    }

    pub fn duplicate_terminal_rejected(&self) {
        self.duplicate_terminal.inc();
    }

    pub fn message_published(&self, depth: usize) {
        self.messages_published.inc();
        self.bus_depth.set(depth as i64);
    }

    pub fn publish_rejected(&self) {
        self.publish_rejected.inc();
    }

    pub fn set_bus_depth(&self, depth: usize) {
        self.bus_depth.set(depth as i64);
    }

    pub fn duplicate_terminal_count(&self) -> u64 {
        self.duplicate_terminal.get()
    }

    pub fn active_task_count(&self) -> i64 {
        self.active_tasks.get()
    }

    /// Registry for scraping
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Metric names and values as JSON
    pub fn get_metrics_json(&self) -> serde_json::Value {
        let metrics: Vec<_> = self
            .registry
            .gather()
            .into_iter()
            .map(|family| {
                let value = family
                    .get_metric()
                    .first()
                    .map(|m| {
                        if m.has_counter() {
                            m.get_counter().get_value()
                        } else if m.has_gauge() {
                            m.get_gauge().get_value()
                        } else {
                            m.get_histogram().get_sample_count() as f64
                        }
                    })
                    .unwrap_or_default();
                serde_json::json!({
                    "name": family.get_name(),
                    "help": family.get_help(),
                    "value": value,
                })
            })
            .collect();

        serde_json::json!({ "metrics": metrics })
    }
}
