//! Orchestrator - spawns workers, runs workflows, answers queries
//!
//! Every spawn creates a task record (SPAWNING), derives the stage context,
//! moves the record to RUNNING and runs the worker on its own Tokio task under
//! a deadline. The outcome travels back to the coordinator as a bus message;
//! the dispatcher applies it to the registry. Once the coordinator has stopped,
//! or when the bus cannot take the message, the execution applies its outcome
//! to the registry itself. Workflow progression is driven by the registry's
//! terminal transitions, never by message arrival order.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use orch_core::{
    Error, ExecutionContext, Message, OrchestratorConfig, Result, StatusUpdate, TaskRecord,
    TaskStatus,
};

use crate::bus::MessageBus;
use crate::dispatcher::Dispatcher;
use crate::health::HealthReport;
use crate::metrics::OrchestratorMetrics;
use crate::recorder::TaskRecorder;
use crate::registry::TaskRegistry;
use crate::worker::{Worker, WorkerRegistry};
use crate::workflow::{ExecutionMode, Stage, Workflow, WorkflowCatalog};

const WORKFLOW_DEADLINE_EXCEEDED: &str = "workflow deadline exceeded";

/// One entry of a parallel batch
#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub agent_type: String,
    pub context: ExecutionContext,
    pub parent_task_id: Option<String>,
    pub timeout: Option<Duration>,
}

impl AgentSpec {
    pub fn new(agent_type: &str, context: ExecutionContext) -> Self {
        Self {
            agent_type: agent_type.to_string(),
            context,
            parent_task_id: None,
            timeout: None,
        }
    }

    pub fn with_parent(mut self, parent_task_id: &str) -> Self {
        self.parent_task_id = Some(parent_task_id.to_string());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Terminal outcome of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub agent_type: String,
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl TaskOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

impl From<TaskRecord> for TaskOutcome {
    fn from(record: TaskRecord) -> Self {
        Self {
            duration_ms: record.duration_ms(),
            agent_type: record.agent_type,
            task_id: record.task_id,
            status: record.status,
            result: record.result,
            error: record.error,
        }
    }
}

/// Per-stage line of a workflow outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: String,
    pub agent_type: String,
    pub task_id: String,
    pub status: TaskStatus,
}

impl StageOutcome {
    fn from_record(stage: &Stage, record: &TaskRecord) -> Self {
        Self {
            stage: stage.name.clone(),
            agent_type: record.agent_type.clone(),
            task_id: record.task_id.clone(),
            status: record.status,
        }
    }
}

/// Result of `run_workflow`.
///
/// Success carries `result`; failure carries `failed_at` and `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowOutcome {
    pub workflow: String,
    pub workflow_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub stages: Vec<StageOutcome>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

struct WorkflowRun {
    workflow: String,
    workflow_id: String,
    started_at: DateTime<Utc>,
    started: Instant,
    stages: Vec<StageOutcome>,
}

impl WorkflowRun {
    fn new(workflow: &Workflow, workflow_id: &str) -> Self {
        Self {
            workflow: workflow.name.clone(),
            workflow_id: workflow_id.to_string(),
            started_at: Utc::now(),
            started: Instant::now(),
            stages: Vec::new(),
        }
    }

    fn outcome(
        self,
        result: Option<Value>,
        failed_at: Option<String>,
        error: Option<String>,
    ) -> WorkflowOutcome {
        WorkflowOutcome {
            success: failed_at.is_none(),
            workflow: self.workflow,
            workflow_id: self.workflow_id,
            result,
            failed_at,
            error,
            stages: self.stages,
            started_at: self.started_at,
            duration_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    fn success(self, result: Value) -> WorkflowOutcome {
        self.outcome(Some(result), None, None)
    }

    fn failure(self, stage: &str, error: String) -> WorkflowOutcome {
        self.outcome(None, Some(stage.to_string()), Some(error))
    }
}

/// Handle to a spawned task
#[derive(Clone)]
pub struct TaskHandle {
    task_id: String,
    agent_type: String,
    context: ExecutionContext,
    registry: Arc<TaskRegistry>,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    /// Context handed to the worker
    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Current record snapshot
    pub async fn status(&self) -> Option<TaskRecord> {
        self.registry.get(&self.task_id).await
    }

    /// Wait for the terminal transition
    pub async fn wait(&self) -> Result<TaskRecord> {
        self.registry.wait_for_terminal(&self.task_id).await
    }
}

/// One worker invocation running on its own Tokio task
struct TaskExecution {
    worker: Arc<dyn Worker>,
    context: ExecutionContext,
    task_id: String,
    agent_type: String,
    deadline: Duration,
    coordinator: String,
    bus: Arc<MessageBus>,
    registry: Arc<TaskRegistry>,
    /// Coordinator shutdown flag; a dropped sender also means stopped
    shutdown: watch::Receiver<bool>,
}

impl TaskExecution {
    async fn run(self) {
        let worker = self.worker.clone();
        let context = self.context.clone();
        // The worker runs on its own task so a panic is caught as a JoinError
        // and a deadline only stops the waiting, not the work.
        let execution = tokio::spawn(async move { worker.execute(context).await });

        let update = match tokio::time::timeout(self.deadline, execution).await {
            Err(_) => StatusUpdate::TimedOut(format!(
                "task exceeded deadline of {}ms",
                self.deadline.as_millis()
            )),
            Ok(Err(join_error)) => StatusUpdate::Failed(describe_join_error(join_error)),
            Ok(Ok(Err(e))) => StatusUpdate::Failed(format!("{:#}", e)),
            Ok(Ok(Ok(output))) => match self.worker.validate_output(&output) {
                Ok(()) => StatusUpdate::Completed(output),
                Err(reason) => StatusUpdate::Failed(format!("schema mismatch: {}", reason)),
            },
        };

        self.report(update).await;
    }

    async fn report(&self, update: StatusUpdate) {
        let message = match &update {
            StatusUpdate::Completed(result) => Message::task_complete(
                &self.agent_type,
                &self.coordinator,
                &self.task_id,
                result.clone(),
            ),
            StatusUpdate::Failed(error) => {
                Message::task_failed(&self.agent_type, &self.coordinator, &self.task_id, error, false)
            }
            StatusUpdate::TimedOut(error) => {
                Message::task_failed(&self.agent_type, &self.coordinator, &self.task_id, error, true)
            }
            StatusUpdate::Running => return,
        };

        if self.coordinator_stopped() {
            debug!(task_id = %self.task_id, "Coordinator stopped, updating registry directly");
            self.apply_directly(update).await;
            return;
        }

        if let Err(e) = self.bus.publish(message).await {
            warn!(task_id = %self.task_id, error = %e, "Could not report through bus, updating registry directly");
            self.apply_directly(update).await;
            return;
        }

        // Shutdown raced the publish; the message may never be read.
        if self.coordinator_stopped() {
            self.apply_directly(update).await;
        }
    }

    fn coordinator_stopped(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    async fn apply_directly(&self, update: StatusUpdate) {
        match self.registry.transition(&self.task_id, update).await {
            Ok(_) => {}
            Err(Error::InvalidTransition { .. }) => {
                debug!(task_id = %self.task_id, "Outcome already applied by the dispatcher");
            }
            Err(e) => {
                error!(task_id = %self.task_id, error = %e, "Failed to record task outcome");
            }
        }
    }
}

fn describe_join_error(join_error: JoinError) -> String {
    if join_error.is_panic() {
        let panic = join_error.into_panic();
        let detail = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        format!("worker panicked: {}", detail)
    } else {
        format!("worker cancelled: {}", join_error)
    }
}

/// Builder for [`Orchestrator`]
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    workers: WorkerRegistry,
    catalog: WorkflowCatalog,
    recorder: Option<Arc<dyn TaskRecorder>>,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn workers(mut self, workers: WorkerRegistry) -> Self {
        self.workers = workers;
        self
    }

    pub fn catalog(mut self, catalog: WorkflowCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn recorder(mut self, recorder: Arc<dyn TaskRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Validate the wiring and start the dispatcher. Must run inside a Tokio runtime.
    pub fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;
        self.catalog.validate_workers(&self.workers)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::config("orchestrator must be built inside a Tokio runtime"))?;

        let metrics = Arc::new(OrchestratorMetrics::new()?);

        let mut registry = TaskRegistry::new(metrics.clone());
        if let Some(recorder) = &self.recorder {
            registry = registry.with_recorder(recorder.clone());
        }
        let registry = Arc::new(registry);
        let bus = Arc::new(MessageBus::from_config(&self.config).with_metrics(metrics.clone()));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let dispatcher = Dispatcher::new(registry.clone(), bus.clone(), &self.config);
        let dispatcher = runtime.spawn(dispatcher.run(shutdown_rx));

        info!(
            workers = self.workers.len(),
            workflows = self.catalog.len(),
            bus_capacity = self.config.bus_capacity,
            coordinator = %self.config.coordinator_name,
            "Orchestrator started"
        );

        Ok(Orchestrator {
            config: self.config,
            workers: self.workers,
            catalog: RwLock::new(self.catalog),
            registry,
            bus,
            metrics,
            recorder: self.recorder,
            shutdown,
            dispatcher,
        })
    }
}

/// Coordinator owning the registry, the bus and the workflow catalog.
///
/// Dropping it stops the dispatcher loop.
pub struct Orchestrator {
    config: OrchestratorConfig,
    workers: WorkerRegistry,
    catalog: RwLock<WorkflowCatalog>,
    registry: Arc<TaskRegistry>,
    bus: Arc<MessageBus>,
    metrics: Arc<OrchestratorMetrics>,
    recorder: Option<Arc<dyn TaskRecorder>>,
    shutdown: watch::Sender<bool>,
    dispatcher: JoinHandle<()>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    pub fn new(
        config: OrchestratorConfig,
        workers: WorkerRegistry,
        catalog: WorkflowCatalog,
    ) -> Result<Self> {
        Self::builder()
            .config(config)
            .workers(workers)
            .catalog(catalog)
            .build()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn metrics(&self) -> &Arc<OrchestratorMetrics> {
        &self.metrics
    }

    /// Add or replace a workflow at runtime
    pub async fn register_workflow(&self, workflow: Workflow) -> Result<()> {
        workflow.validate_workers(&self.workers)?;
        let name = workflow.name.clone();
        self.catalog.write().await.register(workflow)?;
        info!(workflow = %name, "Workflow registered");
        Ok(())
    }

    pub async fn workflows(&self) -> Vec<Workflow> {
        self.catalog.read().await.iter().cloned().collect()
    }

    /// Spawn one worker with the default deadline
    pub async fn spawn(
        &self,
        agent_type: &str,
        context: &ExecutionContext,
        parent_task_id: Option<String>,
    ) -> Result<TaskHandle> {
        self.spawn_with_timeout(agent_type, context, parent_task_id, None)
            .await
    }

    /// Spawn one worker. An unknown worker fails before any record is created.
    #[instrument(skip(self, context, parent_task_id), fields(workflow_id = %context.workflow_id))]
    pub async fn spawn_with_timeout(
        &self,
        agent_type: &str,
        context: &ExecutionContext,
        parent_task_id: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<TaskHandle> {
        let worker = self.workers.resolve(agent_type)?;
        self.launch(worker, agent_type, context, parent_task_id, timeout)
            .await
    }

    async fn launch(
        &self,
        worker: Arc<dyn Worker>,
        agent_type: &str,
        context: &ExecutionContext,
        parent_task_id: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<TaskHandle> {
        let deadline = timeout.unwrap_or(self.config.task_timeout);
        let record =
            TaskRecord::new(agent_type, parent_task_id).with_timeout_ms(deadline.as_millis() as u64);
        let task_id = record.task_id.clone();

        self.registry.register(record).await?;
        let child = context.derive(&task_id, agent_type);
        self.registry
            .transition(&task_id, StatusUpdate::Running)
            .await?;

        let execution = TaskExecution {
            worker,
            context: child.clone(),
            task_id: task_id.clone(),
            agent_type: agent_type.to_string(),
            deadline,
            coordinator: self.config.coordinator_name.clone(),
            bus: self.bus.clone(),
            registry: self.registry.clone(),
            shutdown: self.shutdown.subscribe(),
        };
        tokio::spawn(execution.run());

        info!(task_id = %task_id, agent = %agent_type, deadline_ms = deadline.as_millis() as u64, "Task spawned");

        Ok(TaskHandle {
            task_id,
            agent_type: agent_type.to_string(),
            context: child,
            registry: self.registry.clone(),
        })
    }

    async fn spawn_stage(
        &self,
        stage: &Stage,
        context: &ExecutionContext,
        workflow_id: &str,
    ) -> Result<TaskHandle> {
        self.spawn_with_timeout(
            &stage.worker,
            context,
            Some(workflow_id.to_string()),
            stage.timeout(),
        )
        .await
    }

    /// Run a named workflow to completion or to its first failed stage.
    #[instrument(skip(self, initial), fields(workflow_id = %initial.workflow_id))]
    pub async fn run_workflow(
        &self,
        workflow_name: &str,
        initial: ExecutionContext,
    ) -> Result<WorkflowOutcome> {
        let workflow = self.catalog.read().await.resolve(workflow_name)?.clone();
        workflow.validate_workers(&self.workers)?;

        info!(
            workflow = %workflow.name,
            stages = workflow.stages.len(),
            mode = ?workflow.mode,
            "Starting workflow"
        );

        let run = WorkflowRun::new(&workflow, &initial.workflow_id);
        let deadline = self.config.workflow_timeout.map(|t| Instant::now() + t);

        let outcome = if workflow.is_empty() {
            run.success(initial.payload)
        } else {
            match workflow.mode {
                ExecutionMode::Sequential => {
                    self.run_sequential(&workflow, initial, run, deadline).await?
                }
                ExecutionMode::Parallel => {
                    self.run_stages_parallel(&workflow, initial, run, deadline)
                        .await?
                }
            }
        };

        if outcome.success {
            info!(workflow = %outcome.workflow, duration_ms = outcome.duration_ms, "Workflow completed");
        } else {
            warn!(
                workflow = %outcome.workflow,
                failed_at = outcome.failed_at.as_deref().unwrap_or_default(),
                error = outcome.error.as_deref().unwrap_or_default(),
                "Workflow failed"
            );
        }

        if let Some(recorder) = &self.recorder {
            if let Err(e) = recorder.record_workflow(&outcome).await {
                warn!(workflow = %outcome.workflow, error = %e, "Failed to record workflow");
            }
        }

        Ok(outcome)
    }

    async fn run_sequential(
        &self,
        workflow: &Workflow,
        initial: ExecutionContext,
        mut run: WorkflowRun,
        deadline: Option<Instant>,
    ) -> Result<WorkflowOutcome> {
        let workflow_id = initial.workflow_id.clone();
        let mut context = initial;

        for stage in &workflow.stages {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(run.failure(&stage.name, WORKFLOW_DEADLINE_EXCEEDED.to_string()));
            }

            let handle = self.spawn_stage(stage, &context, &workflow_id).await?;
            let record = match wait_until(&handle, deadline).await? {
                Some(record) => record,
                None => {
                    if let Some(current) = handle.status().await {
                        run.stages.push(StageOutcome::from_record(stage, &current));
                    }
                    return Ok(run.failure(&stage.name, WORKFLOW_DEADLINE_EXCEEDED.to_string()));
                }
            };
            run.stages.push(StageOutcome::from_record(stage, &record));

            if record.status != TaskStatus::Completed {
                let error = record
                    .error
                    .unwrap_or_else(|| format!("stage ended in {}", record.status));
                return Ok(run.failure(&stage.name, error));
            }

            let result = record.result.unwrap_or(Value::Null);
            context = handle.context().clone().with_payload(result);
        }

        Ok(run.success(context.payload))
    }

    async fn run_stages_parallel(
        &self,
        workflow: &Workflow,
        initial: ExecutionContext,
        mut run: WorkflowRun,
        deadline: Option<Instant>,
    ) -> Result<WorkflowOutcome> {
        let mut handles = Vec::with_capacity(workflow.stages.len());
        for stage in &workflow.stages {
            handles.push(
                self.spawn_stage(stage, &initial, &initial.workflow_id)
                    .await?,
            );
        }

        let waits = join_all(handles.iter().map(|handle| handle.wait()));
        let finished = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, waits).await.ok(),
            None => Some(waits.await),
        };

        let Some(records) = finished else {
            let mut failed_at = None;
            for (stage, handle) in workflow.stages.iter().zip(&handles) {
                if let Some(current) = handle.status().await {
                    if failed_at.is_none() && current.status != TaskStatus::Completed {
                        failed_at = Some(stage.name.clone());
                    }
                    run.stages.push(StageOutcome::from_record(stage, &current));
                }
            }
            let failed_at = failed_at.unwrap_or_else(|| workflow.stages[0].name.clone());
            return Ok(run.failure(&failed_at, WORKFLOW_DEADLINE_EXCEEDED.to_string()));
        };
        let records = records.into_iter().collect::<Result<Vec<_>>>()?;

        let mut results = Map::new();
        let mut failure = None;
        for (stage, record) in workflow.stages.iter().zip(records) {
            run.stages.push(StageOutcome::from_record(stage, &record));
            if record.status == TaskStatus::Completed {
                results.insert(stage.name.clone(), record.result.unwrap_or(Value::Null));
            } else if failure.is_none() {
                let error = record
                    .error
                    .unwrap_or_else(|| format!("stage ended in {}", record.status));
                failure = Some((stage.name.clone(), error));
            }
        }

        Ok(match failure {
            Some((stage, error)) => run.failure(&stage, error),
            None => run.success(Value::Object(results)),
        })
    }

    /// Spawn every spec concurrently and wait for all of them. Returns one
    /// outcome per spec in input order, failures included.
    #[instrument(skip(self, specs), fields(count = specs.len()))]
    pub async fn run_parallel(&self, specs: Vec<AgentSpec>) -> Result<Vec<TaskOutcome>> {
        let workers = specs
            .iter()
            .map(|spec| self.workers.resolve(&spec.agent_type))
            .collect::<Result<Vec<_>>>()?;

        let mut handles = Vec::with_capacity(specs.len());
        for (spec, worker) in specs.into_iter().zip(workers) {
            handles.push(
                self.launch(
                    worker,
                    &spec.agent_type,
                    &spec.context,
                    spec.parent_task_id,
                    spec.timeout,
                )
                .await?,
            );
        }

        let outcomes = join_all(handles.iter().map(|handle| handle.wait()))
            .await
            .into_iter()
            .map(|record| record.map(TaskOutcome::from))
            .collect::<Result<Vec<_>>>()?;

        let failed = outcomes.iter().filter(|o| !o.succeeded()).count();
        info!(total = outcomes.len(), failed, "Parallel batch finished");
        Ok(outcomes)
    }

    pub async fn status_of(&self, task_id: &str) -> Option<TaskRecord> {
        self.registry.get(task_id).await
    }

    pub async fn active_agents(&self) -> Vec<TaskRecord> {
        self.registry.list_active().await
    }

    pub async fn completed_agents(&self) -> Vec<TaskRecord> {
        self.registry.list_completed().await
    }

    pub async fn failed_agents(&self) -> Vec<TaskRecord> {
        self.registry.list_failed().await
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport::collect(
            &self.workers,
            &self.registry,
            &self.bus,
            !self.dispatcher.is_finished(),
        )
        .await
    }

    /// Stop the dispatcher and wait for it to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.dispatcher.await {
            warn!(error = %e, "Dispatcher exited abnormally");
        }
        info!("Orchestrator stopped");
    }
}

async fn wait_until(handle: &TaskHandle, deadline: Option<Instant>) -> Result<Option<TaskRecord>> {
    match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, handle.wait()).await {
            Ok(record) => record.map(Some),
            Err(_) => Ok(None),
        },
        None => handle.wait().await.map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::FnWorker;
    use serde_json::json;

    fn workers() -> WorkerRegistry {
        WorkerRegistry::new()
            .with_worker(FnWorker::new("double", |ctx: ExecutionContext| async move {
                let n = ctx.payload.as_i64().unwrap_or_default();
                Ok(json!(n * 2))
            }))
            .unwrap()
            .with_worker(FnWorker::new("boom", |_ctx: ExecutionContext| async move {
                Err(anyhow::anyhow!("boom"))
            }))
            .unwrap()
    }

    fn orchestrator() -> Orchestrator {
        let config = OrchestratorConfig::default().with_poll_interval(Duration::from_millis(20));
        let catalog = WorkflowCatalog::new()
            .with_workflow(Workflow::chain("quad", &["double", "double"]))
            .unwrap();
        Orchestrator::new(config, workers(), catalog).unwrap()
    }

    #[tokio::test]
    async fn test_spawn_and_wait() {
        let orch = orchestrator();
        let handle = orch
            .spawn("double", &ExecutionContext::new(json!(21)), None)
            .await
            .unwrap();

        assert_eq!(handle.context().agent_chain, vec!["double"]);
        let record = handle.wait().await.unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result, Some(json!(42)));
        assert!(record.end_time.is_some());
    }

    #[tokio::test]
    async fn test_spawn_unknown_worker_creates_nothing() {
        let orch = orchestrator();
        let err = orch
            .spawn("ghost", &ExecutionContext::default(), None)
            .await
            .err()
            .unwrap();
        assert!(err.is_configuration());
        assert_eq!(orch.registry().stats().await.active, 0);
    }

    #[tokio::test]
    async fn test_sequential_chain_forwards_results() {
        let orch = orchestrator();
        let outcome = orch
            .run_workflow("quad", ExecutionContext::new(json!(3)))
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.result, Some(json!(12)));
        assert_eq!(outcome.stages.len(), 2);
        for stage in &outcome.stages {
            let record = orch.status_of(&stage.task_id).await.unwrap();
            assert_eq!(record.parent_task_id.as_deref(), Some(outcome.workflow_id.as_str()));
        }
    }

    #[tokio::test]
    async fn test_repeated_worker_stages_report_distinct_names() {
        let orch = orchestrator();
        orch.register_workflow(Workflow::chain("octo", &["double", "double", "double"]))
            .await
            .unwrap();
        let outcome = orch
            .run_workflow("octo", ExecutionContext::new(json!(1)))
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.result, Some(json!(8)));
        let names: Vec<_> = outcome.stages.iter().map(|s| s.stage.as_str()).collect();
        assert_eq!(names, vec!["double", "double#2", "double#3"]);
        assert!(outcome.stages.iter().all(|s| s.agent_type == "double"));
    }

    #[tokio::test]
    async fn test_failure_outcome_serializes_compactly() {
        let orch = orchestrator();
        orch.register_workflow(Workflow::chain("bad", &["boom"]))
            .await
            .unwrap();
        let outcome = orch
            .run_workflow("bad", ExecutionContext::default())
            .await
            .unwrap();

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["success"], json!(false));
        assert_eq!(json["failed_at"], json!("boom"));
        assert_eq!(json["error"], json!("boom"));
        assert!(json.get("result").is_none());
    }

    #[tokio::test]
    async fn test_register_workflow_with_unknown_worker() {
        let orch = orchestrator();
        let err = orch
            .register_workflow(Workflow::chain("x", &["ghost"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownWorker(_)));
    }

    #[tokio::test]
    async fn test_build_rejects_catalog_with_unknown_worker() {
        let catalog = WorkflowCatalog::new()
            .with_workflow(Workflow::chain("x", &["ghost"]))
            .unwrap();
        let result = Orchestrator::new(OrchestratorConfig::default(), workers(), catalog);
        assert!(matches!(result, Err(Error::UnknownWorker(_))));
    }

    #[tokio::test]
    async fn test_health_and_shutdown() {
        let orch = orchestrator();
        let report = orch.health().await;
        assert!(report.healthy);
        assert_eq!(report.workers.len(), 2);
        orch.shutdown().await;
    }
}
