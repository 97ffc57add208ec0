//! Orchestration engine
//!
//! Task registry, message bus, worker registry, workflow catalog and the
//! orchestrator that composes them.
//!
//! ```rust,no_run
//! use orch_core::{ExecutionContext, OrchestratorConfig};
//! use orch_engine::{FnWorker, Orchestrator, Workflow, WorkflowCatalog, WorkerRegistry};
//!
//! # async fn demo() -> orch_core::Result<()> {
//! let workers = WorkerRegistry::new()
//!     .with_worker(FnWorker::new("echo", |ctx: ExecutionContext| async move { Ok(ctx.payload) }))?;
//! let catalog = WorkflowCatalog::new().with_workflow(Workflow::chain("twice", &["echo", "echo"]))?;
//! let orchestrator = Orchestrator::new(OrchestratorConfig::default(), workers, catalog)?;
//!
//! let outcome = orchestrator
//!     .run_workflow("twice", ExecutionContext::new(serde_json::json!({"file": "a.js"})))
//!     .await?;
//! assert!(outcome.success);
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod dispatcher;
pub mod health;
pub mod metrics;
pub mod orchestrator;
pub mod recorder;
pub mod registry;
pub mod worker;
pub mod workflow;

pub use bus::MessageBus;
pub use dispatcher::Dispatcher;
pub use health::{HealthReport, OverdueTask, WorkerHealth};
pub use metrics::OrchestratorMetrics;
pub use orchestrator::{
    AgentSpec, Orchestrator, OrchestratorBuilder, StageOutcome, TaskHandle, TaskOutcome,
    WorkflowOutcome,
};
pub use recorder::{JsonLinesRecorder, MemoryRecorder, TaskRecorder};
pub use registry::{Partition, RegistryStats, TaskEvent, TaskRegistry};
pub use worker::{FnWorker, Worker, WorkerInfo, WorkerRegistry};
pub use workflow::{ExecutionMode, Stage, Workflow, WorkflowCatalog};
