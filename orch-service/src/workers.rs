//! Built-in demonstration workers

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use orch_core::{ExecutionContext, Result};
use orch_engine::{Worker, WorkerRegistry};

/// Workflows over the built-in workers, used when no catalog file is given
pub const BUILTIN_CATALOG: &str = r#"
workflows:
  echo-twice:
    description: Pass the input through two echo stages
    stages: [echo, echo]
  delayed:
    description: Wait, then echo
    stages:
      - delay
      - echo
  broken:
    description: Fails at the second stage; the third never runs
    stages:
      - echo
      - name: explode
        worker: fail
      - echo
  fanout:
    description: Echo and delay side by side
    mode: parallel
    stages: [echo, delay]
"#;

/// Returns its input unchanged
pub struct EchoWorker;

#[async_trait]
impl Worker for EchoWorker {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Returns the input payload unchanged"
    }

    async fn execute(&self, context: ExecutionContext) -> anyhow::Result<Value> {
        Ok(context.payload)
    }
}

/// Sleeps for `delay_ms` (default 100) and returns its input
pub struct DelayWorker;

#[async_trait]
impl Worker for DelayWorker {
    fn name(&self) -> &str {
        "delay"
    }

    fn description(&self) -> &str {
        "Sleeps for payload.delay_ms milliseconds, then returns the payload"
    }

    async fn execute(&self, context: ExecutionContext) -> anyhow::Result<Value> {
        let delay_ms = context
            .payload
            .get("delay_ms")
            .and_then(Value::as_u64)
            .unwrap_or(100);
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        Ok(context.payload)
    }
}

/// Always fails with `payload.error` or a fixed message
pub struct FailWorker;

#[async_trait]
impl Worker for FailWorker {
    fn name(&self) -> &str {
        "fail"
    }

    fn description(&self) -> &str {
        "Fails with payload.error"
    }

    async fn execute(&self, context: ExecutionContext) -> anyhow::Result<Value> {
        let message = context
            .payload
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("requested failure");
        anyhow::bail!("{}", message)
    }
}

pub fn builtin_workers() -> Result<WorkerRegistry> {
    WorkerRegistry::new()
        .with_worker(EchoWorker)?
        .with_worker(DelayWorker)?
        .with_worker(FailWorker)
}
