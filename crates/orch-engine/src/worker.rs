//! Worker capability and registry
//!
//! A worker is a named unit of work: it takes an [`ExecutionContext`] and
//! produces an opaque JSON result or an error. The engine never looks inside
//! the result; it only forwards it as the next stage's payload.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use orch_core::{Error, ExecutionContext, Result};

/// Worker trait - the only capability the engine needs from a worker
#[async_trait]
pub trait Worker: Send + Sync {
    /// Name used for lookup in the registry and as the task's agent type
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Run once for one task. The error's display form becomes the task error.
    async fn execute(&self, context: ExecutionContext) -> anyhow::Result<Value>;

    /// Accept or reject a produced result. Rejection fails the task.
    fn validate_output(&self, _output: &Value) -> std::result::Result<(), String> {
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}

/// Worker built from a closure
pub struct FnWorker<F> {
    name: String,
    description: String,
    func: F,
}

impl<F, Fut> FnWorker<F>
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            func,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[async_trait]
impl<F, Fut> Worker for FnWorker<F>
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn execute(&self, context: ExecutionContext) -> anyhow::Result<Value> {
        (self.func)(context).await
    }
}

/// Summary of a registered worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub name: String,
    pub description: String,
}

/// Name to worker map, resolved once at startup
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    workers: HashMap<String, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker under its own name. A second worker with the same
    /// name is a configuration error.
    pub fn register(&mut self, worker: Arc<dyn Worker>) -> Result<()> {
        let name = worker.name().to_string();
        if name.trim().is_empty() {
            return Err(Error::config("worker name must not be empty"));
        }
        if self.workers.contains_key(&name) {
            return Err(Error::config(format!("worker '{}' registered twice", name)));
        }
        self.workers.insert(name, worker);
        Ok(())
    }

    pub fn with_worker(mut self, worker: impl Worker + 'static) -> Result<Self> {
        self.register(Arc::new(worker))?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Worker>> {
        self.workers.get(name).cloned()
    }

    /// Look up a worker, failing with `UnknownWorker`
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Worker>> {
        self.get(name)
            .ok_or_else(|| Error::UnknownWorker(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn list(&self) -> Vec<WorkerInfo> {
        self.names()
            .into_iter()
            .filter_map(|name| {
                self.workers.get(&name).map(|w| WorkerInfo {
                    description: w.description().to_string(),
                    name,
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn Worker>)> {
        self.workers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    type Ready = futures::future::Ready<anyhow::Result<Value>>;

    fn echo() -> FnWorker<impl Fn(ExecutionContext) -> Ready + Send + Sync> {
        FnWorker::new("echo", |ctx: ExecutionContext| futures::future::ready(Ok(ctx.payload)))
            .with_description("returns its input")
    }

    #[tokio::test]
    async fn test_fn_worker_executes() {
        let worker = echo();
        let out = worker
            .execute(ExecutionContext::new(json!({"a": 1})))
            .await
            .unwrap();
        assert_eq!(out, json!({"a": 1}));
        assert!(worker.validate_output(&out).is_ok());
        assert!(worker.is_healthy().await);
    }

    #[test]
    fn test_resolve_unknown_is_configuration_error() {
        let registry = WorkerRegistry::new().with_worker(echo()).unwrap();
        assert!(registry.resolve("echo").is_ok());

        let err = registry.resolve("missing").err().unwrap();
        assert!(matches!(err, Error::UnknownWorker(ref n) if n == "missing"));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = WorkerRegistry::new().with_worker(echo()).unwrap();
        assert!(registry.with_worker(echo()).is_err());
    }

    #[test]
    fn test_list_is_sorted() {
        let registry = WorkerRegistry::new()
            .with_worker(FnWorker::new("b", |_c: ExecutionContext| async { Ok(Value::Null) }))
            .unwrap()
            .with_worker(echo())
            .unwrap();
        assert_eq!(registry.names(), vec!["b".to_string(), "echo".to_string()]);
        assert_eq!(registry.list()[1].description, "returns its input");
    }
}
