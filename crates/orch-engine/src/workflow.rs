//! Workflow definitions and catalog
//!
//! A workflow is a named, ordered list of stages. Each stage names the worker
//! that runs it. Stage order is fixed at definition time; a parallel workflow
//! runs its stages concurrently but still reports them in declared order.
//!
//! A stage without an explicit name is named after its worker. When the same
//! worker appears again, later stages get a `#n` suffix (`echo`, `echo#2`).
//!
//! Catalogs load from YAML:
//!
//! ```yaml
//! workflows:
//!   ingest:
//!     description: Parse, dedupe and convert a recording
//!     stages:
//!       - parse
//!       - dedupe
//!       - name: convert
//!         worker: gherkin
//!         timeout_ms: 30000
//!   audit:
//!     mode: parallel
//!     stages: [lint, score]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use orch_core::{Error, Result};

use crate::worker::WorkerRegistry;

/// How a workflow's stages are scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Each stage consumes the previous stage's result
    #[default]
    Sequential,
    /// All stages run against the initial context
    Parallel,
}

/// One worker's position in a workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stage {
    /// Unique within the workflow; reported as `failed_at`
    pub name: String,
    /// Worker that runs this stage
    pub worker: String,
    /// Per-stage deadline in milliseconds, overriding the orchestrator default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Stage {
    /// Stage named after its worker
    pub fn new(worker: &str) -> Self {
        Self {
            name: worker.to_string(),
            worker: worker.to_string(),
            timeout_ms: None,
        }
    }

    pub fn named(name: &str, worker: &str) -> Self {
        Self {
            name: name.to_string(),
            worker: worker.to_string(),
            timeout_ms: None,
        }
    }

    /// Millisecond precision; a deadline under 1ms fails validation
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    fn implicitly_named(&self) -> bool {
        self.name == self.worker
    }
}

/// Give repeated implicitly named stages a `#n` suffix
fn unique_stage_names(mut stages: Vec<Stage>) -> Vec<Stage> {
    let mut taken: HashSet<String> = HashSet::new();
    for stage in &mut stages {
        if stage.implicitly_named() && taken.contains(&stage.name) {
            let mut n = 2;
            while taken.contains(&format!("{}#{}", stage.worker, n)) {
                n += 1;
            }
            stage.name = format!("{}#{}", stage.worker, n);
        }
        taken.insert(stage.name.clone());
    }
    stages
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StageDef {
    Worker(String),
    Full {
        name: Option<String>,
        worker: String,
        timeout_ms: Option<u64>,
        timeout_secs: Option<u64>,
    },
}

impl<'de> Deserialize<'de> for Stage {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(match StageDef::deserialize(deserializer)? {
            StageDef::Worker(worker) => Stage::new(&worker),
            StageDef::Full {
                name,
                worker,
                timeout_ms,
                timeout_secs,
            } => Stage {
                name: name.unwrap_or_else(|| worker.clone()),
                worker,
                timeout_ms: timeout_ms
                    .or_else(|| timeout_secs.map(|secs| secs.saturating_mul(1000))),
            },
        })
    }
}

/// Workflow definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub stages: Vec<Stage>,
}

impl Workflow {
    pub fn sequential(name: &str, stages: Vec<Stage>) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            mode: ExecutionMode::Sequential,
            stages: unique_stage_names(stages),
        }
    }

    pub fn parallel(name: &str, stages: Vec<Stage>) -> Self {
        Self {
            mode: ExecutionMode::Parallel,
            ..Self::sequential(name, stages)
        }
    }

    /// Sequential workflow whose stages are named after their workers,
    /// suffixed when a worker repeats
    pub fn chain(name: &str, workers: &[&str]) -> Self {
        Self::sequential(name, workers.iter().map(|w| Stage::new(w)).collect())
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Zero stages means direct execution outside the engine
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Structural checks
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid_workflow(&self.name, "workflow name must not be empty"));
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if stage.worker.trim().is_empty() {
                return Err(Error::invalid_workflow(
                    &self.name,
                    format!("stage '{}' has no worker", stage.name),
                ));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(Error::invalid_workflow(
                    &self.name,
                    format!("duplicate stage name: {}", stage.name),
                ));
            }
            if stage.timeout_ms == Some(0) {
                return Err(Error::invalid_workflow(
                    &self.name,
                    format!("stage '{}' has a zero timeout", stage.name),
                ));
            }
        }
        Ok(())
    }

    /// Every stage's worker must be registered
    pub fn validate_workers(&self, workers: &WorkerRegistry) -> Result<()> {
        for stage in &self.stages {
            if !workers.contains(&stage.worker) {
                return Err(Error::UnknownWorker(stage.worker.clone()));
            }
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct CatalogFile {
    #[serde(default)]
    workflows: BTreeMap<String, Workflow>,
}

/// Named workflows
#[derive(Debug, Clone, Default)]
pub struct WorkflowCatalog {
    workflows: BTreeMap<String, Workflow>,
}

impl WorkflowCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a workflow
    pub fn register(&mut self, mut workflow: Workflow) -> Result<()> {
        workflow.stages = unique_stage_names(workflow.stages);
        workflow.validate()?;
        self.workflows.insert(workflow.name.clone(), workflow);
        Ok(())
    }

    pub fn with_workflow(mut self, workflow: Workflow) -> Result<Self> {
        self.register(workflow)?;
        Ok(self)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let file: CatalogFile = serde_yaml::from_str(yaml)?;
        let mut catalog = Self::new();
        for (name, mut workflow) in file.workflows {
            workflow.name = name;
            catalog.register(workflow)?;
        }
        Ok(catalog)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await?;
        let catalog = Self::from_yaml_str(&content)?;
        info!(path = %path.display(), workflows = catalog.len(), "Loaded workflow catalog");
        Ok(catalog)
    }

    pub fn get(&self, name: &str) -> Option<&Workflow> {
        self.workflows.get(name)
    }

    /// Look up a workflow, failing with `UnknownWorkflow`
    pub fn resolve(&self, name: &str) -> Result<&Workflow> {
        self.get(name)
            .ok_or_else(|| Error::UnknownWorkflow(name.to_string()))
    }

    /// Ordered stage list for a workflow
    pub fn stages(&self, name: &str) -> Result<&[Stage]> {
        Ok(&self.resolve(name)?.stages)
    }

    pub fn names(&self) -> Vec<&str> {
        self.workflows.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Workflow> {
        self.workflows.values()
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    /// Check every workflow against the worker registry
    pub fn validate_workers(&self, workers: &WorkerRegistry) -> Result<()> {
        for workflow in self.workflows.values() {
            workflow.validate_workers(workers)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
workflows:
  ingest:
    description: Parse, dedupe and convert
    stages:
      - parse
      - dedupe
      - name: convert
        worker: gherkin
        timeout_secs: 30
  audit:
    mode: parallel
    stages: [lint, score]
  direct:
    description: handled outside the engine
"#;

    #[test]
    fn test_load_yaml_catalog() {
        let catalog = WorkflowCatalog::from_yaml_str(CATALOG).unwrap();
        assert_eq!(catalog.names(), vec!["audit", "direct", "ingest"]);

        let ingest = catalog.resolve("ingest").unwrap();
        assert_eq!(ingest.mode, ExecutionMode::Sequential);
        assert_eq!(ingest.stage_names(), vec!["parse", "dedupe", "convert"]);
        assert_eq!(ingest.stages[2].worker, "gherkin");
        assert_eq!(ingest.stages[2].timeout(), Some(Duration::from_secs(30)));

        assert_eq!(catalog.resolve("audit").unwrap().mode, ExecutionMode::Parallel);
        assert!(catalog.stages("direct").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_workflow() {
        let catalog = WorkflowCatalog::new();
        let err = catalog.resolve("nope").unwrap_err();
        assert!(matches!(err, Error::UnknownWorkflow(_)));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_repeated_worker_gets_suffixed_stage_names() {
        let workflow = Workflow::chain("twice", &["parse", "lint", "parse", "parse"]);
        assert_eq!(workflow.stage_names(), vec!["parse", "lint", "parse#2", "parse#3"]);
        assert_eq!(workflow.stages.iter().filter(|s| s.worker == "parse").count(), 3);
        workflow.validate().unwrap();
    }

    #[test]
    fn test_repeated_worker_in_yaml() {
        let catalog = WorkflowCatalog::from_yaml_str(
            r#"
workflows:
  broken:
    stages:
      - echo
      - name: explode
        worker: fail
      - echo
"#,
        )
        .unwrap();
        let broken = catalog.resolve("broken").unwrap();
        assert_eq!(broken.stage_names(), vec!["echo", "explode", "echo#2"]);
        assert_eq!(broken.stages[2].worker, "echo");
    }

    #[test]
    fn test_explicit_duplicate_stage_names_rejected() {
        let workflow = Workflow::sequential(
            "twice",
            vec![Stage::named("step", "parse"), Stage::named("step", "lint")],
        );
        assert!(matches!(
            workflow.validate(),
            Err(Error::InvalidWorkflow { .. })
        ));
    }

    #[test]
    fn test_stage_timeout_keeps_millisecond_precision() {
        let stage = Stage::new("quick").with_timeout(Duration::from_millis(200));
        assert_eq!(stage.timeout(), Some(Duration::from_millis(200)));

        let catalog = WorkflowCatalog::from_yaml_str(
            r#"
workflows:
  fast:
    stages:
      - worker: quick
        timeout_ms: 250
"#,
        )
        .unwrap();
        assert_eq!(
            catalog.stages("fast").unwrap()[0].timeout(),
            Some(Duration::from_millis(250))
        );

        let zero = Workflow::sequential(
            "z",
            vec![Stage::new("quick").with_timeout(Duration::from_micros(10))],
        );
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_validate_workers() {
        let workflow = Workflow::chain("ingest", &["parse"]);
        let err = workflow.validate_workers(&WorkerRegistry::new()).unwrap_err();
        assert!(matches!(err, Error::UnknownWorker(ref w) if w == "parse"));
    }

    #[test]
    fn test_bad_yaml_is_error() {
        assert!(WorkflowCatalog::from_yaml_str("workflows: [").is_err());
    }
}
