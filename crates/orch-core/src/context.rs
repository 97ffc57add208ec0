//! Execution context carried through a workflow run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Forward-propagated payload passed between stages.
///
/// Treated as immutable once handed to a worker: the orchestrator derives a
/// fresh child for every stage instead of sharing one mutable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Stable for the life of one workflow run
    pub workflow_id: String,

    /// Stage currently producing/consuming this context
    pub task_id: Option<String>,

    /// Task id of the context this one was derived from (read-only back-reference)
    pub parent_task_id: Option<String>,

    /// Workers that processed this context, append-only
    pub agent_chain: Vec<String>,

    /// Free-form metadata, last write wins
    pub metadata: HashMap<String, Value>,

    /// Opaque interchange payload (the previous stage's result)
    pub payload: Value,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionContext {
    /// Create the root context for a new workflow run
    pub fn new(payload: Value) -> Self {
        Self::for_workflow(&Uuid::new_v4().to_string(), payload)
    }

    /// Create a root context with an explicit workflow id
    pub fn for_workflow(workflow_id: &str, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow_id.to_string(),
            task_id: None,
            parent_task_id: None,
            agent_chain: Vec::new(),
            metadata: HashMap::new(),
            payload,
            created_at: now,
            updated_at: now,
        }
    }

    /// Derive the context handed to one stage. Appends exactly one chain entry.
    pub fn derive(&self, task_id: &str, agent_type: &str) -> Self {
        let now = Utc::now();
        let mut agent_chain = self.agent_chain.clone();
        agent_chain.push(agent_type.to_string());

        Self {
            workflow_id: self.workflow_id.clone(),
            task_id: Some(task_id.to_string()),
            parent_task_id: self.task_id.clone(),
            agent_chain,
            metadata: self.metadata.clone(),
            payload: self.payload.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the payload with a stage result, keeping identity and chain.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self.updated_at = Utc::now();
        self
    }

    /// Set a metadata entry
    pub fn set_metadata(&mut self, key: &str, value: Value) {
        self.metadata.insert(key.to_string(), value);
        self.updated_at = Utc::now();
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.set_metadata(key, value);
        self
    }

    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Last worker that touched this context
    pub fn last_agent(&self) -> Option<&str> {
        self.agent_chain.last().map(String::as_str)
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_derive_appends_one_entry() {
        let root = ExecutionContext::new(json!({"file": "a.js"}));
        let first = root.derive("parse-1", "parse");
        let second = first.derive("dedupe-2", "dedupe");

        assert!(root.agent_chain.is_empty());
        assert_eq!(first.agent_chain, vec!["parse"]);
        assert_eq!(second.agent_chain, vec!["parse", "dedupe"]);
        assert_eq!(second.workflow_id, root.workflow_id);
        assert_eq!(second.parent_task_id.as_deref(), Some("parse-1"));
        assert_eq!(second.task_id.as_deref(), Some("dedupe-2"));
        assert_eq!(second.last_agent(), Some("dedupe"));
    }

    #[test]
    fn test_children_do_not_alias_parent() {
        let mut root = ExecutionContext::new(json!(1)).with_metadata("k", json!("v"));
        let child = root.derive("t-1", "w");
        root.set_metadata("k", json!("changed"));

        assert_eq!(child.get_metadata("k"), Some(&json!("v")));
    }

    #[test]
    fn test_metadata_last_write_wins() {
        let mut ctx = ExecutionContext::default();
        ctx.set_metadata("attempt", json!(1));
        ctx.set_metadata("attempt", json!(2));
        assert_eq!(ctx.metadata.len(), 1);
        assert_eq!(ctx.get_metadata("attempt"), Some(&json!(2)));
    }

    #[test]
    fn test_with_payload_keeps_chain() {
        let ctx = ExecutionContext::new(json!({}))
            .derive("parse-1", "parse")
            .with_payload(json!({"actions": []}));
        assert_eq!(ctx.agent_chain, vec!["parse"]);
        assert_eq!(ctx.payload, json!({"actions": []}));
    }
}
