//! Core types and utilities for the agent orchestrator
//!
//! # Modules
//!
//! - `config`: Environment loading and `OrchestratorConfig`
//! - `context`: `ExecutionContext` carried between workflow stages
//! - `error`: Error types and Result alias
//! - `message`: Message envelope for the message bus
//! - `task`: Task records and the lifecycle state machine

pub mod config;
pub mod context;
pub mod error;
pub mod message;
pub mod task;

// Re-exports
pub use config::OrchestratorConfig;
pub use context::ExecutionContext;
pub use error::{Error, Result};
pub use message::{Destination, Message, MessageType, Priority};
pub use task::{StatusUpdate, TaskRecord, TaskStatus};
