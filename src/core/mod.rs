//! Core orchestration logic.
//!
//! This module contains:
//! - Registry: Service endpoints, health probing, circuit breaking
//! - Client: Remote tool invocation with retry and polling
//! - Definition: Workflow definitions and loading
//! - Template: `${...}` parameter references
//! - Engine: DAG workflow execution

pub mod client;
pub mod definition;
pub mod engine;
pub mod poller;
pub mod registry;
pub mod retry;
pub mod template;

// Re-export commonly used types
pub use client::{ClientSettings, RpcClient, ToolRequest};
pub use definition::{builtin_definitions, StepTemplate, WorkflowDefinition};
pub use engine::{DefinitionInfo, EngineSettings, WorkflowEngine};
pub use poller::ExecutionPoller;
pub use registry::{HealthSettings, ServiceRegistry};
pub use retry::{with_retry, RetryPolicy};
pub use template::TemplateContext;
