//! Domain types for the hazardflow orchestrator.
//!
//! This module contains the core data structures:
//! - Service: registered backends and their health
//! - Call: outcome of one tool invocation
//! - Workflow: instances and steps
//! - Events: recorded state changes
//! - Error: the failure taxonomy

pub mod call;
pub mod error;
pub mod events;
pub mod service;
pub mod workflow;

// Re-export commonly used types
pub use call::CallResult;
pub use error::{ErrorKind, OrchestratorError};
pub use events::{EventType, WorkflowEvent};
pub use service::{ServiceEndpoint, ServiceStatus};
pub use workflow::{InstanceStatus, StepStatus, StepType, WorkflowInstance, WorkflowStep};
