//! hazardflow - Disaster-risk model service orchestrator
//!
//! Coordinates a fleet of independent model services (fire, flood,
//! climate, weather) that share one tool-invocation contract, and composes
//! them into DAG workflows.
//!
//! # Architecture
//!
//! - A service registry tracks every backend's health; repeated failures
//!   open a circuit so calls are refused without touching the network
//! - A resilient RPC client retries transport failures with backoff and
//!   polls asynchronous executions to completion
//! - A workflow engine runs steps whose dependencies are satisfied, in
//!   scan passes, recording every transition as an event
//!
//! # Modules
//!
//! - `adapters`: Transport seam and its HTTP implementation
//! - `core`: Registry, client, definitions, engine
//! - `handlers`: One handler per step type
//! - `domain`: Data structures (ServiceEndpoint, CallResult, WorkflowInstance)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Check which services are up
//! hazardflow services --probe
//!
//! # Run a workflow
//! hazardflow run nfdrs4_fire_risk_assessment \
//!     --params '{"location": "Hangzhou", "coordinates": {"lat": 30.28, "lng": 120.15}}'
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod handlers;

// Re-export main types at crate root for convenience
pub use core::{RpcClient, ServiceRegistry, WorkflowEngine};
pub use domain::{
    CallResult, InstanceStatus, OrchestratorError, ServiceStatus, WorkflowEvent, WorkflowInstance,
};
