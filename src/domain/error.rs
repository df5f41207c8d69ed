//! Error taxonomy shared by the registry, the RPC client and the engine.
//!
//! Failures never escape `invoke()` or `execute()` as `Err`. A `CallResult`
//! carries the error value itself; a `WorkflowStep` keeps its message plus an
//! [`ErrorKind`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Orchestration failures
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum OrchestratorError {
    /// Unknown workflow, malformed parameters or definitions
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown service or circuit open
    #[error("Service '{service}' unavailable: {reason}")]
    ServiceUnavailable { service: String, reason: String },

    /// Network failure after the retry budget was spent
    #[error("Transport error: {0}")]
    Transport(String),

    /// The tool ran and reported a failure
    #[error("Remote execution failed: {0}")]
    RemoteExecution(String),

    /// Local or remote deadline elapsed
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// No pending step can make progress
    #[error("Dependency deadlock: steps {pending:?} can never become eligible")]
    DependencyDeadlock { pending: Vec<String> },
}

impl OrchestratorError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn unavailable(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            service: service.into(),
            reason: reason.into(),
        }
    }

    /// Machine-readable category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::ServiceUnavailable { .. } => ErrorKind::ServiceUnavailable,
            Self::Transport(_) => ErrorKind::Transport,
            Self::RemoteExecution(_) => ErrorKind::RemoteExecution,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::DependencyDeadlock { .. } => ErrorKind::DependencyDeadlock,
        }
    }
}

/// Category of an [`OrchestratorError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    ServiceUnavailable,
    Transport,
    RemoteExecution,
    Timeout,
    Cancelled,
    DependencyDeadlock,
}

impl ErrorKind {
    /// Whether this kind says something about service reachability
    pub fn is_connectivity_fault(&self) -> bool {
        matches!(self, Self::Transport | Self::Timeout)
    }
}
