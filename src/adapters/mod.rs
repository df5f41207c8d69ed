//! Transport seam between the orchestrator and model services.
//!
//! A [`Transport`] makes exactly one attempt per call, bounded by the timeout
//! it is given. Retries, circuit breaking and polling live above it in
//! `core`, so any transport (HTTP, in-process test doubles) gets them for free.

pub mod http;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::ServiceEndpoint;

// Re-export the HTTP transport
pub use http::HttpTransport;

/// Body of `POST /execute`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub tool_name: String,
    pub parameters: Value,
    #[serde(default)]
    pub priority: i32,
}

impl ExecuteRequest {
    pub fn new(tool_name: impl Into<String>, parameters: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            parameters,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Response of `POST /execute` and `GET /status/{execution_id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub status: RemoteStatus,

    #[serde(default)]
    pub result: Value,

    #[serde(default)]
    pub execution_id: Option<String>,

    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionReport {
    pub fn completed(result: Value) -> Self {
        Self {
            status: RemoteStatus::Completed,
            result,
            execution_id: None,
            error: None,
        }
    }

    pub fn running(execution_id: impl Into<String>) -> Self {
        Self {
            status: RemoteStatus::Running,
            result: Value::Null,
            execution_id: Some(execution_id.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: RemoteStatus::Failed,
            result: Value::Null,
            execution_id: None,
            error: Some(error.into()),
        }
    }
}

/// Filters for `GET /tools`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl ToolFilter {
    pub fn category(category: impl Into<String>) -> Self {
        Self {
            category: Some(category.into()),
            ..Default::default()
        }
    }

    /// Query pairs for the set filters only
    pub fn query(&self) -> Vec<(&'static str, &str)> {
        let mut pairs = Vec::new();
        if let Some(model_name) = &self.model_name {
            pairs.push(("model_name", model_name.as_str()));
        }
        if let Some(category) = &self.category {
            pairs.push(("category", category.as_str()));
        }
        pairs
    }
}

/// Execution status reported by a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    #[serde(other)]
    Unknown,
}

impl RemoteStatus {
    /// Whether the remote work is still in progress
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

/// Failure of a single transport attempt
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The service answered with a non-success status
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("invalid response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Only network-level failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Timeout(_))
    }
}

/// One-attempt access to a model service
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable transport name
    fn name(&self) -> &str;

    /// Submit a tool invocation
    async fn execute(
        &self,
        endpoint: &ServiceEndpoint,
        request: &ExecuteRequest,
        timeout: Duration,
    ) -> Result<ExecutionReport, TransportError>;

    /// Query the status of an asynchronous execution
    async fn execution_status(
        &self,
        endpoint: &ServiceEndpoint,
        execution_id: &str,
        timeout: Duration,
    ) -> Result<ExecutionReport, TransportError>;

    /// Ask the service to stop an asynchronous execution
    async fn cancel_execution(
        &self,
        endpoint: &ServiceEndpoint,
        execution_id: &str,
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Tool catalog of the service
    async fn list_tools(
        &self,
        endpoint: &ServiceEndpoint,
        filter: &ToolFilter,
        timeout: Duration,
    ) -> Result<Value, TransportError>;

    /// Description of a single tool
    async fn tool_info(
        &self,
        endpoint: &ServiceEndpoint,
        tool_name: &str,
        timeout: Duration,
    ) -> Result<Value, TransportError>;

    /// Lightweight liveness probe
    async fn health_check(
        &self,
        endpoint: &ServiceEndpoint,
        timeout: Duration,
    ) -> Result<(), TransportError>;
}
