//! Registered backend services and their live health state.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default number of consecutive errors before a service is marked unhealthy
pub const DEFAULT_ERROR_THRESHOLD: u32 = 3;

/// Default per-call timeout for a service (30s)
pub const DEFAULT_SERVICE_TIMEOUT_MS: u64 = 30_000;

/// A backend model service reachable over the tool-invocation contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    /// Unique service name (registry key)
    pub name: String,

    /// Base address, e.g. `http://localhost:8004`
    pub base_url: String,

    /// Liveness probe address
    pub health_url: String,

    /// Current health status
    pub status: ServiceStatus,

    /// When the service was last probed or called
    pub last_check: Option<DateTime<Utc>>,

    /// Latency of the last probe or call in milliseconds
    pub last_latency_ms: Option<u64>,

    /// Consecutive failed probes/calls
    pub error_count: u32,

    /// Consecutive failures that flip the status to Unhealthy
    pub error_threshold: u32,

    /// Default timeout for calls and probes in milliseconds
    pub timeout_ms: u64,
}

impl ServiceEndpoint {
    /// Create an endpoint whose health check lives at `<base_url>/health`
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let health_url = format!("{}/health", base_url);

        Self {
            name: name.into(),
            base_url,
            health_url,
            status: ServiceStatus::Unknown,
            last_check: None,
            last_latency_ms: None,
            error_count: 0,
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            timeout_ms: DEFAULT_SERVICE_TIMEOUT_MS,
        }
    }

    pub fn with_health_url(mut self, health_url: impl Into<String>) -> Self {
        self.health_url = health_url.into();
        self
    }

    pub fn with_error_threshold(mut self, threshold: u32) -> Self {
        self.error_threshold = threshold.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Default timeout as a Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// `POST` target for tool invocations
    pub fn execute_url(&self) -> String {
        format!("{}/execute", self.base_url)
    }

    /// `GET` target for the status of an asynchronous execution
    pub fn status_url(&self, execution_id: &str) -> String {
        format!("{}/status/{}", self.base_url, execution_id)
    }

    /// `DELETE` target that stops an asynchronous execution
    pub fn cancel_url(&self, execution_id: &str) -> String {
        format!("{}/executions/{}", self.base_url, execution_id)
    }

    /// `GET` target for the tool catalog
    pub fn tools_url(&self) -> String {
        format!("{}/tools", self.base_url)
    }

    /// `GET` target describing one tool
    pub fn tool_url(&self, tool_name: &str) -> String {
        format!("{}/tools/{}", self.base_url, tool_name)
    }

    /// Whether calls are refused without touching the network
    pub fn is_circuit_open(&self) -> bool {
        self.status == ServiceStatus::Unhealthy
    }

    /// Record a successful probe or call
    pub fn mark_success(&mut self, latency: Duration) {
        self.error_count = 0;
        self.status = ServiceStatus::Healthy;
        self.last_latency_ms = Some(latency.as_millis() as u64);
        self.last_check = Some(Utc::now());
    }

    /// Record a failed probe or call; returns the resulting status
    pub fn mark_failure(&mut self, latency: Duration) -> ServiceStatus {
        self.error_count = self.error_count.saturating_add(1);
        self.status = if self.error_count >= self.error_threshold {
            ServiceStatus::Unhealthy
        } else {
            ServiceStatus::Degraded
        };
        self.last_latency_ms = Some(latency.as_millis() as u64);
        self.last_check = Some(Utc::now());
        self.status
    }
}

/// Health of a registered service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Healthy,
    /// Failing, but below the error threshold
    Degraded,
    /// Circuit open: calls are refused until a probe succeeds
    Unhealthy,
    /// Not probed yet
    Unknown,
}

impl Default for ServiceStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}
