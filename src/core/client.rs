//! Resilient RPC client.
//!
//! `invoke` is the only call contract the rest of the crate uses. It hides
//! circuit breaking, transport retries and the sync/async split of remote
//! execution behind a single [`CallResult`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::poller::ExecutionPoller;
use super::registry::ServiceRegistry;
use super::retry::{with_retry, RetryPolicy};
use crate::adapters::{
    ExecuteRequest, ExecutionReport, RemoteStatus, ToolFilter, Transport, TransportError,
};
use crate::domain::{CallResult, OrchestratorError, ServiceEndpoint};

/// RPC client settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Backoff for transport failures on `POST /execute`
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Sleep between status polls in milliseconds (default: 2000)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Consecutive failed polls tolerated (default: 3)
    #[serde(default = "default_poll_retry_budget")]
    pub poll_retry_budget: u32,

    /// Priority sent when a request does not set one
    #[serde(default)]
    pub default_priority: i32,
}

fn default_poll_interval() -> u64 {
    2000
}
fn default_poll_retry_budget() -> u32 {
    3
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            poll_interval_ms: default_poll_interval(),
            poll_retry_budget: default_poll_retry_budget(),
            default_priority: 0,
        }
    }
}

impl ClientSettings {
    pub fn poller(&self) -> ExecutionPoller {
        ExecutionPoller::new(
            Duration::from_millis(self.poll_interval_ms),
            self.poll_retry_budget,
        )
    }
}

/// One tool invocation
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRequest {
    pub service: String,
    pub tool: String,
    pub parameters: Value,
    pub priority: Option<i32>,
    /// Overall deadline; the endpoint's default when unset
    pub timeout: Option<Duration>,
}

impl ToolRequest {
    pub fn new(service: impl Into<String>, tool: impl Into<String>, parameters: Value) -> Self {
        Self {
            service: service.into(),
            tool: tool.into(),
            parameters,
            priority: None,
            timeout: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Client over the tool-invocation contract
pub struct RpcClient {
    registry: Arc<ServiceRegistry>,
    transport: Arc<dyn Transport>,
    settings: ClientSettings,
    poller: ExecutionPoller,
}

impl RpcClient {
    /// Create a client sharing the registry's transport
    pub fn new(registry: Arc<ServiceRegistry>, settings: ClientSettings) -> Self {
        let transport = registry.transport();
        let poller = settings.poller();
        Self {
            registry,
            transport,
            settings,
            poller,
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Invoke `tool` on `service`. Never fails; see [`CallResult`].
    pub async fn invoke(
        &self,
        service: &str,
        tool: &str,
        parameters: Value,
        timeout: Option<Duration>,
    ) -> CallResult {
        let mut request = ToolRequest::new(service, tool, parameters);
        request.timeout = timeout;
        self.invoke_request(&request, &CancellationToken::new()).await
    }

    /// Invoke with an explicit priority, deadline and cancellation token
    #[instrument(skip(self, request, cancel), fields(service = %request.service, tool = %request.tool))]
    pub async fn invoke_request(
        &self,
        request: &ToolRequest,
        cancel: &CancellationToken,
    ) -> CallResult {
        let started = Instant::now();
        let service = request.service.as_str();
        let tool = request.tool.as_str();

        let endpoint = match self.registry.endpoint(service) {
            Some(endpoint) => endpoint,
            None => {
                warn!("Unknown service");
                return CallResult::failure(
                    service,
                    tool,
                    OrchestratorError::unavailable(service, "not found"),
                    None,
                    started.elapsed(),
                );
            }
        };

        if endpoint.is_circuit_open() {
            warn!(error_count = endpoint.error_count, "Circuit open, refusing call");
            return CallResult::failure(
                service,
                tool,
                OrchestratorError::unavailable(service, "circuit open"),
                None,
                started.elapsed(),
            );
        }

        let timeout = request.timeout.unwrap_or_else(|| endpoint.timeout());
        let deadline = started + timeout;

        let (outcome, execution_id) = self.call(&endpoint, request, deadline, cancel).await;

        let elapsed = started.elapsed();
        let kind = outcome.as_ref().err().map(|e| e.kind());
        if let Some(status) = self.registry.record_call(service, elapsed, kind) {
            debug!(%status, "Recorded call outcome");
        }

        match outcome {
            Ok(result) => {
                info!(duration_ms = elapsed.as_millis() as u64, "Call completed");
                CallResult::success(service, tool, result, execution_id, elapsed)
            }
            Err(e) => {
                error!(duration_ms = elapsed.as_millis() as u64, error = %e, "Call failed");
                CallResult::failure(service, tool, e, execution_id, elapsed)
            }
        }
    }

    /// Tool catalog of `service`, optionally filtered
    pub async fn list_tools(
        &self,
        service: &str,
        filter: &ToolFilter,
    ) -> Result<Value, OrchestratorError> {
        let endpoint = self.reachable(service)?;
        self.transport
            .list_tools(&endpoint, filter, endpoint.timeout())
            .await
            .map_err(|e| map_transport_error(service, e))
    }

    /// Description of `tool` as published by `service`
    pub async fn tool_info(&self, service: &str, tool: &str) -> Result<Value, OrchestratorError> {
        let endpoint = self.reachable(service)?;
        self.transport
            .tool_info(&endpoint, tool, endpoint.timeout())
            .await
            .map_err(|e| map_transport_error(service, e))
    }

    /// Endpoint of `service` unless it is unknown or its circuit is open
    fn reachable(&self, service: &str) -> Result<ServiceEndpoint, OrchestratorError> {
        let endpoint = self
            .registry
            .endpoint(service)
            .ok_or_else(|| OrchestratorError::unavailable(service, "not found"))?;
        if endpoint.is_circuit_open() {
            return Err(OrchestratorError::unavailable(service, "circuit open"));
        }
        Ok(endpoint)
    }

    /// Submit, then poll if the service went asynchronous
    async fn call(
        &self,
        endpoint: &ServiceEndpoint,
        request: &ToolRequest,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> (Result<Value, OrchestratorError>, Option<String>) {
        let body = ExecuteRequest::new(request.tool.clone(), request.parameters.clone())
            .with_priority(request.priority.unwrap_or(self.settings.default_priority));

        // Polling handles cancellation itself so it can stop the remote side
        let submitted = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(OrchestratorError::Cancelled(format!(
                "call to '{}' cancelled",
                endpoint.name
            ))),
            submitted = self.submit(endpoint, &body, deadline) => submitted,
        };
        let report = match submitted {
            Ok(report) => report,
            Err(e) => return (Err(e), None),
        };

        let execution_id = report.execution_id.clone();

        let outcome = match report.status {
            RemoteStatus::Completed => Ok(report.result),
            RemoteStatus::Failed => Err(OrchestratorError::RemoteExecution(
                report
                    .error
                    .unwrap_or_else(|| format!("tool '{}' failed", request.tool)),
            )),
            RemoteStatus::Cancelled => Err(OrchestratorError::Cancelled(format!(
                "tool '{}' was cancelled remotely",
                request.tool
            ))),
            status if status.is_in_progress() => match execution_id.as_deref() {
                Some(id) => {
                    debug!(execution_id = %id, "Remote execution is asynchronous, polling");
                    self.poller
                        .wait(self.transport.as_ref(), endpoint, id, deadline, cancel)
                        .await
                }
                None => Err(OrchestratorError::RemoteExecution(format!(
                    "tool '{}' is {:?} but no execution id was returned",
                    request.tool, report.status
                ))),
            },
            _ => Err(OrchestratorError::RemoteExecution(format!(
                "tool '{}' returned an unrecognised status",
                request.tool
            ))),
        };

        (outcome, execution_id)
    }

    /// `POST /execute` with bounded retry, all inside the overall deadline
    async fn submit(
        &self,
        endpoint: &ServiceEndpoint,
        body: &ExecuteRequest,
        deadline: Instant,
    ) -> Result<ExecutionReport, OrchestratorError> {
        let transport = self.transport.as_ref();
        let label = format!("{}/{}", endpoint.name, body.tool_name);

        let attempts = with_retry(&self.settings.retry, &label, move |_| {
            let remaining = deadline.saturating_duration_since(Instant::now());
            async move {
                if remaining.is_zero() {
                    return Err(TransportError::Timeout(Duration::ZERO));
                }
                transport
                    .execute(endpoint, body, endpoint.timeout().min(remaining))
                    .await
            }
        });

        match tokio::time::timeout_at(deadline, attempts).await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(e)) => Err(map_transport_error(&endpoint.name, e)),
            Err(_) => Err(OrchestratorError::Timeout(format!(
                "no response from '{}' before the deadline",
                endpoint.name
            ))),
        }
    }
}

/// Classify a final transport failure
fn map_transport_error(service: &str, error: TransportError) -> OrchestratorError {
    match error {
        TransportError::Timeout(_) => {
            OrchestratorError::Timeout(format!("'{}' did not respond: {}", service, error))
        }
        TransportError::Connect(_) | TransportError::Decode(_) => {
            OrchestratorError::Transport(format!("'{}': {}", service, error))
        }
        // The service answered; the tool request itself was rejected
        TransportError::Http { .. } => {
            OrchestratorError::RemoteExecution(format!("'{}' rejected the call: {}", service, error))
        }
    }
}
