//! Polling state machine for asynchronous remote executions.
//!
//! Sits on top of a [`Transport`] and knows nothing about how a single
//! status request is made; it only decides when to ask again and when to
//! give up.

use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::adapters::{RemoteStatus, Transport};
use crate::domain::{OrchestratorError, ServiceEndpoint};

/// Upper bound on the `DELETE` sent when polling is abandoned
const CANCEL_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Waits for an execution id to reach a terminal status
#[derive(Debug, Clone)]
pub struct ExecutionPoller {
    /// Sleep between status queries
    pub poll_interval: Duration,

    /// Consecutive failed status queries tolerated before giving up
    pub poll_retry_budget: u32,
}

impl Default for ExecutionPoller {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2000),
            poll_retry_budget: 3,
        }
    }
}

impl ExecutionPoller {
    pub fn new(poll_interval: Duration, poll_retry_budget: u32) -> Self {
        Self {
            poll_interval,
            poll_retry_budget,
        }
    }

    /// Poll `execution_id` until it finishes, `deadline` passes or `cancel`
    /// fires. Returns the remote result on completion.
    pub async fn wait(
        &self,
        transport: &dyn Transport,
        endpoint: &ServiceEndpoint,
        execution_id: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Value, OrchestratorError> {
        let mut failed_polls = 0u32;
        let mut polls = 0u32;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(OrchestratorError::Timeout(format!(
                    "execution '{}' on '{}' still running after {} polls",
                    execution_id, endpoint.name, polls
                )));
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(self.abandon(transport, endpoint, execution_id).await);
                }
                _ = tokio::time::sleep(self.poll_interval.min(remaining)) => {}
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                continue;
            }

            polls += 1;
            let request_timeout = endpoint.timeout().min(remaining);
            let report = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(self.abandon(transport, endpoint, execution_id).await);
                }
                report = transport.execution_status(endpoint, execution_id, request_timeout) => report,
            };

            let report = match report {
                Ok(report) => {
                    failed_polls = 0;
                    report
                }
                Err(e) => {
                    failed_polls += 1;
                    if failed_polls > self.poll_retry_budget {
                        return Err(OrchestratorError::Transport(format!(
                            "status of execution '{}' unavailable after {} attempts: {}",
                            execution_id, failed_polls, e
                        )));
                    }
                    warn!(
                        service = %endpoint.name,
                        %execution_id,
                        failed_polls,
                        error = %e,
                        "Status poll failed"
                    );
                    continue;
                }
            };

            debug!(service = %endpoint.name, %execution_id, polls, status = ?report.status, "Polled execution");

            match report.status {
                RemoteStatus::Completed => return Ok(report.result),
                RemoteStatus::Failed => {
                    return Err(OrchestratorError::RemoteExecution(
                        report
                            .error
                            .unwrap_or_else(|| format!("execution '{}' failed", execution_id)),
                    ))
                }
                RemoteStatus::Cancelled => {
                    return Err(OrchestratorError::Cancelled(format!(
                        "execution '{}' was cancelled remotely",
                        execution_id
                    )))
                }
                status if status.is_in_progress() => {}
                _ => {
                    return Err(OrchestratorError::RemoteExecution(format!(
                        "execution '{}' reported an unrecognised status",
                        execution_id
                    )))
                }
            }
        }
    }

    /// Ask the service to drop an execution nobody will read anymore.
    /// Best effort: a failed request is only logged.
    async fn abandon(
        &self,
        transport: &dyn Transport,
        endpoint: &ServiceEndpoint,
        execution_id: &str,
    ) -> OrchestratorError {
        let timeout = endpoint.timeout().min(CANCEL_REQUEST_TIMEOUT);
        match transport.cancel_execution(endpoint, execution_id, timeout).await {
            Ok(()) => debug!(service = %endpoint.name, %execution_id, "Remote execution cancelled"),
            Err(e) => warn!(
                service = %endpoint.name,
                %execution_id,
                error = %e,
                "Failed to cancel remote execution"
            ),
        }
        OrchestratorError::Cancelled(format!("stopped polling execution '{}'", execution_id))
    }
}
