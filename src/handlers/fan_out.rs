//! Fan-out step: invoke several services concurrently.
//!
//! Targets come from either `targets: [{service, tool, arguments?}]` or the
//! paired lists `services: [..]` / `tools: [..]`. A shared `arguments`
//! object is sent to every target that does not carry its own.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::remote_call::default_arguments;
use super::{call_summary, call_tool, StepContext, StepHandler};
use crate::core::{RpcClient, ToolRequest};
use crate::domain::{ErrorKind, OrchestratorError, StepType};

/// What a failed sub-call does to the fan-out step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOutPolicy {
    /// Complete with mixed results unless every sub-call failed
    #[default]
    Tolerate,
    /// Fail the step if any sub-call failed, once all of them have finished
    Propagate,
}

impl std::str::FromStr for FanOutPolicy {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tolerate" | "partial" => Ok(Self::Tolerate),
            "propagate" | "fail_fast" | "strict" => Ok(Self::Propagate),
            other => Err(OrchestratorError::validation(format!(
                "unknown fan-out policy '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Target {
    service: String,
    tool: String,
    arguments: Value,
}

pub struct FanOutHandler {
    client: Arc<RpcClient>,
    default_policy: FanOutPolicy,
}

impl FanOutHandler {
    pub fn new(client: Arc<RpcClient>, default_policy: FanOutPolicy) -> Self {
        Self {
            client,
            default_policy,
        }
    }

    fn policy(&self, ctx: &StepContext) -> Result<FanOutPolicy, OrchestratorError> {
        match ctx.str_param("policy") {
            Some(policy) => policy.parse(),
            None => Ok(self.default_policy),
        }
    }
}

fn targets(ctx: &StepContext) -> Result<Vec<Target>, OrchestratorError> {
    let shared = match ctx.param("arguments") {
        Some(Value::Object(map)) if !map.is_empty() => Value::Object(map.clone()),
        _ => default_arguments(ctx),
    };

    let invalid = |msg: &str| {
        OrchestratorError::validation(format!("fan-out step '{}': {}", ctx.step_id, msg))
    };

    let targets = if let Some(list) = ctx.param("targets") {
        let list = list
            .as_array()
            .ok_or_else(|| invalid("'targets' must be a list"))?;
        list.iter()
            .map(|t| {
                let service = t.get("service").and_then(Value::as_str);
                let tool = t.get("tool").and_then(Value::as_str);
                match (service, tool) {
                    (Some(service), Some(tool)) => Ok(Target {
                        service: service.to_string(),
                        tool: tool.to_string(),
                        arguments: t.get("arguments").cloned().unwrap_or_else(|| shared.clone()),
                    }),
                    _ => Err(invalid("every target needs 'service' and 'tool'")),
                }
            })
            .collect::<Result<Vec<_>, _>>()?
    } else {
        let services = ctx
            .param("services")
            .and_then(Value::as_array)
            .ok_or_else(|| invalid("requires 'targets' or 'services'"))?;
        let tools = ctx
            .param("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        services
            .iter()
            .enumerate()
            .map(|(i, service)| {
                let service = service
                    .as_str()
                    .ok_or_else(|| invalid("'services' must be a list of names"))?;
                let tool = tools
                    .get(i)
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid(&format!("no tool given for service '{}'", service)))?;
                Ok(Target {
                    service: service.to_string(),
                    tool: tool.to_string(),
                    arguments: shared.clone(),
                })
            })
            .collect::<Result<Vec<_>, OrchestratorError>>()?
    };

    if targets.is_empty() {
        return Err(invalid("no targets"));
    }
    Ok(targets)
}

#[async_trait]
impl StepHandler for FanOutHandler {
    fn step_type(&self) -> StepType {
        StepType::FanOut
    }

    async fn handle(&self, ctx: &StepContext) -> Result<Value, OrchestratorError> {
        let policy = self.policy(ctx)?;
        let targets = targets(ctx)?;
        let timeout = ctx.call_timeout();

        let calls = join_all(targets.into_iter().map(|target| {
            let mut request = ToolRequest::new(target.service, target.tool, target.arguments);
            request.timeout = timeout;
            call_tool(&self.client, ctx, request)
        }))
        .await;

        let succeeded = calls.iter().filter(|c| c.success).count();
        let failed = calls.len() - succeeded;

        if policy == FanOutPolicy::Propagate {
            if let Some(call) = calls.iter().find(|c| !c.success) {
                if let Some(err) = &call.error {
                    return Err(err.clone());
                }
            }
        }

        if succeeded == 0 {
            // Every sub-call was cut short by cancellation
            if calls.iter().all(|c| c.error_kind() == Some(ErrorKind::Cancelled)) {
                return Err(OrchestratorError::Cancelled(format!(
                    "fan-out step '{}' cancelled",
                    ctx.step_id
                )));
            }
            let reasons: Vec<String> = calls.iter().filter_map(|c| c.error_message()).collect();
            return Err(OrchestratorError::RemoteExecution(format!(
                "all {} sub-calls failed: {}",
                calls.len(),
                reasons.join("; ")
            )));
        }

        let partial = failed > 0;
        if partial {
            warn!(step = %ctx.step_id, succeeded, failed, "Fan-out completed with partial results");
        } else {
            info!(step = %ctx.step_id, succeeded, "Fan-out completed");
        }

        Ok(json!({
            "success": true,
            "partial": partial,
            "succeeded": succeeded,
            "failed": failed,
            "results": calls.iter().map(call_summary).collect::<Vec<_>>(),
        }))
    }
}
