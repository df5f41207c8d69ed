//! Remote-call step: invoke one tool on one service.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{call_summary, call_tool, StepContext, StepHandler};
use crate::core::{RpcClient, ToolRequest};
use crate::domain::{OrchestratorError, StepType};

/// Parameters: `service`, `tool`, optional `arguments`, `priority`,
/// `timeout_seconds`.
///
/// Without `arguments` the tool receives the instance parameters plus the
/// dependency results under `inputs`.
pub struct RemoteCallHandler {
    client: Arc<RpcClient>,
}

impl RemoteCallHandler {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }
}

pub(crate) fn default_arguments(ctx: &StepContext) -> Value {
    let mut arguments = match &ctx.instance_parameters {
        Value::Object(map) => map.clone(),
        _ => Default::default(),
    };
    if !ctx.dependency_results.is_empty() {
        arguments.insert("inputs".to_string(), ctx.dependency_data());
    }
    Value::Object(arguments)
}

#[async_trait]
impl StepHandler for RemoteCallHandler {
    fn step_type(&self) -> StepType {
        StepType::RemoteCall
    }

    async fn handle(&self, ctx: &StepContext) -> Result<Value, OrchestratorError> {
        let service = ctx.required_str("service")?;
        let tool = ctx.required_str("tool")?;

        let arguments = match ctx.param("arguments") {
            Some(Value::Object(map)) if map.is_empty() => default_arguments(ctx),
            Some(arguments) => arguments.clone(),
            None => default_arguments(ctx),
        };

        let mut request = ToolRequest::new(service, tool, arguments);
        request.timeout = ctx.call_timeout();
        if let Some(priority) = ctx.param("priority").and_then(Value::as_i64) {
            request.priority = Some(priority as i32);
        }

        let call = call_tool(&self.client, ctx, request).await;
        let summary = call_summary(&call);
        call.into_result()?;

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::context;

    #[test]
    fn test_default_arguments_carry_inputs() {
        let mut ctx = context(json!({}));
        assert_eq!(default_arguments(&ctx), json!({"location": "Hangzhou"}));

        ctx.dependency_results
            .insert("step_1".into(), json!({"data": {"event_type": "fire"}}));
        assert_eq!(
            default_arguments(&ctx),
            json!({"location": "Hangzhou", "inputs": {"data": {"event_type": "fire"}}})
        );
    }
}
