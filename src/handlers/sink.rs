//! Persist and publish steps.
//!
//! Both hand a `{<target>, data}` request to a downstream sink service and
//! succeed when the sink acknowledges it. When `data` is empty the
//! dependency results are sent instead.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::info;

use super::{call_tool, StepContext, StepHandler};
use crate::core::{RpcClient, ToolRequest};
use crate::domain::{OrchestratorError, StepType};

/// Where one kind of sink step sends its data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkTarget {
    pub step_type: StepType,
    /// Service used when the step sets none
    pub default_service: &'static str,
    pub default_tool: &'static str,
    /// Parameter naming the table or layer
    pub target_key: &'static str,
}

pub const PERSIST_TARGET: SinkTarget = SinkTarget {
    step_type: StepType::Persist,
    default_service: "postgis",
    default_tool: "postgis_save_records",
    target_key: "table",
};

pub const PUBLISH_TARGET: SinkTarget = SinkTarget {
    step_type: StepType::Publish,
    default_service: "geoserver",
    default_tool: "geoserver_publish_layer",
    target_key: "layer_name",
};

pub struct SinkHandler {
    client: Arc<RpcClient>,
    target: SinkTarget,
}

impl SinkHandler {
    pub fn new(client: Arc<RpcClient>, target: SinkTarget) -> Self {
        Self { client, target }
    }

    pub fn persist(client: Arc<RpcClient>) -> Self {
        Self::new(client, PERSIST_TARGET)
    }

    pub fn publish(client: Arc<RpcClient>) -> Self {
        Self::new(client, PUBLISH_TARGET)
    }

    /// The `{<target>, data}` body sent to the sink
    fn payload(&self, ctx: &StepContext) -> Result<(String, Value), OrchestratorError> {
        let target = ctx.required_str(self.target.target_key)?.to_string();

        let data = match ctx.param("data") {
            None => ctx.dependency_data(),
            Some(Value::Object(map)) if map.is_empty() => ctx.dependency_data(),
            Some(data) => data.clone(),
        };

        let mut body = Map::new();
        body.insert(self.target.target_key.to_string(), json!(target));
        body.insert("data".to_string(), data);
        Ok((target, Value::Object(body)))
    }
}

#[async_trait]
impl StepHandler for SinkHandler {
    fn step_type(&self) -> StepType {
        self.target.step_type
    }

    async fn handle(&self, ctx: &StepContext) -> Result<Value, OrchestratorError> {
        let (target, body) = self.payload(ctx)?;
        let service = ctx.str_param("service").unwrap_or(self.target.default_service);
        let tool = ctx.str_param("tool").unwrap_or(self.target.default_tool);

        let mut request = ToolRequest::new(service, tool, body);
        request.timeout = ctx.call_timeout();

        let call = call_tool(&self.client, ctx, request).await;
        let execution_id = call.execution_id.clone();
        let acknowledgement = call.into_result()?;

        info!(step = %ctx.step_id, %service, %target, "Sink accepted data");

        Ok(json!({
            "success": true,
            "service": service,
            self.target.target_key: target,
            "execution_id": execution_id,
            "acknowledgement": acknowledgement,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::HttpTransport;
    use crate::core::{ClientSettings, HealthSettings, ServiceRegistry};
    use crate::handlers::testing::context;

    fn client() -> Arc<RpcClient> {
        let registry = Arc::new(ServiceRegistry::new(
            Arc::new(HttpTransport::new()),
            HealthSettings::default(),
        ));
        Arc::new(RpcClient::new(registry, ClientSettings::default()))
    }

    #[test]
    fn test_empty_data_uses_dependency_results() {
        let handler = SinkHandler::publish(client());
        let mut ctx = context(json!({"layer_name": "nfdrs4_fire_risk", "data": {}}));
        ctx.dependency_results
            .insert("step_3".into(), json!({"record_id": 7}));

        let (target, body) = handler.payload(&ctx).unwrap();
        assert_eq!(target, "nfdrs4_fire_risk");
        assert_eq!(
            body,
            json!({"layer_name": "nfdrs4_fire_risk", "data": {"record_id": 7}})
        );
    }

    #[test]
    fn test_explicit_data_is_sent() {
        let handler = SinkHandler::persist(client());
        let ctx = context(json!({"table": "risk_assessments", "data": {"risk": "high"}}));

        let (_, body) = handler.payload(&ctx).unwrap();
        assert_eq!(body["data"], json!({"risk": "high"}));
        assert_eq!(handler.step_type(), StepType::Persist);
    }

    #[test]
    fn test_missing_target_is_rejected() {
        let handler = SinkHandler::persist(client());
        let err = handler.payload(&context(json!({}))).unwrap_err();
        assert!(err.to_string().contains("table"));
    }
}
