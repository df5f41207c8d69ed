//! Fetch step: load the event record a workflow works on.
//!
//! Without a `service` parameter the record is built from the instance
//! parameters handed over by the upstream classifier. With one, the record
//! is requested from that data service (`tool` defaults to
//! `postgis_fetch_event`).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::debug;

use super::{call_tool, StepContext, StepHandler};
use crate::core::{RpcClient, ToolRequest};
use crate::domain::{OrchestratorError, StepType};

const DEFAULT_FETCH_TOOL: &str = "postgis_fetch_event";

pub struct FetchHandler {
    client: Arc<RpcClient>,
}

impl FetchHandler {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }
}

/// `fire_event` -> `fire`
fn event_type(data_type: &str) -> &str {
    data_type.strip_suffix("_event").unwrap_or(data_type)
}

#[async_trait]
impl StepHandler for FetchHandler {
    fn step_type(&self) -> StepType {
        StepType::Fetch
    }

    async fn handle(&self, ctx: &StepContext) -> Result<Value, OrchestratorError> {
        let data_type = ctx.str_param("data_type").unwrap_or("event");
        let filters = ctx.param("filters").cloned().unwrap_or_else(|| json!({}));

        let Some(service) = ctx.str_param("service") else {
            debug!(step = %ctx.step_id, %data_type, "Building event record from parameters");

            let mut data = match &ctx.instance_parameters {
                Value::Object(map) => map.clone(),
                _ => Default::default(),
            };
            data.entry("event_type")
                .or_insert_with(|| json!(event_type(data_type)));
            data.insert("fetched_at".to_string(), json!(Utc::now().to_rfc3339()));

            return Ok(json!({
                "success": true,
                "data": data,
                "count": 1,
                "source": "parameters",
            }));
        };

        let tool = ctx.str_param("tool").unwrap_or(DEFAULT_FETCH_TOOL);
        let request = ToolRequest::new(
            service,
            tool,
            json!({
                "data_type": data_type,
                "filters": filters,
                "event": ctx.instance_parameters,
            }),
        );
        let request = ToolRequest {
            timeout: ctx.call_timeout(),
            ..request
        };

        let call = call_tool(&self.client, ctx, request).await;
        let data = call.into_result()?;
        let count = data.as_array().map_or(1, Vec::len);

        Ok(json!({
            "success": true,
            "data": data,
            "count": count,
            "source": service,
        }))
    }
}
