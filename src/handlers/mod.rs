//! Step handlers, one per step type.
//!
//! The engine looks handlers up by [`StepType`] in a [`HandlerRegistry`];
//! adding a step type means registering another [`StepHandler`].

pub mod aggregate;
pub mod fan_out;
pub mod fetch;
pub mod remote_call;
pub mod sink;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::{RpcClient, ToolRequest};
use crate::domain::{CallResult, OrchestratorError, StepType};

// Re-export handlers
pub use aggregate::AggregateHandler;
pub use fan_out::{FanOutHandler, FanOutPolicy};
pub use fetch::FetchHandler;
pub use remote_call::RemoteCallHandler;
pub use sink::SinkHandler;

/// Everything a handler may read while running one step
#[derive(Debug, Clone)]
pub struct StepContext {
    pub instance_id: Uuid,
    pub workflow_name: String,
    pub step_id: String,
    /// Step parameters with every `${...}` reference resolved
    pub parameters: Value,
    /// The instance's runtime parameter bag
    pub instance_parameters: Value,
    /// Results of the step's dependencies, by step id
    pub dependency_results: BTreeMap<String, Value>,
    /// Fires when the instance is cancelled
    pub cancel: CancellationToken,
    /// Effective step deadline, if any
    pub timeout: Option<Duration>,
}

impl StepContext {
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key).filter(|v| !v.is_null())
    }

    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.param(key).and_then(Value::as_str)
    }

    pub fn required_str(&self, key: &str) -> Result<&str, OrchestratorError> {
        self.str_param(key).ok_or_else(|| {
            OrchestratorError::validation(format!(
                "step '{}' requires a string parameter '{}'",
                self.step_id, key
            ))
        })
    }

    /// Parameter `timeout_seconds` capped by the step deadline
    pub fn call_timeout(&self) -> Option<Duration> {
        let requested = self
            .param("timeout_seconds")
            .and_then(Value::as_u64)
            .map(Duration::from_secs);

        match (requested, self.timeout) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Dependency results as one value: the single result itself, or an
    /// object keyed by step id when there are several
    pub fn dependency_data(&self) -> Value {
        if self.dependency_results.len() == 1 {
            if let Some(value) = self.dependency_results.values().next() {
                return value.clone();
            }
        }
        Value::Object(
            self.dependency_results
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Map<_, _>>(),
        )
    }
}

/// Executes one kind of step
#[async_trait]
pub trait StepHandler: Send + Sync {
    fn step_type(&self) -> StepType;

    async fn handle(&self, ctx: &StepContext) -> Result<Value, OrchestratorError>;
}

/// Lookup table from step type to handler
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<StepType, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One handler per built-in step type, all calling through `client`
    pub fn with_defaults(client: Arc<RpcClient>, fan_out_policy: FanOutPolicy) -> Self {
        let mut registry = Self::new();
        registry.register(FetchHandler::new(Arc::clone(&client)));
        registry.register(RemoteCallHandler::new(Arc::clone(&client)));
        registry.register(SinkHandler::persist(Arc::clone(&client)));
        registry.register(SinkHandler::publish(Arc::clone(&client)));
        registry.register(FanOutHandler::new(client, fan_out_policy));
        registry.register(AggregateHandler);
        registry
    }

    /// Add a handler, replacing any previous one for the same step type
    pub fn register(&mut self, handler: impl StepHandler + 'static) {
        self.handlers.insert(handler.step_type(), Arc::new(handler));
    }

    pub fn get(&self, step_type: StepType) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(&step_type).cloned()
    }
}

/// Issue one call for a step, honouring its cancel token and deadline
pub(crate) async fn call_tool(
    client: &RpcClient,
    ctx: &StepContext,
    mut request: ToolRequest,
) -> CallResult {
    if let Some(limit) = ctx.timeout {
        request.timeout = Some(request.timeout.map_or(limit, |t| t.min(limit)));
    }
    client.invoke_request(&request, &ctx.cancel).await
}

/// Step-result shape for a single call
pub(crate) fn call_summary(call: &CallResult) -> Value {
    json!({
        "success": call.success,
        "service": call.service,
        "tool": call.tool,
        "execution_id": call.execution_id,
        "duration_ms": call.duration_ms,
        "result": call.result,
        "error": call.error_message(),
        "error_kind": call.error_kind(),
    })
}
