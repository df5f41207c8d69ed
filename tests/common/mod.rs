//! Shared fixtures: an in-process transport with scripted replies.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use hazardflow::adapters::{ExecuteRequest, ExecutionReport, ToolFilter, Transport, TransportError};
use hazardflow::core::{
    ClientSettings, EngineSettings, HealthSettings, RetryPolicy, RpcClient, ServiceRegistry,
    WorkflowEngine,
};
use hazardflow::domain::ServiceEndpoint;

pub type Reply = Result<ExecutionReport, TransportError>;

#[derive(Default)]
struct Script {
    healthy: bool,
    /// Replies consumed in order before `execute_default`
    execute: VecDeque<Reply>,
    execute_default: Option<Reply>,
    status: VecDeque<Reply>,
    status_default: Option<Reply>,
    delay: Duration,
    requests: Vec<ExecuteRequest>,
    execute_calls: u32,
    status_calls: u32,
    health_calls: u32,
    /// Execution ids the client asked to stop
    cancelled: Vec<String>,
    tools: Option<Value>,
}

/// Transport double: every service answers from its script.
/// Unscripted calls fail with a connection error.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, Script>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_script<R>(&self, service: &str, f: impl FnOnce(&mut Script) -> R) -> R {
        let mut scripts = self.scripts.lock();
        f(scripts.entry(service.to_string()).or_default())
    }

    pub fn set_healthy(&self, service: &str, healthy: bool) {
        self.with_script(service, |s| s.healthy = healthy);
    }

    /// Answer every `execute` with `reply`
    pub fn respond(&self, service: &str, reply: Reply) {
        self.with_script(service, |s| s.execute_default = Some(reply));
    }

    /// Answer the next `execute` with `reply`
    pub fn respond_once(&self, service: &str, reply: Reply) {
        self.with_script(service, |s| s.execute.push_back(reply));
    }

    /// Complete immediately with `result`
    pub fn complete_with(&self, service: &str, result: Value) {
        self.respond(service, Ok(ExecutionReport::completed(result)));
    }

    pub fn status(&self, service: &str, reply: Reply) {
        self.with_script(service, |s| s.status_default = Some(reply));
    }

    pub fn status_once(&self, service: &str, reply: Reply) {
        self.with_script(service, |s| s.status.push_back(reply));
    }

    /// Hold every reply of `service` for `delay`
    pub fn delay(&self, service: &str, delay: Duration) {
        self.with_script(service, |s| s.delay = delay);
    }

    pub fn execute_calls(&self, service: &str) -> u32 {
        self.with_script(service, |s| s.execute_calls)
    }

    pub fn status_calls(&self, service: &str) -> u32 {
        self.with_script(service, |s| s.status_calls)
    }

    pub fn health_calls(&self, service: &str) -> u32 {
        self.with_script(service, |s| s.health_calls)
    }

    pub fn cancelled(&self, service: &str) -> Vec<String> {
        self.with_script(service, |s| s.cancelled.clone())
    }

    /// Publish `catalog` as the tool list of `service`
    pub fn tools(&self, service: &str, catalog: Value) {
        self.with_script(service, |s| s.tools = Some(catalog));
    }

    pub fn requests(&self, service: &str) -> Vec<ExecuteRequest> {
        self.with_script(service, |s| s.requests.clone())
    }

    fn unscripted(service: &str) -> TransportError {
        TransportError::Connect(format!("no script for '{}'", service))
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(
        &self,
        endpoint: &ServiceEndpoint,
        request: &ExecuteRequest,
        _timeout: Duration,
    ) -> Result<ExecutionReport, TransportError> {
        let (reply, delay) = self.with_script(&endpoint.name, |s| {
            s.execute_calls += 1;
            s.requests.push(request.clone());
            let reply = s
                .execute
                .pop_front()
                .or_else(|| s.execute_default.clone())
                .unwrap_or_else(|| Err(Self::unscripted(&endpoint.name)));
            (reply, s.delay)
        });
        tokio::time::sleep(delay).await;
        reply
    }

    async fn execution_status(
        &self,
        endpoint: &ServiceEndpoint,
        _execution_id: &str,
        _timeout: Duration,
    ) -> Result<ExecutionReport, TransportError> {
        let reply = self.with_script(&endpoint.name, |s| {
            s.status_calls += 1;
            s.status
                .pop_front()
                .or_else(|| s.status_default.clone())
                .unwrap_or_else(|| Err(Self::unscripted(&endpoint.name)))
        });
        reply
    }

    async fn cancel_execution(
        &self,
        endpoint: &ServiceEndpoint,
        execution_id: &str,
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        self.with_script(&endpoint.name, |s| s.cancelled.push(execution_id.to_string()));
        Ok(())
    }

    async fn list_tools(
        &self,
        endpoint: &ServiceEndpoint,
        _filter: &ToolFilter,
        _timeout: Duration,
    ) -> Result<Value, TransportError> {
        self.with_script(&endpoint.name, |s| s.tools.clone())
            .ok_or_else(|| Self::unscripted(&endpoint.name))
    }

    async fn tool_info(
        &self,
        endpoint: &ServiceEndpoint,
        tool_name: &str,
        _timeout: Duration,
    ) -> Result<Value, TransportError> {
        let catalog = self
            .with_script(&endpoint.name, |s| s.tools.clone())
            .ok_or_else(|| Self::unscripted(&endpoint.name))?;
        catalog
            .as_array()
            .and_then(|tools| tools.iter().find(|t| t["name"] == tool_name))
            .cloned()
            .ok_or_else(|| TransportError::Http {
                status: 404,
                body: format!("tool '{}' not found", tool_name),
            })
    }

    async fn health_check(
        &self,
        endpoint: &ServiceEndpoint,
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        let healthy = self.with_script(&endpoint.name, |s| {
            s.health_calls += 1;
            s.healthy
        });
        if healthy {
            Ok(())
        } else {
            Err(Self::unscripted(&endpoint.name))
        }
    }
}

/// Fast retry and polling for tests
pub fn fast_client_settings() -> ClientSettings {
    ClientSettings {
        retry: RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
        },
        poll_interval_ms: 5,
        ..Default::default()
    }
}

/// Registry with one endpoint per name, all at localhost
pub fn registry(transport: Arc<ScriptedTransport>, names: &[&str]) -> Arc<ServiceRegistry> {
    let endpoints = names
        .iter()
        .enumerate()
        .map(|(i, name)| ServiceEndpoint::new(*name, format!("http://localhost:{}", 9100 + i)));
    Arc::new(ServiceRegistry::with_endpoints(transport, HealthSettings::default(), endpoints).unwrap())
}

pub fn client(registry: &Arc<ServiceRegistry>) -> Arc<RpcClient> {
    Arc::new(RpcClient::new(Arc::clone(registry), fast_client_settings()))
}

/// Engine with the default handlers and a 1ms scan interval
pub fn engine(client: Arc<RpcClient>, settings: EngineSettings) -> WorkflowEngine {
    WorkflowEngine::with_client(
        client,
        EngineSettings {
            scan_interval_ms: 1,
            ..settings
        },
    )
}

/// Probe `service` until its circuit opens
pub async fn open_circuit(registry: &ServiceRegistry, transport: &ScriptedTransport, service: &str) {
    transport.set_healthy(service, false);
    for _ in 0..registry.endpoint(service).map_or(0, |e| e.error_threshold) {
        registry.probe(service).await;
    }
}
