//! Command-line interface for hazardflow.
//!
//! Provides commands for inspecting and probing services, invoking a
//! single tool, listing and running workflows, and watching service health.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::warn;

use crate::adapters::{HttpTransport, ToolFilter};
use crate::config::{self, ResolvedConfig};
use crate::core::{RpcClient, ServiceRegistry, WorkflowEngine};
use crate::domain::{InstanceStatus, ServiceEndpoint, WorkflowEvent, WorkflowInstance};

/// hazardflow - Disaster-risk model service orchestrator
#[derive(Parser, Debug)]
#[command(name = "hazardflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List registered services
    Services {
        /// Probe every service before listing
        #[arg(short, long)]
        probe: bool,
    },

    /// Probe one service's health endpoint
    Probe {
        /// Service name
        name: String,
    },

    /// Invoke one tool on one service
    Invoke {
        /// Service name
        service: String,

        /// Tool name
        tool: String,

        /// Tool parameters as a JSON object
        #[arg(short, long)]
        params: Option<String>,

        /// Call deadline in seconds (defaults to the service timeout)
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// List the tools a service publishes
    Tools {
        /// Service name
        service: String,

        /// Only tools in this category
        #[arg(short, long)]
        category: Option<String>,

        /// Only tools backed by this model
        #[arg(short, long)]
        model: Option<String>,

        /// Describe a single tool instead of listing
        #[arg(long, conflicts_with_all = ["category", "model"])]
        tool: Option<String>,
    },

    /// List registered workflow definitions
    Workflows,

    /// Run a workflow to completion
    Run {
        /// Workflow name
        workflow: String,

        /// Runtime parameters as a JSON object
        #[arg(short, long, conflicts_with = "params_file")]
        params: Option<String>,

        /// Read runtime parameters from a JSON file
        #[arg(long)]
        params_file: Option<PathBuf>,

        /// Print the full instance as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run the background health monitor
    Monitor {
        /// Stop after this many seconds (runs until Ctrl+C otherwise)
        #[arg(short, long)]
        seconds: Option<u64>,
    },

    /// Show resolved configuration (debug)
    Config,
}

/// Registry, client and engine built from one configuration
pub struct Stack {
    pub registry: Arc<ServiceRegistry>,
    pub client: Arc<RpcClient>,
    pub engine: Arc<WorkflowEngine>,
}

impl Stack {
    /// Wire the HTTP transport, register services and workflows
    pub fn build(cfg: &ResolvedConfig) -> Result<Self> {
        let registry = Arc::new(ServiceRegistry::with_endpoints(
            Arc::new(HttpTransport::new()),
            cfg.health.clone(),
            cfg.endpoints()?,
        )?);
        let client = Arc::new(RpcClient::new(Arc::clone(&registry), cfg.client.clone()));
        let engine = Arc::new(WorkflowEngine::with_client(
            Arc::clone(&client),
            cfg.engine.clone(),
        ));

        engine.register_builtin_workflows()?;
        if let Some(dir) = &cfg.workflows_dir {
            engine.load_definitions_dir(dir)?;
        }

        Ok(Self {
            registry,
            client,
            engine,
        })
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let cfg = config::load_config()?;

        match self.command {
            Commands::Services { probe } => list_services(&cfg, probe).await,
            Commands::Probe { name } => probe_service(&cfg, &name).await,
            Commands::Invoke {
                service,
                tool,
                params,
                timeout,
            } => invoke_tool(&cfg, &service, &tool, params, timeout).await,
            Commands::Tools {
                service,
                category,
                model,
                tool,
            } => {
                let filter = ToolFilter {
                    model_name: model,
                    category,
                };
                list_tools(&cfg, &service, filter, tool.as_deref()).await
            }
            Commands::Workflows => list_workflows(&cfg),
            Commands::Run {
                workflow,
                params,
                params_file,
                json,
            } => run_workflow(&cfg, &workflow, params, params_file, json).await,
            Commands::Monitor { seconds } => monitor(&cfg, seconds).await,
            Commands::Config => show_config(&cfg),
        }
    }
}

/// Parse a JSON object argument; absent means `{}`
fn parse_params(raw: Option<&str>) -> Result<Value> {
    let Some(raw) = raw else {
        return Ok(Value::Object(Default::default()));
    };
    let value: Value = serde_json::from_str(raw).context("Parameters are not valid JSON")?;
    if !value.is_object() {
        anyhow::bail!("Parameters must be a JSON object");
    }
    Ok(value)
}

fn print_services(endpoints: &[ServiceEndpoint]) {
    println!(
        "{:<16} {:<32} {:<10} {:>6} {:>10}",
        "SERVICE", "URL", "STATUS", "ERRORS", "LATENCY"
    );
    println!("{}", "-".repeat(78));

    for e in endpoints {
        let latency = e
            .last_latency_ms
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<16} {:<32} {:<10} {:>6} {:>10}",
            e.name,
            e.base_url,
            e.status.to_string(),
            e.error_count,
            latency
        );
    }
}

/// List services, optionally probing them first
async fn list_services(cfg: &ResolvedConfig, probe: bool) -> Result<()> {
    let stack = Stack::build(cfg)?;

    if probe {
        stack.registry.probe_all().await;
    }

    let endpoints = stack.registry.list();
    if endpoints.is_empty() {
        println!("No services configured");
        return Ok(());
    }
    print_services(&endpoints);

    Ok(())
}

/// Probe one service
async fn probe_service(cfg: &ResolvedConfig, name: &str) -> Result<()> {
    let stack = Stack::build(cfg)?;

    let status = stack
        .registry
        .probe(name)
        .await
        .with_context(|| format!("Unknown service: {}", name))?;

    let endpoint = stack.registry.endpoint(name);
    println!("Service: {}", name);
    println!("Status:  {}", status);
    if let Some(ms) = endpoint.and_then(|e| e.last_latency_ms) {
        println!("Latency: {}ms", ms);
    }

    Ok(())
}

/// Invoke one tool and print the call result
async fn invoke_tool(
    cfg: &ResolvedConfig,
    service: &str,
    tool: &str,
    params: Option<String>,
    timeout: Option<u64>,
) -> Result<()> {
    let stack = Stack::build(cfg)?;
    let params = parse_params(params.as_deref())?;

    let call = stack
        .client
        .invoke(service, tool, params, timeout.map(Duration::from_secs))
        .await;

    println!("{}", serde_json::to_string_pretty(&call)?);

    if !call.success {
        eprintln!(
            "\n[Call {}.{} failed: {}]",
            service,
            tool,
            call.error_message().unwrap_or_default()
        );
        std::process::exit(1);
    }

    Ok(())
}

/// List a service's tools, or describe one of them
async fn list_tools(
    cfg: &ResolvedConfig,
    service: &str,
    filter: ToolFilter,
    tool: Option<&str>,
) -> Result<()> {
    let stack = Stack::build(cfg)?;

    let catalog = match tool {
        Some(tool) => stack.client.tool_info(service, tool).await,
        None => stack.client.list_tools(service, &filter).await,
    }
    .with_context(|| format!("Tool discovery on '{}' failed", service))?;

    println!("{}", serde_json::to_string_pretty(&catalog)?);

    Ok(())
}

/// List workflow definitions
fn list_workflows(cfg: &ResolvedConfig) -> Result<()> {
    let stack = Stack::build(cfg)?;
    let definitions = stack.engine.definitions();

    println!("{:<38} {:>5}  {}", "WORKFLOW", "STEPS", "DESCRIPTION");
    println!("{}", "-".repeat(90));

    for d in definitions {
        println!("{:<38} {:>5}  {}", d.name, d.step_count, d.description);
    }

    Ok(())
}

/// Events already buffered on the subscription, skipping any that lagged out
fn drain_events(events: &mut broadcast::Receiver<WorkflowEvent>) -> Vec<WorkflowEvent> {
    let mut pending = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => pending.push(event),
            Err(TryRecvError::Lagged(skipped)) => {
                warn!(skipped, "Event subscription lagged");
            }
            Err(TryRecvError::Empty | TryRecvError::Closed) => return pending,
        }
    }
}

fn print_event(event: &WorkflowEvent) {
    let duration = event
        .duration_ms
        .map(|ms| format!(" ({}ms)", ms))
        .unwrap_or_default();
    match &event.error {
        Some(err) => eprintln!("  {}{}: {}", event.summary, duration, err),
        None => eprintln!("  {}{}", event.summary, duration),
    }
}

fn print_instance(instance: &WorkflowInstance) {
    println!("Instance: {}", instance.id);
    println!("Workflow: {}", instance.workflow_name);
    println!("Status:   {}", instance.status);
    if let Some(ms) = instance.total_execution_ms {
        println!("Duration: {}ms", ms);
    }
    if let Some(err) = &instance.error {
        println!("Error:    {}", err);
    }
    println!("\nSteps:");
    for step in &instance.steps {
        println!(
            "  {:<12} {:<12} {:?}",
            step.id,
            step.step_type.to_string(),
            step.status
        );
    }
}

/// Run a workflow, streaming its events; Ctrl+C cancels it
async fn run_workflow(
    cfg: &ResolvedConfig,
    workflow: &str,
    params: Option<String>,
    params_file: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let stack = Stack::build(cfg)?;
    let engine = &stack.engine;

    let raw = match params_file {
        Some(path) => Some(
            std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read parameters file: {}", path.display()))?,
        ),
        None => params,
    };
    let params = parse_params(raw.as_deref())?;

    let id = engine.start(workflow, params)?;
    let mut events = engine.subscribe();
    let mut handle = engine.spawn(id);

    let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        let _ = stop_tx.send(());
    });

    let mut cancelled = false;
    let instance = loop {
        tokio::select! {
            joined = &mut handle => {
                break joined.context("Workflow task panicked")??;
            }
            Ok(event) = events.recv() => print_event(&event),
            _ = &mut stop_rx, if !cancelled => {
                warn!(instance_id = %id, "Interrupted, cancelling workflow");
                cancelled = true;
                engine.cancel(id)?;
            }
        }
    };

    // The task can finish before the last events are received
    for event in drain_events(&mut events) {
        print_event(&event);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&instance)?);
    } else {
        println!();
        print_instance(&instance);
    }

    if instance.status != InstanceStatus::Completed {
        std::process::exit(1);
    }

    Ok(())
}

/// Run the health monitor until Ctrl+C or the time limit
async fn monitor(cfg: &ResolvedConfig, seconds: Option<u64>) -> Result<()> {
    let stack = Stack::build(cfg)?;
    let registry = &stack.registry;

    println!(
        "Monitoring {} service(s) every {}s",
        registry.len(),
        registry.settings().interval_seconds
    );
    println!("    Press Ctrl+C to stop");
    println!();

    registry.start_health_monitor();

    let limit = async {
        match seconds {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = limit => {}
    }

    registry.stop_health_monitor().await;
    print_services(&registry.list());

    Ok(())
}

/// Show resolved configuration
fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    println!("hazardflow configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!(
        "Workflows dir: {}",
        cfg.workflows_dir
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(built-in only)".to_string())
    );
    println!();
    println!("Services:");
    for (name, svc) in &cfg.services {
        let url = svc.base_url(name).unwrap_or_else(|e| format!("<{}>", e));
        let state = if svc.enabled { "" } else { " (disabled)" };
        println!("  {:<16} {}{}", name, url, state);
    }
    println!();
    println!("Health monitor:");
    println!("  Interval:      {}s", cfg.health.interval_seconds);
    println!("  Probe timeout: {}s", cfg.health.probe_timeout_seconds);
    println!();
    println!("Client:");
    println!("  Max attempts:  {}", cfg.client.retry.max_attempts);
    println!("  Initial delay: {}ms", cfg.client.retry.initial_delay_ms);
    println!("  Poll interval: {}ms", cfg.client.poll_interval_ms);
    println!("  Poll retries:  {}", cfg.client.poll_retry_budget);
    println!();
    println!("Engine:");
    println!("  Scan interval:  {}ms", cfg.engine.scan_interval_ms);
    println!("  Fan-out policy: {:?}", cfg.engine.default_fan_out_policy);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_params() {
        assert_eq!(parse_params(None).unwrap(), serde_json::json!({}));
        assert_eq!(
            parse_params(Some(r#"{"location": "Hangzhou"}"#)).unwrap()["location"],
            "Hangzhou"
        );
        assert!(parse_params(Some("[1, 2]")).is_err());
        assert!(parse_params(Some("{nope")).is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "hazardflow",
            "run",
            "nfdrs4_fire_risk_assessment",
            "--params",
            "{}",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Run { json: false, .. }));
    }

    #[test]
    fn test_cli_parses_tools() {
        let cli = Cli::try_parse_from(["hazardflow", "tools", "nfdrs4", "--category", "fire"])
            .unwrap();
        match cli.command {
            Commands::Tools {
                service,
                category,
                tool,
                ..
            } => {
                assert_eq!(service, "nfdrs4");
                assert_eq!(category.as_deref(), Some("fire"));
                assert!(tool.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }

        assert!(Cli::try_parse_from([
            "hazardflow", "tools", "nfdrs4", "--category", "fire", "--tool", "x"
        ])
        .is_err());
    }

    #[test]
    fn test_drain_events_after_completion() {
        use crate::domain::EventType;
        use uuid::Uuid;

        let (tx, mut rx) = broadcast::channel(2);
        let id = Uuid::new_v4();
        for (event_type, summary) in [
            (EventType::InstanceStarted, "started"),
            (EventType::StepCompleted, "s1 done"),
            (EventType::InstanceCompleted, "completed"),
        ] {
            tx.send(WorkflowEvent::new(id, None, event_type, summary)).unwrap();
        }

        // The oldest event lagged out; the terminal one is still delivered
        let drained = drain_events(&mut rx);
        let summaries: Vec<_> = drained.iter().map(|e| e.summary.as_str()).collect();
        assert_eq!(summaries, vec!["s1 done", "completed"]);
        assert!(drain_events(&mut rx).is_empty());
    }

    #[test]
    fn test_stack_registers_builtins() {
        let cfg = ResolvedConfig {
            services: config::default_services(),
            health: Default::default(),
            client: Default::default(),
            engine: Default::default(),
            workflows_dir: None,
            config_file: None,
        };
        let stack = Stack::build(&cfg).unwrap();

        assert_eq!(stack.registry.len(), 9);
        assert_eq!(stack.engine.definitions().len(), 4);
    }
}
