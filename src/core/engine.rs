//! DAG workflow engine.
//!
//! `execute` drives one instance by scan passes. Each pass dispatches every
//! Pending step whose dependencies are all Completed, waits for all of
//! them, and records their outcomes. The instance fails the moment a step
//! fails (remaining steps stay Pending), and fails with a deadlock error
//! when steps remain Pending but none is eligible.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::client::RpcClient;
use super::definition::{builtin_definitions, WorkflowDefinition};
use super::template::TemplateContext;
use crate::domain::{
    EventType, InstanceStatus, OrchestratorError, StepType, WorkflowEvent, WorkflowInstance,
};
use crate::handlers::{FanOutPolicy, HandlerRegistry, StepContext, StepHandler};

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Pause between scan passes in milliseconds (default: 100)
    #[serde(default = "default_scan_interval")]
    pub scan_interval_ms: u64,

    /// Policy for fan-out steps that do not set one
    #[serde(default)]
    pub default_fan_out_policy: FanOutPolicy,
}

fn default_scan_interval() -> u64 {
    100
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            scan_interval_ms: default_scan_interval(),
            default_fan_out_policy: FanOutPolicy::default(),
        }
    }
}

impl EngineSettings {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }
}

/// Summary of a registered definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinitionInfo {
    pub name: String,
    pub description: String,
    pub version: String,
    pub step_count: usize,
    pub parameters_schema: Value,
}

/// A step about to be dispatched
struct Dispatch {
    step_id: String,
    handler: Option<Arc<dyn StepHandler>>,
    step_type: StepType,
    context: StepContext,
}

/// What a scan pass decided
enum Pass {
    Dispatch(Vec<Dispatch>),
    Finished,
}

/// Workflow engine: definitions, instances and their execution
pub struct WorkflowEngine {
    definitions: RwLock<BTreeMap<String, Arc<WorkflowDefinition>>>,
    instances: RwLock<HashMap<Uuid, WorkflowInstance>>,
    cancel_tokens: Mutex<HashMap<Uuid, CancellationToken>>,
    handlers: HandlerRegistry,
    events: broadcast::Sender<WorkflowEvent>,
    settings: EngineSettings,
}

impl WorkflowEngine {
    /// Engine with an explicit handler table
    pub fn new(handlers: HandlerRegistry, settings: EngineSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            definitions: RwLock::new(BTreeMap::new()),
            instances: RwLock::new(HashMap::new()),
            cancel_tokens: Mutex::new(HashMap::new()),
            handlers,
            events,
            settings,
        }
    }

    /// Engine with the default handler for every step type
    pub fn with_client(client: Arc<RpcClient>, settings: EngineSettings) -> Self {
        let handlers = HandlerRegistry::with_defaults(client, settings.default_fan_out_policy);
        Self::new(handlers, settings)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    // ---- definitions ----

    /// Validate and register a definition, replacing one with the same name
    pub fn register_definition(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<(), OrchestratorError> {
        definition.validate()?;
        info!(workflow = %definition.name, steps = definition.steps.len(), "Registered workflow");
        self.definitions
            .write()
            .insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    /// Register the workflows shipped with the crate
    pub fn register_builtin_workflows(&self) -> Result<usize, OrchestratorError> {
        let definitions =
            builtin_definitions().map_err(|e| OrchestratorError::validation(format!("{:#}", e)))?;
        let count = definitions.len();
        for definition in definitions {
            self.register_definition(definition)?;
        }
        Ok(count)
    }

    /// Register every `.yaml`, `.yml` and `.json` definition in `dir`
    pub fn load_definitions_dir(&self, dir: &Path) -> anyhow::Result<usize> {
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read workflows directory: {}", dir.display()))?;

        let mut paths: Vec<_> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| matches!(e, "yaml" | "yml" | "json"))
            })
            .collect();
        paths.sort();

        for path in &paths {
            let definition = WorkflowDefinition::from_file(path)?;
            self.register_definition(definition)
                .with_context(|| format!("Invalid workflow: {}", path.display()))?;
        }

        Ok(paths.len())
    }

    pub fn definition(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions.read().get(name).cloned()
    }

    /// Summaries of all registered definitions, ordered by name
    pub fn definitions(&self) -> Vec<DefinitionInfo> {
        self.definitions
            .read()
            .values()
            .map(|d| DefinitionInfo {
                name: d.name.clone(),
                description: d.description.clone(),
                version: d.version.clone(),
                step_count: d.steps.len(),
                parameters_schema: d.parameters_schema.clone(),
            })
            .collect()
    }

    // ---- instances ----

    /// Create a Pending instance of `workflow_name`
    pub fn start(&self, workflow_name: &str, params: Value) -> Result<Uuid, OrchestratorError> {
        let definition = self.definition(workflow_name).ok_or_else(|| {
            OrchestratorError::validation(format!("workflow '{}' does not exist", workflow_name))
        })?;
        definition.validate_parameters(&params)?;

        let instance = definition.instantiate(params);
        let id = instance.id;
        info!(instance_id = %id, workflow = %workflow_name, "Created workflow instance");

        self.instances.write().insert(id, instance);
        self.cancel_tokens.lock().insert(id, CancellationToken::new());
        Ok(id)
    }

    /// Start and execute in one call
    pub async fn run(
        &self,
        workflow_name: &str,
        params: Value,
    ) -> Result<WorkflowInstance, OrchestratorError> {
        let id = self.start(workflow_name, params)?;
        self.execute(id).await
    }

    /// Execute an instance in a background task
    pub fn spawn(
        self: &Arc<Self>,
        id: Uuid,
    ) -> JoinHandle<Result<WorkflowInstance, OrchestratorError>> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.execute(id).await })
    }

    pub fn instance(&self, id: Uuid) -> Option<WorkflowInstance> {
        self.instances.read().get(&id).cloned()
    }

    /// All instances, most recent first
    pub fn instances(&self) -> Vec<WorkflowInstance> {
        let mut all: Vec<_> = self.instances.read().values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    /// Drop a finished instance; returns whether one was removed
    pub fn purge(&self, id: Uuid) -> Result<bool, OrchestratorError> {
        let mut instances = self.instances.write();
        match instances.get(&id) {
            None => Ok(false),
            Some(instance) if !instance.is_finished() => Err(OrchestratorError::validation(
                format!("instance {} is {} and cannot be purged", id, instance.status),
            )),
            Some(_) => {
                instances.remove(&id);
                self.cancel_tokens.lock().remove(&id);
                Ok(true)
            }
        }
    }

    /// Drop every finished instance; returns how many were removed
    pub fn purge_finished(&self) -> usize {
        let mut instances = self.instances.write();
        let finished: Vec<Uuid> = instances
            .values()
            .filter(|i| i.is_finished())
            .map(|i| i.id)
            .collect();

        let mut tokens = self.cancel_tokens.lock();
        for id in &finished {
            instances.remove(id);
            tokens.remove(id);
        }
        finished.len()
    }

    /// Receive every event recorded from now on
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    /// Append to the instance history and broadcast
    fn emit(&self, instance: &mut WorkflowInstance, event: WorkflowEvent) {
        instance.events.push(event.clone());
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    // ---- execution ----

    /// Cancel an instance. Pending steps are cancelled, in-flight calls are
    /// told to stop. Returns false if the instance had already finished.
    pub fn cancel(&self, id: Uuid) -> Result<bool, OrchestratorError> {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(&id)
            .ok_or_else(|| OrchestratorError::validation(format!("instance {} does not exist", id)))?;

        if instance.is_finished() {
            return Ok(false);
        }

        let reason = OrchestratorError::Cancelled("instance cancelled".to_string());
        for step_id in instance.pending_ids() {
            if let Some(step) = instance.step_mut(&step_id) {
                step.cancel("instance cancelled");
            }
            let event = WorkflowEvent::new(
                id,
                Some(step_id.clone()),
                EventType::StepCancelled,
                format!("Step '{}' cancelled before dispatch", step_id),
            );
            self.emit(instance, event);
        }

        instance.finish(InstanceStatus::Cancelled, Some(&reason));
        let event = WorkflowEvent::new(
            id,
            None,
            EventType::InstanceCancelled,
            format!("Workflow '{}' cancelled", instance.workflow_name),
        )
        .with_duration(instance.total_execution_ms);
        self.emit(instance, event);

        if let Some(token) = self.cancel_tokens.lock().get(&id) {
            token.cancel();
        }

        info!(instance_id = %id, "Workflow cancelled");
        Ok(true)
    }

    /// Drive a Pending instance to a terminal status.
    ///
    /// `Err` only for an unknown instance or one that is not Pending; every
    /// failure during execution is recorded on the returned instance.
    #[instrument(skip(self), fields(instance_id = %id))]
    pub async fn execute(&self, id: Uuid) -> Result<WorkflowInstance, OrchestratorError> {
        let (cancel, deadline) = self.begin(id)?;
        let scan_interval = self.settings.scan_interval();

        loop {
            let batch = match self.next_pass(id, deadline, &cancel) {
                Pass::Finished => break,
                Pass::Dispatch(batch) => batch,
            };

            let outcomes = join_all(batch.into_iter().map(|d| self.run_step(d))).await;
            if self.record(id, outcomes) {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(scan_interval) => {}
            }
        }

        self.cancel_tokens.lock().remove(&id);
        self.instance(id)
            .ok_or_else(|| OrchestratorError::validation(format!("instance {} was purged", id)))
    }

    /// Pending -> Running; returns the cancel token and overall deadline
    fn begin(&self, id: Uuid) -> Result<(CancellationToken, Option<Instant>), OrchestratorError> {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(&id)
            .ok_or_else(|| OrchestratorError::validation(format!("instance {} does not exist", id)))?;

        if instance.status != InstanceStatus::Pending {
            return Err(OrchestratorError::validation(format!(
                "instance {} is {}, not pending",
                id, instance.status
            )));
        }

        instance.status = InstanceStatus::Running;
        instance.started_at = Some(Utc::now());
        let event = WorkflowEvent::new(
            id,
            None,
            EventType::InstanceStarted,
            format!("Workflow '{}' started", instance.workflow_name),
        );
        self.emit(instance, event);
        info!(workflow = %instance.workflow_name, steps = instance.steps.len(), "Starting workflow execution");

        let deadline = instance
            .timeout_seconds
            .map(|secs| Instant::now() + Duration::from_secs(secs));

        let cancel = self
            .cancel_tokens
            .lock()
            .entry(id)
            .or_insert_with(CancellationToken::new)
            .clone();

        Ok((cancel, deadline))
    }

    /// One scan: finish the instance, or pick the steps to dispatch
    fn next_pass(
        &self,
        id: Uuid,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Pass {
        let mut instances = self.instances.write();
        let Some(instance) = instances.get_mut(&id) else {
            return Pass::Finished;
        };

        if instance.is_finished() {
            return Pass::Finished;
        }

        let pending = instance.pending_ids();
        if pending.is_empty() {
            self.complete(instance);
            return Pass::Finished;
        }

        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        if remaining.is_some_and(|r| r.is_zero()) {
            let err = OrchestratorError::Timeout(format!(
                "workflow deadline of {}s elapsed",
                instance.timeout_seconds.unwrap_or_default()
            ));
            self.fail_instance(instance, &err);
            return Pass::Finished;
        }

        let completed = instance.completed_ids();
        let eligible: Vec<String> = instance
            .steps
            .iter()
            .filter(|s| s.is_eligible(&completed))
            .map(|s| s.id.clone())
            .collect();

        if eligible.is_empty() {
            let err = OrchestratorError::DependencyDeadlock { pending };
            self.fail_instance(instance, &err);
            return Pass::Finished;
        }

        instance.scan_passes += 1;
        debug!(pass = instance.scan_passes, eligible = ?eligible, "Scan pass");

        // Resolve parameters before anything starts so a bad reference
        // fails the instance without dispatching siblings
        let mut contexts = Vec::with_capacity(eligible.len());
        for step_id in &eligible {
            let Some(step) = instance.step(step_id) else {
                continue;
            };

            let dependency_results: BTreeMap<String, Value> = step
                .dependencies
                .iter()
                .filter_map(|dep| {
                    instance
                        .step(dep)
                        .and_then(|d| d.result.clone())
                        .map(|r| (dep.clone(), r))
                })
                .collect();

            let resolved = TemplateContext::new(&instance.parameters, &dependency_results)
                .resolve(&step.parameters);

            let step_timeout = step.timeout_seconds.map(Duration::from_secs);
            let timeout = match (step_timeout, remaining) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            match resolved {
                Ok(parameters) => contexts.push((
                    step.step_type,
                    StepContext {
                        instance_id: id,
                        workflow_name: instance.workflow_name.clone(),
                        step_id: step_id.clone(),
                        parameters,
                        instance_parameters: instance.parameters.clone(),
                        dependency_results,
                        cancel: cancel.child_token(),
                        timeout,
                    },
                )),
                Err(err) => {
                    self.start_step(instance, step_id);
                    self.fail_step(instance, step_id, &err);
                    self.fail_instance(instance, &err);
                    return Pass::Finished;
                }
            }
        }

        let batch = contexts
            .into_iter()
            .map(|(step_type, context)| {
                let step_id = context.step_id.clone();
                self.start_step(instance, &step_id);
                Dispatch {
                    step_id,
                    handler: self.handlers.get(step_type),
                    step_type,
                    context,
                }
            })
            .collect();

        Pass::Dispatch(batch)
    }

    /// Run one step's handler under its deadline
    async fn run_step(&self, dispatch: Dispatch) -> (String, Result<Value, OrchestratorError>) {
        let Dispatch {
            step_id,
            handler,
            step_type,
            context,
        } = dispatch;

        let Some(handler) = handler else {
            let err = OrchestratorError::validation(format!(
                "no handler registered for step type '{}'",
                step_type
            ));
            return (step_id, Err(err));
        };

        let outcome = match context.timeout {
            Some(limit) => match tokio::time::timeout(limit, handler.handle(&context)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(OrchestratorError::Timeout(format!(
                    "step '{}' exceeded {:?}",
                    step_id, limit
                ))),
            },
            None => handler.handle(&context).await,
        };

        (step_id, outcome)
    }

    /// Record a pass's outcomes. Returns true when the instance is done.
    fn record(&self, id: Uuid, outcomes: Vec<(String, Result<Value, OrchestratorError>)>) -> bool {
        let mut instances = self.instances.write();
        let Some(instance) = instances.get_mut(&id) else {
            return true;
        };

        let mut first_failure: Option<OrchestratorError> = None;

        for (step_id, outcome) in outcomes {
            match outcome {
                Ok(result) => self.complete_step(instance, &step_id, result),
                Err(err @ OrchestratorError::Cancelled(_))
                    if instance.status == InstanceStatus::Cancelled =>
                {
                    self.cancel_step(instance, &step_id, &err);
                }
                Err(err) => {
                    self.fail_step(instance, &step_id, &err);
                    first_failure.get_or_insert(err);
                }
            }
        }

        if instance.is_finished() {
            return true;
        }

        if let Some(err) = first_failure {
            self.fail_instance(instance, &err);
            return true;
        }

        false
    }

    // ---- transitions ----

    fn start_step(&self, instance: &mut WorkflowInstance, step_id: &str) {
        let Some(step) = instance.step_mut(step_id) else {
            return;
        };
        if !step.begin() {
            return;
        }
        let summary = format!("Step '{}' ({}) started", step.name, step.step_type);
        instance.current_step = Some(step_id.to_string());

        let event = WorkflowEvent::new(
            instance.id,
            Some(step_id.to_string()),
            EventType::StepStarted,
            summary,
        );
        self.emit(instance, event);
    }

    fn complete_step(&self, instance: &mut WorkflowInstance, step_id: &str, result: Value) {
        let Some(step) = instance.step_mut(step_id) else {
            return;
        };
        if !step.complete(result) {
            return;
        }
        let duration = step.duration_ms;
        info!(step = %step_id, duration_ms = duration.unwrap_or_default(), "Step completed");

        let event = WorkflowEvent::new(
            instance.id,
            Some(step_id.to_string()),
            EventType::StepCompleted,
            format!("Step '{}' completed", step_id),
        )
        .with_duration(duration);
        self.emit(instance, event);
    }

    fn fail_step(&self, instance: &mut WorkflowInstance, step_id: &str, err: &OrchestratorError) {
        let Some(step) = instance.step_mut(step_id) else {
            return;
        };
        if !step.fail(err) {
            return;
        }
        let duration = step.duration_ms;
        error!(step = %step_id, error = %err, "Step failed");

        let event = WorkflowEvent::new(
            instance.id,
            Some(step_id.to_string()),
            EventType::StepFailed,
            format!("Step '{}' failed", step_id),
        )
        .with_duration(duration)
        .with_error(err.to_string());
        self.emit(instance, event);
    }

    fn cancel_step(&self, instance: &mut WorkflowInstance, step_id: &str, err: &OrchestratorError) {
        let Some(step) = instance.step_mut(step_id) else {
            return;
        };
        if !step.cancel(&err.to_string()) {
            return;
        }
        let duration = step.duration_ms;

        let event = WorkflowEvent::new(
            instance.id,
            Some(step_id.to_string()),
            EventType::StepCancelled,
            format!("Step '{}' stopped by cancellation", step_id),
        )
        .with_duration(duration);
        self.emit(instance, event);
    }

    fn complete(&self, instance: &mut WorkflowInstance) {
        instance.finish(InstanceStatus::Completed, None);
        info!(
            workflow = %instance.workflow_name,
            passes = instance.scan_passes,
            total_ms = instance.total_execution_ms.unwrap_or_default(),
            "Workflow completed"
        );

        let event = WorkflowEvent::new(
            instance.id,
            None,
            EventType::InstanceCompleted,
            format!("Workflow '{}' completed", instance.workflow_name),
        )
        .with_duration(instance.total_execution_ms);
        self.emit(instance, event);
    }

    fn fail_instance(&self, instance: &mut WorkflowInstance, err: &OrchestratorError) {
        instance.finish(InstanceStatus::Failed, Some(err));
        let untouched = instance.pending_ids();
        warn!(
            workflow = %instance.workflow_name,
            error = %err,
            pending = ?untouched,
            "Workflow failed"
        );

        let event = WorkflowEvent::new(
            instance.id,
            None,
            EventType::InstanceFailed,
            format!("Workflow '{}' failed", instance.workflow_name),
        )
        .with_duration(instance.total_execution_ms)
        .with_error(err.to_string());
        self.emit(instance, event);
    }
}
