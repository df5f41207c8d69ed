//! Workflow instance and step state.
//!
//! A [`WorkflowInstance`] is one execution of a workflow definition. Its
//! steps only move forward: Pending -> Running -> Completed/Failed/Cancelled,
//! or Pending -> Cancelled when the instance is cancelled before dispatch.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::error::{ErrorKind, OrchestratorError};
use super::events::WorkflowEvent;

/// Kind of work a step performs; selects its handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// Load event data from a data service
    #[serde(alias = "data_fetch")]
    Fetch,

    /// Invoke one tool on one service
    #[serde(alias = "mcp_call")]
    RemoteCall,

    /// Hand results to the persistence sink
    #[serde(alias = "data_save")]
    Persist,

    /// Hand results to the geospatial publishing sink
    #[serde(alias = "geoserver_publish")]
    Publish,

    /// Invoke several services concurrently
    #[serde(alias = "parallel_mcp_calls")]
    FanOut,

    /// Combine outputs of earlier steps
    #[serde(alias = "data_integration")]
    Aggregate,
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Fetch => "fetch",
            Self::RemoteCall => "remote_call",
            Self::Persist => "persist",
            Self::Publish => "publish",
            Self::FanOut => "fan_out",
            Self::Aggregate => "aggregate",
        };
        write!(f, "{}", s)
    }
}

/// Status of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// One node of a workflow instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Step id (unique within the instance)
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub description: String,

    pub step_type: StepType,

    /// Handler parameters, may contain `${...}` references
    pub parameters: Value,

    /// Ids of steps that must complete first
    pub dependencies: Vec<String>,

    /// Step-level timeout override
    pub timeout_seconds: Option<u64>,

    pub status: StepStatus,

    pub result: Option<Value>,

    pub error: Option<String>,

    pub error_kind: Option<ErrorKind>,

    pub started_at: Option<DateTime<Utc>>,

    pub completed_at: Option<DateTime<Utc>>,

    pub duration_ms: Option<u64>,
}

impl WorkflowStep {
    /// Create a pending step
    pub fn new(id: impl Into<String>, name: impl Into<String>, step_type: StepType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            step_type,
            parameters: Value::Object(Default::default()),
            dependencies: Vec::new(),
            timeout_seconds: None,
            status: StepStatus::Pending,
            result: None,
            error: None,
            error_kind: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }

    /// Pending -> Running
    pub fn begin(&mut self) -> bool {
        if self.status != StepStatus::Pending {
            return false;
        }
        self.status = StepStatus::Running;
        self.started_at = Some(Utc::now());
        true
    }

    /// Running -> Completed
    pub fn complete(&mut self, result: Value) -> bool {
        if self.status != StepStatus::Running {
            return false;
        }
        self.status = StepStatus::Completed;
        self.result = Some(result);
        self.finish();
        true
    }

    /// Running -> Failed
    pub fn fail(&mut self, error: &OrchestratorError) -> bool {
        if self.status != StepStatus::Running {
            return false;
        }
        self.status = StepStatus::Failed;
        self.error = Some(error.to_string());
        self.error_kind = Some(error.kind());
        self.finish();
        true
    }

    /// Pending/Running -> Cancelled
    pub fn cancel(&mut self, reason: &str) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let was_running = self.status == StepStatus::Running;
        self.status = StepStatus::Cancelled;
        self.error = Some(reason.to_string());
        self.error_kind = Some(ErrorKind::Cancelled);
        if was_running {
            self.finish();
        }
        true
    }

    fn finish(&mut self) {
        let now = Utc::now();
        self.completed_at = Some(now);
        self.duration_ms = self
            .started_at
            .map(|start| (now - start).num_milliseconds().max(0) as u64);
    }

    /// Whether every dependency is in `completed`
    pub fn is_eligible(&self, completed: &HashSet<String>) -> bool {
        self.status == StepStatus::Pending
            && self.dependencies.iter().all(|d| completed.contains(d))
    }
}

/// Overall status of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// One execution of a workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,

    /// Name of the definition this instance was created from
    pub workflow_name: String,

    /// Runtime parameter bag, passed through to step parameters
    pub parameters: Value,

    pub steps: Vec<WorkflowStep>,

    pub status: InstanceStatus,

    /// Id of the most recently dispatched step
    pub current_step: Option<String>,

    /// Why the instance failed or was cancelled
    pub error: Option<String>,

    pub error_kind: Option<ErrorKind>,

    /// Overall deadline taken from the definition
    pub timeout_seconds: Option<u64>,

    pub created_at: DateTime<Utc>,

    pub started_at: Option<DateTime<Utc>>,

    pub completed_at: Option<DateTime<Utc>>,

    pub total_execution_ms: Option<u64>,

    /// Number of scheduling passes made by `execute`
    pub scan_passes: u32,

    /// State transitions in the order they happened
    pub events: Vec<WorkflowEvent>,
}

impl WorkflowInstance {
    pub fn new(workflow_name: impl Into<String>, parameters: Value, steps: Vec<WorkflowStep>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_name: workflow_name.into(),
            parameters,
            steps,
            status: InstanceStatus::Pending,
            current_step: None,
            error: None,
            error_kind: None,
            timeout_seconds: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            total_execution_ms: None,
            scan_passes: 0,
            events: Vec::new(),
        }
    }

    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut WorkflowStep> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// Ids of completed steps
    pub fn completed_ids(&self) -> HashSet<String> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.id.clone())
            .collect()
    }

    /// Ids of steps still waiting to run
    pub fn pending_ids(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to a terminal status and stamp completion time
    pub fn finish(&mut self, status: InstanceStatus, error: Option<&OrchestratorError>) {
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        self.total_execution_ms = self
            .started_at
            .map(|start| (now - start).num_milliseconds().max(0) as u64);
        if let Some(err) = error {
            self.error = Some(err.to_string());
            self.error_kind = Some(err.kind());
        }
    }

    /// Failed steps with their error messages
    pub fn failed_steps(&self) -> Vec<(&str, &str)> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .map(|s| (s.id.as_str(), s.error.as_deref().unwrap_or_default()))
            .collect()
    }
}
