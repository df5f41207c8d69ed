//! Workflow lifecycle events.
//!
//! Every state change of an instance or one of its steps is recorded as an
//! immutable event, appended to the instance history and broadcast to
//! subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single recorded state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The instance this event belongs to
    pub instance_id: Uuid,

    /// Step id (if applicable)
    pub step_id: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Human-readable summary (no payloads)
    pub summary: String,

    /// Time taken in milliseconds (for finished steps/instances)
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,
}

impl WorkflowEvent {
    /// Create a new event with the current timestamp
    pub fn new(
        instance_id: Uuid,
        step_id: Option<String>,
        event_type: EventType,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            instance_id,
            step_id,
            event_type,
            summary: summary.into(),
            duration_ms: None,
            error: None,
        }
    }

    pub fn with_duration(mut self, duration_ms: Option<u64>) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Types of events emitted during workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    InstanceStarted,
    InstanceCompleted,
    InstanceFailed,
    InstanceCancelled,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepCancelled,
}

impl EventType {
    /// Whether this event ends an instance
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::InstanceCompleted | Self::InstanceFailed | Self::InstanceCancelled
        )
    }
}
