//! Event types for orchestration observability.
//!
//! Every noteworthy moment in a task's life or an endpoint's lifecycle is
//! published on the bus so the CLI, the REST layer, and tests can watch
//! without polling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::endpoints::ModelVariant;

/// All orchestration events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    /// A new task entered the store
    TaskCreated {
        task_id: String,
        goal_preview: String,
        timestamp: DateTime<Utc>,
    },

    /// A task moved between lifecycle states
    TaskStateChanged {
        task_id: String,
        from: String,
        to: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A plan step began an attempt
    StepStarted {
        task_id: String,
        step_index: usize,
        tool: Option<String>,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    /// A plan step attempt finished
    StepFinished {
        task_id: String,
        step_index: usize,
        ok: bool,
        timestamp: DateTime<Utc>,
    },

    /// The loop suspended waiting for a human decision
    CheckpointRaised {
        task_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A human answered a checkpoint
    CheckpointResolved {
        task_id: String,
        decision: String,
        timestamp: DateTime<Utc>,
    },

    /// A wake request was issued to the management API
    WakeRequested {
        endpoint: ModelVariant,
        timestamp: DateTime<Utc>,
    },

    /// An endpoint reached running
    EndpointWoke {
        endpoint: ModelVariant,
        waited_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// An endpoint was put to sleep (manually or by the sweeper)
    EndpointSlept {
        endpoint: ModelVariant,
        auto: bool,
        timestamp: DateTime<Utc>,
    },

    /// A wake attempt gave up
    WakeFailed {
        endpoint: ModelVariant,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Inference moved from the preferred variant to its fallback
    FallbackEngaged {
        from: ModelVariant,
        to: ModelVariant,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl OrchestrationEvent {
    /// Get the timestamp of this event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            OrchestrationEvent::TaskCreated { timestamp, .. } => *timestamp,
            OrchestrationEvent::TaskStateChanged { timestamp, .. } => *timestamp,
            OrchestrationEvent::StepStarted { timestamp, .. } => *timestamp,
            OrchestrationEvent::StepFinished { timestamp, .. } => *timestamp,
            OrchestrationEvent::CheckpointRaised { timestamp, .. } => *timestamp,
            OrchestrationEvent::CheckpointResolved { timestamp, .. } => *timestamp,
            OrchestrationEvent::WakeRequested { timestamp, .. } => *timestamp,
            OrchestrationEvent::EndpointWoke { timestamp, .. } => *timestamp,
            OrchestrationEvent::EndpointSlept { timestamp, .. } => *timestamp,
            OrchestrationEvent::WakeFailed { timestamp, .. } => *timestamp,
            OrchestrationEvent::FallbackEngaged { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            OrchestrationEvent::TaskCreated { .. } => "task_created",
            OrchestrationEvent::TaskStateChanged { .. } => "task_state_changed",
            OrchestrationEvent::StepStarted { .. } => "step_started",
            OrchestrationEvent::StepFinished { .. } => "step_finished",
            OrchestrationEvent::CheckpointRaised { .. } => "checkpoint_raised",
            OrchestrationEvent::CheckpointResolved { .. } => "checkpoint_resolved",
            OrchestrationEvent::WakeRequested { .. } => "wake_requested",
            OrchestrationEvent::EndpointWoke { .. } => "endpoint_woke",
            OrchestrationEvent::EndpointSlept { .. } => "endpoint_slept",
            OrchestrationEvent::WakeFailed { .. } => "wake_failed",
            OrchestrationEvent::FallbackEngaged { .. } => "fallback_engaged",
        }
    }

    /// Get the task ID if this event is task-scoped
    pub fn task_id(&self) -> Option<&str> {
        match self {
            OrchestrationEvent::TaskCreated { task_id, .. } => Some(task_id),
            OrchestrationEvent::TaskStateChanged { task_id, .. } => Some(task_id),
            OrchestrationEvent::StepStarted { task_id, .. } => Some(task_id),
            OrchestrationEvent::StepFinished { task_id, .. } => Some(task_id),
            OrchestrationEvent::CheckpointRaised { task_id, .. } => Some(task_id),
            OrchestrationEvent::CheckpointResolved { task_id, .. } => Some(task_id),
            _ => None,
        }
    }

    /// Get the endpoint if this event is endpoint-scoped
    pub fn endpoint(&self) -> Option<ModelVariant> {
        match self {
            OrchestrationEvent::WakeRequested { endpoint, .. } => Some(*endpoint),
            OrchestrationEvent::EndpointWoke { endpoint, .. } => Some(*endpoint),
            OrchestrationEvent::EndpointSlept { endpoint, .. } => Some(*endpoint),
            OrchestrationEvent::WakeFailed { endpoint, .. } => Some(*endpoint),
            OrchestrationEvent::FallbackEngaged { from, .. } => Some(*from),
            _ => None,
        }
    }
}
