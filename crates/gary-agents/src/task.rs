//! Task, step, and the in-memory task store.
//!
//! A [`Task`] is the unit of agentic work: a goal, the plan derived from it,
//! the conversation transcript, and an audit trail of state transitions. The
//! [`TaskStore`] holds every registered task behind a lock and owns the two
//! control channels the loop suspends on: the abort token and the human
//! decision channel.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use gateway::Message;

use crate::state_machine::{TaskState, TransitionRecord};

/// Longest goal prefix carried on events and listings.
const GOAL_PREVIEW_CHARS: usize = 80;

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// Execution status of one plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Done,
    Error,
}

/// One planned action.
///
/// A step with a `tool_name` dispatches through the tool gateway; a step
/// without one is a pure reasoning exchange with the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub index: usize,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub status: StepStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Step {
    pub fn new(
        index: usize,
        description: impl Into<String>,
        tool_name: Option<String>,
        parameters: Value,
    ) -> Self {
        Self {
            index,
            description: description.into(),
            tool_name,
            parameters,
            result: None,
            status: StepStatus::Pending,
            attempts: 0,
            last_error: None,
        }
    }

    /// Whether this step dispatches through the tool gateway.
    pub fn is_tool_step(&self) -> bool {
        self.tool_name.is_some()
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Failure details recorded when a task reaches `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Stable machine-readable tag, e.g. `planning_failed` or `tool_error`.
    pub tag: String,
    /// Human-readable description of what went wrong.
    pub description: String,
}

/// One unit of agentic work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub goal: String,
    pub status: TaskState,
    pub plan: Vec<Step>,
    pub transcript: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<TaskFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub transitions: Vec<TransitionRecord>,
}

impl Task {
    pub fn new(goal: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            goal: goal.into(),
            status: TaskState::Queued,
            plan: Vec::new(),
            transcript: Vec::new(),
            failure: None,
            created_at: now,
            updated_at: now,
            transitions: Vec::new(),
        }
    }

    /// Stamp `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Goal prefix suitable for event payloads and listings.
    pub fn goal_preview(&self) -> String {
        self.goal.chars().take(GOAL_PREVIEW_CHARS).collect()
    }

    /// Index of the first step that still needs work, if any.
    pub fn next_pending_step(&self) -> Option<usize> {
        self.plan.iter().position(|s| s.status != StepStatus::Done)
    }

    /// Write the task as pretty JSON to `path`.
    pub fn write_snapshot(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .with_context(|| format!("serializing task {}", self.id))?;
        std::fs::write(path, json)
            .with_context(|| format!("writing task snapshot to {}", path.display()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Human checkpoint decisions
// ---------------------------------------------------------------------------

/// Answer delivered to a task that is waiting on a human.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum HumanDecision {
    /// Continue executing the plan as it stands.
    Approve,
    /// Replace the remaining plan tail with the given steps, then continue.
    Edit { steps: Vec<Step> },
    /// Stop the task.
    Abort,
}

impl HumanDecision {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Edit { .. } => "edit",
            Self::Abort => "abort",
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Errors from store operations addressed at a specific task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskStoreError {
    #[error("no task with id {0}")]
    UnknownTask(String),
    #[error("task {0} is not waiting on a human decision")]
    NotWaiting(String),
}

struct TaskEntry {
    task: Task,
    cancel: CancellationToken,
    decisions: mpsc::Sender<HumanDecision>,
}

/// In-memory registry of every task this process has accepted.
///
/// The runner holds its own working copy of a task and pushes it back with
/// [`TaskStore::update`] after each state change, so readers always see the
/// latest committed snapshot.
#[derive(Default)]
pub struct TaskStore {
    entries: RwLock<HashMap<String, TaskEntry>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, TaskEntry>> {
        // A poisoned lock still holds valid entries; recover the guard.
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, TaskEntry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a task and hand back its control channels: the token the
    /// loop polls for aborts, and the receiver it suspends on at a human
    /// checkpoint. The channel holds one decision; a second resolution
    /// before the loop wakes up is rejected, not queued.
    pub fn register(&self, task: &Task) -> (CancellationToken, mpsc::Receiver<HumanDecision>) {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(1);
        self.write().insert(
            task.id.clone(),
            TaskEntry {
                task: task.clone(),
                cancel: cancel.clone(),
                decisions: tx,
            },
        );
        (cancel, rx)
    }

    /// Push the runner's working copy back into the store.
    pub fn update(&self, task: &Task) {
        if let Some(entry) = self.write().get_mut(&task.id) {
            entry.task = task.clone();
        }
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.read().get(id).map(|entry| entry.task.clone())
    }

    /// All known tasks, oldest first.
    pub fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.read().values().map(|e| e.task.clone()).collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Request an abort. The loop observes the token at its next
    /// suspension-point resumption; an already-terminal task is a no-op.
    pub fn abort(&self, id: &str) -> Result<(), TaskStoreError> {
        let entries = self.read();
        let entry = entries
            .get(id)
            .ok_or_else(|| TaskStoreError::UnknownTask(id.to_string()))?;
        entry.cancel.cancel();
        Ok(())
    }

    /// Deliver a human decision to a task parked at a checkpoint.
    pub fn resolve_checkpoint(
        &self,
        id: &str,
        decision: HumanDecision,
    ) -> Result<(), TaskStoreError> {
        let entries = self.read();
        let entry = entries
            .get(id)
            .ok_or_else(|| TaskStoreError::UnknownTask(id.to_string()))?;
        if entry.task.status != TaskState::WaitingOnHuman {
            return Err(TaskStoreError::NotWaiting(id.to_string()));
        }
        entry
            .decisions
            .try_send(decision)
            .map_err(|_| TaskStoreError::NotWaiting(id.to_string()))
    }
}
