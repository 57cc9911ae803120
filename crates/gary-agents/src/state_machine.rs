//! Task state machine with explicit states and legal transition guards.
//!
//! Provides a typed state model for the task loop so that:
//! 1. Every state transition is auditable and logged.
//! 2. Illegal transitions are caught at the `advance()` guard.
//! 3. A stored task's transition trail reconstructs the exact sequence.
//!
//! The task loop calls `advance()` to move between states. Each call
//! validates the transition and records it in the transition log.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// The set of task states.
///
/// Every task starts at `Queued` and terminates at `Complete`, `Failed`,
/// or `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Accepted into the store, loop not yet started.
    Queued,
    /// Asking the model to turn the goal into an ordered step plan.
    Planning,
    /// Working through plan steps in index order.
    Executing,
    /// Suspended on the task's decision channel.
    WaitingOnHuman,
    /// All steps done; asking the model whether the goal is satisfied.
    Verifying,
    /// Goal satisfied — terminal state.
    Complete,
    /// Gave up with a recorded failure — terminal state.
    Failed,
    /// Cancelled by operator request — terminal state.
    Aborted,
}

impl TaskState {
    /// Whether this is a terminal state (no further transitions allowed).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Aborted)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "Queued"),
            Self::Planning => write!(f, "Planning"),
            Self::Executing => write!(f, "Executing"),
            Self::WaitingOnHuman => write!(f, "WaitingOnHuman"),
            Self::Verifying => write!(f, "Verifying"),
            Self::Complete => write!(f, "Complete"),
            Self::Failed => write!(f, "Failed"),
            Self::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Legal transitions between task states.
///
/// The transition table encodes the valid edges in the state graph:
/// ```text
/// Queued → Planning
/// Planning → Executing
/// Executing → Verifying | WaitingOnHuman | Planning
/// WaitingOnHuman → Executing
/// Verifying → Complete | Planning
/// any non-terminal → Failed | Aborted
/// ```
/// The runner enforces the once-only post-verification replanning cycle;
/// the table only says `Verifying → Planning` is a legal edge.
pub fn is_legal_transition(from: TaskState, to: TaskState) -> bool {
    use TaskState::*;

    // Any non-terminal state can fail or be aborted.
    if (to == Failed || to == Aborted) && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Queued, Planning)
            | (Planning, Executing)
            // After a step: continue, pause for a human, or replan
            | (Executing, Verifying)
            | (Executing, WaitingOnHuman)
            | (Executing, Planning)
            // A checkpoint decision resumes execution
            | (WaitingOnHuman, Executing)
            // After verifying: done, or one more planning pass
            | (Verifying, Complete)
            | (Verifying, Planning)
    )
}

/// A single recorded state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// The state transitioned from.
    pub from: TaskState,
    /// The state transitioned to.
    pub to: TaskState,
    /// Milliseconds since the state machine was created.
    pub elapsed_ms: u64,
    /// Optional context about why this transition happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error returned when an illegal transition is attempted.
#[derive(Debug, Clone)]
pub struct IllegalTransition {
    pub from: TaskState,
    pub to: TaskState,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Illegal task transition: {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

/// The task state machine.
///
/// Tracks the current state, enforces legal transitions, and maintains
/// a complete log of all transitions for the task's audit trail.
pub struct StateMachine {
    current: TaskState,
    created_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl StateMachine {
    /// Create a new state machine starting at `Queued`.
    pub fn new() -> Self {
        Self {
            current: TaskState::Queued,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    /// Get the current state.
    pub fn current(&self) -> TaskState {
        self.current
    }

    /// Attempt to advance to the next state.
    ///
    /// Returns `Ok(())` if the transition is legal, or `Err(IllegalTransition)`
    /// if the transition would violate the state graph.
    pub fn advance(&mut self, to: TaskState, reason: Option<&str>) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }

        let record = TransitionRecord {
            from: self.current,
            to,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        };

        tracing::debug!(from = %self.current, to = %to, "Task transition");

        self.transitions.push(record);
        self.current = to;
        Ok(())
    }

    /// Transition to `Failed` from any non-terminal state.
    pub fn fail(&mut self, reason: &str) -> Result<(), IllegalTransition> {
        self.advance(TaskState::Failed, Some(reason))
    }

    /// Transition to `Aborted` from any non-terminal state.
    pub fn abort(&mut self, reason: &str) -> Result<(), IllegalTransition> {
        self.advance(TaskState::Aborted, Some(reason))
    }

    /// Whether the state machine is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    /// Get the full transition log.
    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    /// Get a summary string of the state machine's history.
    pub fn summary(&self) -> String {
        let states: Vec<String> = self.transitions.iter().map(|t| t.to.to_string()).collect();
        format!(
            "{} -> {} ({}ms, {} transitions)",
            TaskState::Queued,
            self.current,
            self.created_at.elapsed().as_millis(),
            self.transitions.len(),
        ) + if states.is_empty() {
            String::new()
        } else {
            format!(" [{}]", states.join(" -> "))
        }
        .as_str()
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
