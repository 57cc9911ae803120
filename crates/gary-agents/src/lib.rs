//! Agent orchestration core: the plan, execute, reflect, verify loop.
//!
//! This crate drives goals end to end on top of the `gateway` crate's
//! inference router and tool registry:
//!
//! - `runner`: the task loop itself, one async call per task
//! - `state_machine`: legal task states and the transition audit trail
//! - `task`: tasks, plan steps, checkpoint decisions, and the task store
//! - `contracts`: fail-closed parsers for plan, reflection, and verdict replies
//! - `prompts`: versioned markdown prompt builders
//! - `config`: environment-driven loop tuning

pub mod config;
pub mod contracts;
pub mod prompts;
pub mod runner;
pub mod state_machine;
pub mod task;

// Re-export the loop entry points
pub use config::LoopConfig;
pub use runner::TaskRunner;

// Re-export key state machine types
pub use state_machine::{IllegalTransition, StateMachine, TaskState, TransitionRecord};

// Re-export key task types
pub use task::{HumanDecision, Step, StepStatus, Task, TaskFailure, TaskStore, TaskStoreError};

// Re-export key contract types
pub use contracts::{PlanParseError, Reflection, ReflectionDecision, Verdict};
