//! Broadcast event bus and the orchestration event vocabulary.

mod bus;
mod types;

pub use bus::{EventBus, EventBusExt, EventFilter, FilteredReceiver, SharedEventBus};
pub use types::OrchestrationEvent;
