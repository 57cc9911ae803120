//! Endpoint state tracking and lifecycle management.

mod control;
mod error;
mod manager;
mod tracker;
mod types;

pub use control::{map_provider_state, ControlError, EndpointControl, HttpEndpointControl};
pub use error::EndpointError;
pub use manager::{LifecycleManager, LifecycleMetrics, LifecycleMetricsSnapshot};
pub use tracker::{EndpointTracker, InFlightGuard};
pub use types::{
    is_legal_status_transition, EndpointSnapshot, EndpointStatus, ModelVariant, UnknownVariant,
};
