//! Error type shared by the tracker and the lifecycle manager.

use super::types::{EndpointStatus, ModelVariant};

/// Endpoint tracking and lifecycle failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EndpointError {
    #[error("no endpoint configured for variant {id}")]
    UnknownEndpoint { id: ModelVariant },

    #[error("illegal endpoint transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: ModelVariant,
        from: EndpointStatus,
        to: EndpointStatus,
    },

    #[error("endpoint {id} did not reach running within {waited_secs}s")]
    WakeTimeout { id: ModelVariant, waited_secs: u64 },

    #[error("management API failure for {id}: {message}")]
    Management { id: ModelVariant, message: String },
}

impl EndpointError {
    /// The variant the failure is about.
    pub fn endpoint(&self) -> ModelVariant {
        match self {
            EndpointError::UnknownEndpoint { id }
            | EndpointError::InvalidTransition { id, .. }
            | EndpointError::WakeTimeout { id, .. }
            | EndpointError::Management { id, .. } => *id,
        }
    }
}
