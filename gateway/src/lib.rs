//! Gateway between the agent loop and the outside world.
//!
//! This crate owns everything that crosses a network boundary on behalf of
//! the orchestrator:
//!
//! - `endpoints`: status tracking plus wake/sleep lifecycle for the two
//!   model deployments, including the auto-sleep sweeper.
//! - `router`: inference routing with a single 120B→20B fallback hop.
//! - `harmony`: the wire message schema and its pure builders/validators.
//! - `tools`: MCP tool servers behind one registry, tool failures carried
//!   in-band as error blocks.
//! - `events`: broadcast bus for orchestration events.
//! - `api`: axum REST surface for endpoint management.
//!
//! Everything is dependency-injected: trait seams (`EndpointControl`,
//! `InferenceBackend`, `McpTransport`) cover the network edges so the whole
//! crate tests without sockets.

pub mod api;
pub mod config;
pub mod endpoints;
pub mod events;
pub mod harmony;
pub mod router;
pub mod tools;

// Re-export key configuration types
pub use config::{EndpointTarget, GatewayConfig, McpServerConfig};

// Re-export key endpoint types
pub use endpoints::{
    EndpointControl, EndpointError, EndpointSnapshot, EndpointStatus, EndpointTracker,
    HttpEndpointControl, LifecycleManager, ModelVariant,
};

// Re-export key router types
pub use router::{FallbackRouter, HttpInferenceBackend, InferenceBackend, InferenceUnavailable};

// Re-export key message types
pub use harmony::{ContentBlock, Message, Role, SchemaViolation, ToolSignature, WireRequest};

// Re-export key tool types
pub use tools::{GatewayError, HttpMcpTransport, McpTransport, ToolGateway};

// Re-export key event types
pub use events::{EventBus, OrchestrationEvent, SharedEventBus};
