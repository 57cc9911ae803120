//! JSON error envelopes for the REST surface.

use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::endpoints::EndpointError;

/// Wire shape for every API error.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub code: &'static str,
    pub message: String,
}

/// Map an endpoint failure onto an HTTP response.
pub fn endpoint_error_response(err: &EndpointError) -> (StatusCode, Json<ErrorEnvelope>) {
    let (status, code) = match err {
        EndpointError::UnknownEndpoint { .. } => (StatusCode::NOT_FOUND, "not_found"),
        EndpointError::InvalidTransition { .. } => {
            (StatusCode::UNPROCESSABLE_ENTITY, "invalid_state")
        }
        EndpointError::WakeTimeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "wake_timeout"),
        EndpointError::Management { .. } => (StatusCode::BAD_GATEWAY, "management_error"),
    };
    (
        status,
        Json(ErrorEnvelope {
            code,
            message: err.to_string(),
        }),
    )
}

/// 404 for a path segment that names no configured variant.
pub fn unknown_variant_response(tag: &str) -> (StatusCode, Json<ErrorEnvelope>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorEnvelope {
            code: "not_found",
            message: format!("unknown model variant: {tag}"),
        }),
    )
}
