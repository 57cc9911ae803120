//! Management-API client for endpoint wake, sleep, and status probes.
//!
//! The lifecycle manager talks to the provider through the
//! [`EndpointControl`] trait so tests can substitute scripted fakes. The
//! HTTP implementation targets the provider's per-endpoint management URL:
//! `GET <control_url>` for status, `POST <control_url>/resume` to wake,
//! `POST <control_url>/pause` to sleep.

use async_trait::async_trait;
use tracing::debug;

use crate::config::GatewayConfig;

use super::types::{EndpointStatus, ModelVariant};

/// Failures talking to the management API.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ControlError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("management API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("malformed management response: {0}")]
    Malformed(String),
}

/// Wake/sleep/status operations against the provider's management plane.
#[async_trait]
pub trait EndpointControl: Send + Sync {
    /// Ask the provider to start the endpoint. Returns once the request is
    /// accepted, not once the endpoint is running.
    async fn request_wake(&self, id: ModelVariant) -> Result<(), ControlError>;

    /// Ask the provider to pause the endpoint.
    async fn request_sleep(&self, id: ModelVariant) -> Result<(), ControlError>;

    /// Current provider-side state of the endpoint.
    async fn probe_status(&self, id: ModelVariant) -> Result<EndpointStatus, ControlError>;
}

/// Map the provider's state string onto the endpoint status machine.
///
/// Unrecognized states come back as `Unknown` rather than an error; the
/// wake poll just keeps waiting and the timeout has the final word.
pub fn map_provider_state(state: &str) -> EndpointStatus {
    match state {
        "running" => EndpointStatus::Running,
        "initializing" | "pending" => EndpointStatus::Starting,
        "paused" | "scaledToZero" | "scaled_to_zero" => EndpointStatus::Sleeping,
        "stopping" | "pausing" => EndpointStatus::Stopping,
        "failed" => EndpointStatus::Error,
        _ => EndpointStatus::Unknown,
    }
}

/// reqwest-backed management client.
pub struct HttpEndpointControl {
    client: reqwest::Client,
    api_key: Option<String>,
    gpt_120b_url: String,
    gpt_20b_url: String,
}

impl HttpEndpointControl {
    pub fn new(config: &GatewayConfig) -> Result<Self, ControlError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ControlError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            gpt_120b_url: config.gpt_120b.control_url.clone(),
            gpt_20b_url: config.gpt_20b.control_url.clone(),
        })
    }

    fn control_url(&self, id: ModelVariant) -> &str {
        match id {
            ModelVariant::Gpt120b => &self.gpt_120b_url,
            ModelVariant::Gpt20b => &self.gpt_20b_url,
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn post_action(&self, id: ModelVariant, action: &str) -> Result<(), ControlError> {
        let url = format!("{}/{action}", self.control_url(id));
        let response = self
            .authorize(self.client.post(&url))
            .send()
            .await
            .map_err(|e| ControlError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ControlError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl EndpointControl for HttpEndpointControl {
    async fn request_wake(&self, id: ModelVariant) -> Result<(), ControlError> {
        self.post_action(id, "resume").await
    }

    async fn request_sleep(&self, id: ModelVariant) -> Result<(), ControlError> {
        self.post_action(id, "pause").await
    }

    async fn probe_status(&self, id: ModelVariant) -> Result<EndpointStatus, ControlError> {
        let response = self
            .authorize(self.client.get(self.control_url(id)))
            .send()
            .await
            .map_err(|e| ControlError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ControlError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ControlError::Malformed(e.to_string()))?;

        // The provider nests the state under `status.state`; some responses
        // flatten it to a top-level `state`.
        let state = body
            .pointer("/status/state")
            .or_else(|| body.get("state"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| ControlError::Malformed("no state field in response".into()))?;

        let mapped = map_provider_state(state);
        debug!(endpoint = %id, provider_state = state, status = %mapped, "probed endpoint");
        Ok(mapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_state_mapping() {
        assert_eq!(map_provider_state("running"), EndpointStatus::Running);
        assert_eq!(map_provider_state("initializing"), EndpointStatus::Starting);
        assert_eq!(map_provider_state("pending"), EndpointStatus::Starting);
        assert_eq!(map_provider_state("paused"), EndpointStatus::Sleeping);
        assert_eq!(map_provider_state("scaledToZero"), EndpointStatus::Sleeping);
        assert_eq!(map_provider_state("failed"), EndpointStatus::Error);
        assert_eq!(map_provider_state("wat"), EndpointStatus::Unknown);
    }
}
