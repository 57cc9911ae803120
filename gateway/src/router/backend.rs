//! Inference backend client.
//!
//! The router talks to model endpoints through [`InferenceBackend`] so tests
//! can script responses. The HTTP implementation posts the wire request to
//! the variant's base URL and expects `{"message": <assistant message>}`
//! back.

use async_trait::async_trait;

use crate::config::GatewayConfig;
use crate::endpoints::ModelVariant;
use crate::harmony::{self, Message, WireRequest};

/// Failures of a single inference call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("inference request timed out after {0}s")]
    Timeout(u64),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("inference endpoint returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("malformed inference response: {0}")]
    Malformed(String),
}

/// One inference call against one variant.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn complete(
        &self,
        model: ModelVariant,
        request: &WireRequest,
    ) -> Result<Message, BackendError>;
}

/// Copy of the request with `settings.model` pinned to the target variant.
/// The same request body must be reusable across a fallback hop.
fn with_model(request: &WireRequest, model: ModelVariant) -> WireRequest {
    let mut request = request.clone();
    request.settings.insert(
        "model".to_string(),
        serde_json::Value::String(model.api_name().to_string()),
    );
    request
}

/// reqwest-backed inference client.
pub struct HttpInferenceBackend {
    client: reqwest::Client,
    api_key: Option<String>,
    gpt_120b_url: String,
    gpt_20b_url: String,
    timeout_secs: u64,
}

impl HttpInferenceBackend {
    pub fn new(config: &GatewayConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            gpt_120b_url: config.gpt_120b.base_url.clone(),
            gpt_20b_url: config.gpt_20b.base_url.clone(),
            timeout_secs: config.request_timeout.as_secs(),
        })
    }

    fn base_url(&self, model: ModelVariant) -> &str {
        match model {
            ModelVariant::Gpt120b => &self.gpt_120b_url,
            ModelVariant::Gpt20b => &self.gpt_20b_url,
        }
    }
}

#[async_trait]
impl InferenceBackend for HttpInferenceBackend {
    async fn complete(
        &self,
        model: ModelVariant,
        request: &WireRequest,
    ) -> Result<Message, BackendError> {
        let body = with_model(request, model);
        let mut builder = self.client.post(self.base_url(model)).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout(self.timeout_secs)
            } else {
                BackendError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Api {
                status: status.as_u16(),
                body,
            });
        }

        #[derive(serde::Deserialize)]
        struct CompletionBody {
            message: Message,
        }

        let completion: CompletionBody = response
            .json()
            .await
            .map_err(|e| BackendError::Malformed(e.to_string()))?;

        harmony::validate(&completion.message)
            .map_err(|e| BackendError::Malformed(e.to_string()))?;
        Ok(completion.message)
    }
}
