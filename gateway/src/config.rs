//! Environment-driven gateway configuration.
//!
//! Everything has a usable default so the binary comes up against local
//! stand-ins without any environment at all. Production deployments set the
//! `HF_*` endpoint variables and an API key.

use std::time::Duration;

use crate::endpoints::ModelVariant;

/// Where one model variant lives.
#[derive(Debug, Clone)]
pub struct EndpointTarget {
    /// Inference URL the wire requests are posted to.
    pub base_url: String,
    /// Management-API URL for wake/sleep/status probes.
    pub control_url: String,
}

/// One MCP tool server the gateway connects to at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McpServerConfig {
    pub label: String,
    pub url: String,
}

/// Top-level gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bearer token for the inference provider (optional for local runs).
    pub api_key: Option<String>,
    /// 120B primary deployment.
    pub gpt_120b: EndpointTarget,
    /// 20B fallback deployment.
    pub gpt_20b: EndpointTarget,
    /// Hard ceiling on a wake operation.
    pub wake_timeout: Duration,
    /// Inactivity window before an endpoint becomes sweep-eligible.
    pub auto_sleep_window: Duration,
    /// How often the auto-sleep sweeper runs.
    pub sweep_interval: Duration,
    /// Per-call timeout for inference and tool requests.
    pub request_timeout: Duration,
    /// MCP servers to register tools from.
    pub mcp_servers: Vec<McpServerConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let gpt_120b_url = std::env::var("HF_120B_URL")
            .unwrap_or_else(|_| "http://localhost:8601".into());
        let gpt_20b_url = std::env::var("HF_20B_URL")
            .unwrap_or_else(|_| "http://localhost:8602".into());
        Self {
            api_key: std::env::var("HF_API_KEY").ok(),
            gpt_120b: EndpointTarget {
                control_url: std::env::var("HF_120B_CONTROL_URL")
                    .unwrap_or_else(|_| gpt_120b_url.clone()),
                base_url: gpt_120b_url,
            },
            gpt_20b: EndpointTarget {
                control_url: std::env::var("HF_20B_CONTROL_URL")
                    .unwrap_or_else(|_| gpt_20b_url.clone()),
                base_url: gpt_20b_url,
            },
            wake_timeout: env_secs("GARY_WAKE_TIMEOUT_SECS", 300),
            auto_sleep_window: env_secs("GARY_AUTO_SLEEP_SECS", 900),
            sweep_interval: env_secs("GARY_SWEEP_INTERVAL_SECS", 60),
            request_timeout: env_secs("GARY_REQUEST_TIMEOUT_SECS", 45),
            mcp_servers: std::env::var("GARY_MCP_SERVERS")
                .map(|raw| parse_mcp_servers(&raw))
                .unwrap_or_default(),
        }
    }
}

impl GatewayConfig {
    pub fn target(&self, variant: ModelVariant) -> &EndpointTarget {
        match variant {
            ModelVariant::Gpt120b => &self.gpt_120b,
            ModelVariant::Gpt20b => &self.gpt_20b,
        }
    }
}

fn env_secs(key: &str, default: u64) -> Duration {
    let secs = std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default);
    Duration::from_secs(secs)
}

/// Parse `GARY_MCP_SERVERS`: comma-separated entries, each `label=url` or a
/// bare URL (which gets a positional label).
fn parse_mcp_servers(raw: &str) -> Vec<McpServerConfig> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .enumerate()
        .map(|(index, entry)| match entry.split_once('=') {
            Some((label, url)) => McpServerConfig {
                label: label.trim().to_string(),
                url: url.trim().to_string(),
            },
            None => McpServerConfig {
                label: format!("mcp-{index}"),
                url: entry.to_string(),
            },
        })
        .collect()
}
