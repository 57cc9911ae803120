//! JSON-RPC 2.0 plumbing for MCP tool servers.
//!
//! The handshake is the standard MCP sequence: `initialize` with the
//! protocol version, a `notifications/initialized` notification, then
//! `tools/list` / `tools/call` as needed. Transports are injected through
//! [`McpTransport`] so tests can script sessions without sockets.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// MCP protocol revision this client speaks.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Failures talking to an MCP server.
#[derive(Debug, Clone, thiserror::Error)]
pub enum McpError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("response to {0} carried no result")]
    MissingResult(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: String,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    #[allow(dead_code)]
    id: Option<Value>,
    result: Option<Value>,
    error: Option<JsonRpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcErrorBody {
    code: i64,
    message: String,
}

/// A tool as advertised by `tools/list`.
#[derive(Debug, Clone, Deserialize)]
pub struct McpToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// JSON-RPC request/notification transport to one MCP server.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Human-readable server label for logs.
    fn label(&self) -> &str;

    /// Send a request and return its `result`.
    async fn rpc(&self, method: &str, params: Value) -> Result<Value, McpError>;

    /// Send a notification (no id, no response expected).
    async fn notify(&self, _method: &str, _params: Value) -> Result<(), McpError> {
        Ok(())
    }
}

/// HTTP transport posting JSON-RPC envelopes.
pub struct HttpMcpTransport {
    label: String,
    url: String,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpMcpTransport {
    pub fn new(
        label: impl Into<String>,
        url: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Result<Self, McpError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| McpError::Transport(e.to_string()))?;
        Ok(Self {
            label: label.into(),
            url: url.into(),
            client,
            next_id: AtomicU64::new(1),
        })
    }

    async fn post(&self, request: &JsonRpcRequest) -> Result<reqwest::Response, McpError> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::Transport(format!(
                "server returned {status}: {body}"
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl McpTransport for HttpMcpTransport {
    fn label(&self) -> &str {
        &self.label
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, McpError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: Some(self.next_id.fetch_add(1, Ordering::Relaxed)),
            method: method.to_string(),
            params,
        };

        let response = self.post(&request).await?;
        let body: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| McpError::Malformed(e.to_string()))?;

        if let Some(error) = body.error {
            return Err(McpError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        body.result
            .ok_or_else(|| McpError::MissingResult(method.to_string()))
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), McpError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: None,
            method: method.to_string(),
            params,
        };
        self.post(&request).await?;
        Ok(())
    }
}

/// One connected MCP server: a transport plus the protocol calls on it.
pub struct McpServer {
    transport: Arc<dyn McpTransport>,
}

impl McpServer {
    pub fn new(transport: Arc<dyn McpTransport>) -> Self {
        Self { transport }
    }

    pub fn label(&self) -> &str {
        self.transport.label()
    }

    /// The MCP handshake: `initialize`, then `notifications/initialized`.
    pub async fn initialize(&self) -> Result<(), McpError> {
        self.transport
            .rpc(
                "initialize",
                json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "gary-gateway",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            )
            .await?;
        self.transport
            .notify("notifications/initialized", json!({}))
            .await
    }

    pub async fn list_tools(&self) -> Result<Vec<McpToolInfo>, McpError> {
        let result = self.transport.rpc("tools/list", json!({})).await?;
        let tools = result
            .get("tools")
            .cloned()
            .ok_or_else(|| McpError::Malformed("tools/list result has no tools array".into()))?;
        serde_json::from_value(tools).map_err(|e| McpError::Malformed(e.to_string()))
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        self.transport
            .rpc(
                "tools/call",
                json!({
                    "name": name,
                    "arguments": arguments,
                }),
            )
            .await
    }
}
