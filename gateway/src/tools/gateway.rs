//! Tool invocation gateway.
//!
//! At startup every configured MCP server is initialized and its tools are
//! registered under their advertised names. Calls are routed to the owning
//! server; whatever goes wrong past the name lookup (transport failure,
//! RPC error, tool-reported failure) comes back as an ordinary tool-result
//! message carrying an error block, so the orchestrator's retry and
//! reflection logic sees it as data rather than a crash.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::harmony::{self, Message, ToolSignature};

use super::rpc::{McpServer, McpTransport};

/// The only error a tool call itself can raise: nobody owns that name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
}

struct RegisteredTool {
    server_index: usize,
    signature: ToolSignature,
}

/// Registry of tools across all connected MCP servers.
pub struct ToolGateway {
    servers: Vec<McpServer>,
    registry: HashMap<String, RegisteredTool>,
}

impl ToolGateway {
    /// Gateway with no servers and no tools. Planning still works; any
    /// tool call fails as unknown.
    pub fn empty() -> Self {
        Self {
            servers: Vec::new(),
            registry: HashMap::new(),
        }
    }

    /// Initialize every transport and register its tools. A server that
    /// fails the handshake or the listing is skipped; the rest still
    /// register. Duplicate tool names keep the first registration.
    pub async fn connect(transports: Vec<Arc<dyn McpTransport>>) -> Self {
        let mut servers: Vec<McpServer> = Vec::new();
        let mut registry: HashMap<String, RegisteredTool> = HashMap::new();

        for transport in transports {
            let server = McpServer::new(transport);
            if let Err(e) = server.initialize().await {
                warn!(server = server.label(), error = %e, "MCP initialize failed, skipping server");
                continue;
            }
            let tools = match server.list_tools().await {
                Ok(tools) => tools,
                Err(e) => {
                    warn!(server = server.label(), error = %e, "tools/list failed, skipping server");
                    continue;
                }
            };

            let server_index = servers.len();
            let mut registered = 0usize;
            for tool in tools {
                let signature = ToolSignature {
                    name: tool.name.clone(),
                    description: tool.description.unwrap_or_default(),
                    parameters: tool.input_schema,
                };
                match registry.entry(tool.name) {
                    Entry::Occupied(existing) => {
                        warn!(
                            tool = existing.key().as_str(),
                            server = server.label(),
                            "duplicate tool name, keeping first registration"
                        );
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(RegisteredTool {
                            server_index,
                            signature,
                        });
                        registered += 1;
                    }
                }
            }

            info!(server = server.label(), tools = registered, "MCP server registered");
            servers.push(server);
        }

        Self { servers, registry }
    }

    /// Read-only signature copies for planning prompts, name order.
    pub fn signatures(&self) -> Vec<ToolSignature> {
        let mut signatures: Vec<ToolSignature> = self
            .registry
            .values()
            .map(|tool| tool.signature.clone())
            .collect();
        signatures.sort_by(|a, b| a.name.cmp(&b.name));
        signatures
    }

    pub fn tool_count(&self) -> usize {
        self.registry.len()
    }

    /// Invoke a tool. Unknown names fail before any I/O; every other
    /// outcome, success or failure, is a tool-result message.
    pub async fn call(&self, tool_name: &str, parameters: Value) -> Result<Message, GatewayError> {
        let Some(tool) = self.registry.get(tool_name) else {
            return Err(GatewayError::UnknownTool(tool_name.to_string()));
        };
        let server = &self.servers[tool.server_index];

        let outcome = match server.call_tool(tool_name, parameters).await {
            Ok(value) => normalize_result(value),
            Err(e) => Err(e.to_string()),
        };
        if let Err(description) = &outcome {
            warn!(tool = tool_name, server = server.label(), error = %description, "tool call failed");
        }
        Ok(harmony::build_tool_result(tool_name, outcome))
    }
}

/// Flatten an MCP `tools/call` result. Text content collapses to a plain
/// string; `isError: true` becomes a failure carrying that text.
fn normalize_result(value: Value) -> Result<Value, String> {
    let is_error = value
        .get("isError")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let text = value.get("content").and_then(|c| c.as_array()).map(|blocks| {
        blocks
            .iter()
            .filter_map(|block| match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => block.get("text").and_then(|t| t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    });

    if is_error {
        return Err(text
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "tool reported an error".to_string()));
    }
    match text {
        Some(text) if !text.is_empty() => Ok(Value::String(text)),
        _ => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harmony::ContentBlock;
    use crate::tools::rpc::McpError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct MockTransport {
        label: String,
        tools: Value,
        call_response: Result<Value, String>,
        fail_init: bool,
        rpc_calls: Mutex<Vec<String>>,
        tool_calls: AtomicU32,
    }

    impl MockTransport {
        fn new(label: &str, tools: Value) -> Self {
            Self {
                label: label.to_string(),
                tools,
                call_response: Ok(json!({
                    "content": [{"type": "text", "text": "ok"}],
                    "isError": false,
                })),
                fail_init: false,
                rpc_calls: Mutex::new(Vec::new()),
                tool_calls: AtomicU32::new(0),
            }
        }

        fn with_call_response(mut self, response: Result<Value, String>) -> Self {
            self.call_response = response;
            self
        }

        fn failing_init(mut self) -> Self {
            self.fail_init = true;
            self
        }
    }

    #[async_trait]
    impl McpTransport for MockTransport {
        fn label(&self) -> &str {
            &self.label
        }

        async fn rpc(&self, method: &str, _params: Value) -> Result<Value, McpError> {
            self.rpc_calls.lock().unwrap().push(method.to_string());
            match method {
                "initialize" => {
                    if self.fail_init {
                        Err(McpError::Transport("connection refused".into()))
                    } else {
                        Ok(json!({"protocolVersion": "2024-11-05"}))
                    }
                }
                "tools/list" => Ok(json!({"tools": self.tools})),
                "tools/call" => {
                    self.tool_calls.fetch_add(1, Ordering::SeqCst);
                    match &self.call_response {
                        Ok(value) => Ok(value.clone()),
                        Err(message) => Err(McpError::Transport(message.clone())),
                    }
                }
                other => panic!("unexpected rpc method {other}"),
            }
        }
    }

    fn search_tool() -> Value {
        json!([{
            "name": "web_search",
            "description": "search the web",
            "inputSchema": {"type": "object", "properties": {"query": {"type": "string"}}},
        }])
    }

    #[tokio::test]
    async fn test_connect_registers_tools() {
        let transport = Arc::new(MockTransport::new("browse", search_tool()));
        let gateway = ToolGateway::connect(vec![transport.clone()]).await;

        assert_eq!(gateway.tool_count(), 1);
        let signatures = gateway.signatures();
        assert_eq!(signatures[0].name, "web_search");
        assert_eq!(signatures[0].description, "search the web");

        let calls = transport.rpc_calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["initialize", "tools/list"]);
    }

    #[tokio::test]
    async fn test_failed_server_skipped_others_survive() {
        let broken = Arc::new(MockTransport::new("broken", json!([])).failing_init());
        let healthy = Arc::new(MockTransport::new("browse", search_tool()));
        let gateway =
            ToolGateway::connect(vec![broken as Arc<dyn McpTransport>, healthy]).await;

        assert_eq!(gateway.tool_count(), 1);
        assert_eq!(gateway.signatures()[0].name, "web_search");
    }

    #[tokio::test]
    async fn test_duplicate_names_first_wins() {
        let first = Arc::new(MockTransport::new("alpha", search_tool()));
        let second = Arc::new(MockTransport::new("beta", search_tool()).with_call_response(Ok(
            json!({"content": [{"type": "text", "text": "from beta"}]}),
        )));
        let gateway = ToolGateway::connect(vec![
            first.clone() as Arc<dyn McpTransport>,
            second.clone(),
        ])
        .await;

        assert_eq!(gateway.tool_count(), 1);
        let message = gateway.call("web_search", json!({"query": "x"})).await.unwrap();
        assert_eq!(message.first_text(), Some("ok"));
        assert_eq!(first.tool_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.tool_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_tool_fails_before_io() {
        let transport = Arc::new(MockTransport::new("browse", search_tool()));
        let gateway = ToolGateway::connect(vec![transport.clone() as Arc<dyn McpTransport>]).await;

        let err = gateway.call("nope", json!({})).await.unwrap_err();
        assert_eq!(err, GatewayError::UnknownTool("nope".into()));
        assert_eq!(transport.tool_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transport_failure_becomes_error_block() {
        let transport = Arc::new(
            MockTransport::new("browse", search_tool())
                .with_call_response(Err("socket closed".into())),
        );
        let gateway = ToolGateway::connect(vec![transport as Arc<dyn McpTransport>]).await;

        let message = gateway.call("web_search", json!({})).await.unwrap();
        assert!(message.is_error_result());
        match &message.content[0] {
            ContentBlock::Error { tag, description } => {
                assert_eq!(tag.as_deref(), Some("web_search"));
                assert!(description.contains("socket closed"));
            }
            other => panic!("expected error block, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tool_reported_error_becomes_error_block() {
        let transport = Arc::new(MockTransport::new("browse", search_tool()).with_call_response(
            Ok(json!({
                "content": [{"type": "text", "text": "quota exceeded"}],
                "isError": true,
            })),
        ));
        let gateway = ToolGateway::connect(vec![transport as Arc<dyn McpTransport>]).await;

        let message = gateway.call("web_search", json!({})).await.unwrap();
        assert!(message.is_error_result());
        match &message.content[0] {
            ContentBlock::Error { description, .. } => {
                assert_eq!(description, "quota exceeded");
            }
            other => panic!("expected error block, got {other:?}"),
        }
    }

    #[test]
    fn test_normalize_structured_result_stays_json() {
        let value = json!({"rows": [1, 2, 3]});
        assert_eq!(normalize_result(value.clone()), Ok(value));
    }
}
