//! MCP tool servers: JSON-RPC transport and the invocation gateway.

mod gateway;
mod rpc;

pub use gateway::{GatewayError, ToolGateway};
pub use rpc::{
    HttpMcpTransport, McpError, McpServer, McpToolInfo, McpTransport, MCP_PROTOCOL_VERSION,
};
