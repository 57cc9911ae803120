//! Constructors and validation for wire messages.
//!
//! Everything here is pure: no clocks, no sockets, no globals. The agent
//! loop builds its transcript exclusively through these functions so that
//! malformed messages are caught before they ever reach an endpoint.

use serde_json::Value;
use thiserror::Error;

use super::types::{ContentBlock, Message, Role, ToolSignature, WireRequest};

/// A message that breaks the wire schema.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaViolation {
    #[error("message content must not be empty")]
    EmptyContent,
    #[error("unknown role: {0}")]
    InvalidRole(String),
    #[error("tool definitions are only allowed on the opening message")]
    ToolsOutsideOpening,
}

// ---------------------------------------------------------------------------
// Constructors
// ---------------------------------------------------------------------------

/// Plain user message with a single text block.
pub fn build_user_message(text: impl Into<String>) -> Message {
    Message {
        role: Role::User,
        content: vec![ContentBlock::text(text)],
        tools: Vec::new(),
    }
}

/// The first message of a conversation: the task goal plus the tool
/// signatures the model may call.
pub fn opening_message(text: impl Into<String>, tools: Vec<ToolSignature>) -> Message {
    Message {
        role: Role::User,
        content: vec![ContentBlock::text(text)],
        tools,
    }
}

/// Assistant message with a single text block.
pub fn build_assistant_message(text: impl Into<String>) -> Message {
    Message {
        role: Role::Assistant,
        content: vec![ContentBlock::text(text)],
        tools: Vec::new(),
    }
}

/// The assistant's request to invoke a tool.
pub fn build_tool_call(name: impl Into<String>, arguments: Value) -> Message {
    Message {
        role: Role::Assistant,
        content: vec![ContentBlock::ToolCode {
            name: name.into(),
            arguments,
        }],
        tools: Vec::new(),
    }
}

/// Outcome of a tool invocation, success or failure, as a `tool` message.
///
/// Failures become an error block tagged with the tool name. That keeps them
/// in-band: the model sees what went wrong and can plan around it.
pub fn build_tool_result(tool_name: &str, result: Result<Value, String>) -> Message {
    let content = match result {
        Ok(Value::String(text)) => vec![ContentBlock::Text { text }],
        Ok(data) => vec![ContentBlock::Json { data }],
        Err(description) => vec![ContentBlock::error(
            Some(tool_name.to_string()),
            description,
        )],
    };
    Message {
        role: Role::Tool,
        content,
        tools: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Check one message against the schema rules that apply to it in
/// isolation.
pub fn validate(message: &Message) -> Result<(), SchemaViolation> {
    if message.content.is_empty() {
        return Err(SchemaViolation::EmptyContent);
    }
    // Only a conversation opener may carry tools, and openers are user
    // messages.
    if message.role != Role::User && !message.tools.is_empty() {
        return Err(SchemaViolation::ToolsOutsideOpening);
    }
    Ok(())
}

/// Check a full transcript: every message individually, plus the rule that
/// tool definitions appear on the opening message and nowhere else.
pub fn validate_conversation(messages: &[Message]) -> Result<(), SchemaViolation> {
    for (index, message) in messages.iter().enumerate() {
        validate(message)?;
        if index > 0 && !message.tools.is_empty() {
            return Err(SchemaViolation::ToolsOutsideOpening);
        }
    }
    Ok(())
}

/// Assemble the request body for an endpoint call. The top-level tool list
/// mirrors whatever the opening message carries.
pub fn wire_request(
    messages: Vec<Message>,
    settings: serde_json::Map<String, Value>,
) -> WireRequest {
    let tools = messages
        .first()
        .map(|message| message.tools.clone())
        .unwrap_or_default();
    WireRequest {
        messages,
        tools,
        settings,
    }
}
