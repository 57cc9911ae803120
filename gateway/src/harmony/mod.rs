//! Wire message schema and the pure adapter functions that build it.

mod adapter;
mod types;

pub use adapter::{
    build_assistant_message, build_tool_call, build_tool_result, build_user_message,
    opening_message, validate, validate_conversation, wire_request, SchemaViolation,
};
pub use types::{ContentBlock, Message, Role, ToolSignature, WireRequest};
