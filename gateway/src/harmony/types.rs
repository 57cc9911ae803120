//! Message and content types for the model wire protocol.
//!
//! Every exchange with a model endpoint is a list of [`Message`] values.
//! Content is a tagged union so the serialized form carries a `type`
//! discriminator that the endpoints understand:
//!
//! ```text
//! { "role": "user", "content": [ { "type": "text", "text": "hello" } ] }
//! ```
//!
//! Tool definitions ride on the opening message of a conversation and
//! nowhere else; [`crate::harmony::validate_conversation`] enforces that.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Role {
    type Error = crate::harmony::SchemaViolation;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(crate::harmony::SchemaViolation::InvalidRole(
                other.to_string(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Content blocks
// ---------------------------------------------------------------------------

/// One unit of message content.
///
/// `ToolCode` is how the assistant asks for a tool invocation; `Error` is how
/// failed tool calls and terminal task failures come back as ordinary data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Json {
        data: serde_json::Value,
    },
    Image {
        url: String,
    },
    ToolCode {
        name: String,
        arguments: serde_json::Value,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tag: Option<String>,
        description: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn error(tag: Option<String>, description: impl Into<String>) -> Self {
        ContentBlock::Error {
            tag,
            description: description.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ContentBlock::Error { .. })
    }
}

// ---------------------------------------------------------------------------
// Tool signatures
// ---------------------------------------------------------------------------

/// A callable tool as advertised to the model: name, human description, and
/// a JSON schema for its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSignature {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A single message in a conversation transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    /// Tool definitions. Populated only on the opening message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSignature>,
}

impl Message {
    /// First text block, if any. Model replies put their prose here.
    pub fn first_text(&self) -> Option<&str> {
        self.content.iter().find_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
    }

    /// True when every content block is an error block. Tool results use this
    /// shape to report failure without breaking the conversation.
    pub fn is_error_result(&self) -> bool {
        !self.content.is_empty() && self.content.iter().all(ContentBlock::is_error)
    }
}

// ---------------------------------------------------------------------------
// Wire request
// ---------------------------------------------------------------------------

/// The request body sent to a model endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSignature>,
    pub settings: serde_json::Map<String, serde_json::Value>,
}
