//! Events that drive a generation

use serde_json::Value;

/// Events that trigger state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// A generation begins
    Start,

    /// Plain text from the model
    Chunk { text: String },

    /// A structured block requested a tool
    ToolCall { name: String, input: Value },

    /// The outstanding tool result was folded into history
    ToolComplete,

    /// The generation failed
    Error { cause: String },

    /// The model finished and all turns settled
    Complete,
}

impl ChatEvent {
    pub fn chunk(text: impl Into<String>) -> Self {
        ChatEvent::Chunk { text: text.into() }
    }

    pub fn error(cause: impl Into<String>) -> Self {
        ChatEvent::Error {
            cause: cause.into(),
        }
    }

    /// Name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            ChatEvent::Start => "start",
            ChatEvent::Chunk { .. } => "chunk",
            ChatEvent::ToolCall { .. } => "tool_call",
            ChatEvent::ToolComplete => "tool_complete",
            ChatEvent::Error { .. } => "error",
            ChatEvent::Complete => "complete",
        }
    }
}
