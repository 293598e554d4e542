//! Chat state types

use serde::Serialize;

/// State of one generation
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatState {
    /// No generation running, or the last one completed
    #[default]
    Idle,

    /// Model tokens are flowing
    Streaming,

    /// A tool call was detected and its result is outstanding
    ProcessingTool { tool_name: String },

    /// The generation failed; only a new start leaves this state
    Error { message: String },
}

impl ChatState {
    /// Get a string representation of the state type
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatState::Idle => "idle",
            ChatState::Streaming => "streaming",
            ChatState::ProcessingTool { .. } => "processing_tool",
            ChatState::Error { .. } => "error",
        }
    }

    /// Whether the generation is actively producing output
    pub fn is_active(&self) -> bool {
        matches!(self, ChatState::Streaming | ChatState::ProcessingTool { .. })
    }
}
