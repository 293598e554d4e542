//! Effects produced by state transitions

use serde_json::Value;

/// Effects to be executed by the coordinator after a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Append text to the current text turn
    EmitChunk { text: String },

    /// Open a `tool_call` turn and dispatch the invocation
    EmitToolCall { name: String, input: Value },
}

impl Effect {
    pub fn emit_chunk(text: impl Into<String>) -> Self {
        Effect::EmitChunk { text: text.into() }
    }
}
