//! Pure state transition function

use super::{ChatEvent, ChatState, Effect};

/// Result of a state transition
#[derive(Debug, PartialEq)]
pub struct TransitionResult {
    pub new_state: ChatState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: ChatState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }
}

/// Pure transition function
///
/// Returns `None` when the event has no meaning in the current state. The
/// caller must then leave the state untouched and notify nobody.
pub fn transition(state: &ChatState, event: ChatEvent) -> Option<TransitionResult> {
    match (state, event) {
        // Starting (or restarting after an error)
        (ChatState::Idle | ChatState::Error { .. }, ChatEvent::Start) => {
            Some(TransitionResult::new(ChatState::Streaming))
        }

        // Text keeps streaming; text after a tool block resumes streaming
        (ChatState::Streaming | ChatState::ProcessingTool { .. }, ChatEvent::Chunk { text }) => {
            Some(TransitionResult::new(ChatState::Streaming).with_effect(Effect::emit_chunk(text)))
        }

        (ChatState::Streaming, ChatEvent::ToolCall { name, input }) => Some(
            TransitionResult::new(ChatState::ProcessingTool {
                tool_name: name.clone(),
            })
            .with_effect(Effect::EmitToolCall { name, input }),
        ),

        (ChatState::ProcessingTool { .. }, ChatEvent::ToolComplete) => {
            Some(TransitionResult::new(ChatState::Streaming))
        }

        (ChatState::Streaming, ChatEvent::Complete) => Some(TransitionResult::new(ChatState::Idle)),

        (ChatState::Streaming | ChatState::ProcessingTool { .. }, ChatEvent::Error { cause }) => {
            Some(TransitionResult::new(ChatState::Error { message: cause }))
        }

        _ => None,
    }
}
