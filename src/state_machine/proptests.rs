//! Property-based tests for the state machine
//!
//! These tests verify key invariants hold across all possible inputs.

use super::*;
use proptest::prelude::*;
use serde_json::json;

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_state() -> impl Strategy<Value = ChatState> {
    prop_oneof![
        Just(ChatState::Idle),
        Just(ChatState::Streaming),
        "[a-z_]{1,12}".prop_map(|tool_name| ChatState::ProcessingTool { tool_name }),
        "[a-zA-Z ]{1,30}".prop_map(|message| ChatState::Error { message }),
    ]
}

/// Events other than `Start`
fn arb_running_event() -> impl Strategy<Value = ChatEvent> {
    prop_oneof![
        "[a-zA-Z {}]{0,20}".prop_map(ChatEvent::chunk),
        "[a-z_]{1,12}".prop_map(|name| ChatEvent::ToolCall {
            name,
            input: json!({}),
        }),
        Just(ChatEvent::ToolComplete),
        "[a-zA-Z ]{1,30}".prop_map(ChatEvent::error),
        Just(ChatEvent::Complete),
    ]
}

fn arb_event() -> impl Strategy<Value = ChatEvent> {
    prop_oneof![Just(ChatEvent::Start), arb_running_event()]
}

fn is_terminal_transition(from: &ChatState, to: &ChatState) -> bool {
    from.is_active() && matches!(to, ChatState::Idle | ChatState::Error { .. })
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    /// A generation started once reaches a terminal state at most once
    #[test]
    fn prop_at_most_one_terminal_transition(
        events in proptest::collection::vec(arb_running_event(), 0..40)
    ) {
        let mut state = ChatState::Idle;
        let mut terminal = 0;
        for event in std::iter::once(ChatEvent::Start).chain(events) {
            if let Some(result) = transition(&state, event) {
                if is_terminal_transition(&state, &result.new_state) {
                    terminal += 1;
                }
                state = result.new_state;
            }
        }
        prop_assert!(terminal <= 1, "saw {} terminal transitions", terminal);
    }

    /// `processing_tool` is only entered from `streaming` via `tool_call`
    #[test]
    fn prop_processing_tool_only_via_tool_call(state in arb_state(), event in arb_event()) {
        let was_streaming = state == ChatState::Streaming;
        let was_tool_call = matches!(event, ChatEvent::ToolCall { .. });
        if let Some(result) = transition(&state, event) {
            if matches!(result.new_state, ChatState::ProcessingTool { .. }) {
                prop_assert!(was_streaming && was_tool_call);
            }
        }
    }

    /// Only `start` leaves the error state
    #[test]
    fn prop_error_is_sticky(message in "[a-z ]{1,20}", event in arb_running_event()) {
        let state = ChatState::Error { message };
        prop_assert!(transition(&state, event).is_none());
    }

    /// Effects are emitted exactly for chunks and tool calls
    #[test]
    fn prop_effects_match_event(state in arb_state(), event in arb_event()) {
        let emits = matches!(event, ChatEvent::Chunk { .. } | ChatEvent::ToolCall { .. });
        if let Some(result) = transition(&state, event) {
            prop_assert_eq!(result.effects.len(), usize::from(emits));
        }
    }

    /// The machine wrapper agrees with the pure function
    #[test]
    fn prop_machine_matches_transition(
        events in proptest::collection::vec(arb_event(), 0..30)
    ) {
        let mut machine = ChatMachine::new();
        let mut state = ChatState::Idle;
        for event in events {
            let expected = transition(&state, event.clone());
            let effects = machine.dispatch(event);
            match expected {
                Some(result) => {
                    prop_assert_eq!(effects, Some(result.effects));
                    state = result.new_state;
                }
                None => prop_assert!(effects.is_none()),
            }
            prop_assert_eq!(machine.state(), &state);
        }
    }
}
