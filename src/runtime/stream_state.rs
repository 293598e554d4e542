//! Per-generation stream bookkeeping
//!
//! Splits the raw token stream into plain text and structured blocks. Text
//! outside a candidate block is forwarded as soon as it arrives; from the
//! first `{` onward tokens are buffered until the block closes.

use crate::extractor::{find_block_end, parse_block, StructuredBlock};
use crate::state_machine::{ChatEvent, ChatMachine, ChatState, Effect};

/// A piece of model output ready to be acted on
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    Text(String),
    Block {
        block: StructuredBlock,
        /// The exact slice the block was parsed from
        raw: String,
    },
}

fn push_text(out: &mut Vec<Fragment>, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(Fragment::Text(last)) = out.last_mut() {
        last.push_str(text);
    } else {
        out.push(Fragment::Text(text.to_string()));
    }
}

#[derive(Default)]
pub struct StreamState {
    machine: ChatMachine,
    buffer: String,
    raw_output: String,
    pub model_stream_finished: bool,
    pub turns_finished: bool,
}

impl StreamState {
    pub fn new(machine: ChatMachine) -> Self {
        Self {
            machine,
            ..Self::default()
        }
    }

    pub fn state(&self) -> &ChatState {
        self.machine.state()
    }

    pub fn dispatch(&mut self, event: ChatEvent) -> Option<Vec<Effect>> {
        self.machine.dispatch(event)
    }

    /// Feed one model token
    pub fn feed(&mut self, token: &str) -> Vec<Fragment> {
        self.raw_output.push_str(token);

        let mut out = Vec::new();
        let mut pending = token.to_string();
        loop {
            if self.buffer.is_empty() {
                let Some(start) = pending.find('{') else {
                    push_text(&mut out, &pending);
                    return out;
                };
                let (text, candidate) = pending.split_at(start);
                push_text(&mut out, text);
                self.buffer.push_str(candidate);
            } else {
                self.buffer.push_str(&pending);
            }

            let Some(end) = find_block_end(&self.buffer) else {
                return out;
            };
            let remainder = self.buffer.split_off(end);
            let candidate = std::mem::take(&mut self.buffer);
            match parse_block(&candidate) {
                Ok(block) => out.push(Fragment::Block {
                    block,
                    raw: candidate,
                }),
                Err(e) => {
                    tracing::debug!(error = %e, "Balanced braces are not a block, forwarding as text");
                    push_text(&mut out, &candidate);
                }
            }

            if remainder.is_empty() {
                return out;
            }
            pending = remainder;
        }
    }

    /// Forward whatever is still buffered once the stream has ended
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }

    /// Raw model output since the last call, for the history entry
    pub fn take_raw_output(&mut self) -> String {
        std::mem::take(&mut self.raw_output)
    }

    /// Reset per-stream flags before a continuation stream opens
    pub fn begin_stream(&mut self) {
        self.model_stream_finished = false;
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::BlockItem;
    use proptest::prelude::*;
    use serde_json::json;

    const BLOCK: &str =
        r#"{"content":[{"type":"text","text":"a { b } c"},{"type":"tool_use","name":"list_files","input":{"path":"."}}]}"#;

    fn feed_all(tokens: &[&str]) -> (Vec<Fragment>, Option<String>) {
        let mut state = StreamState::default();
        let mut out = Vec::new();
        for token in tokens {
            for fragment in state.feed(token) {
                match (out.last_mut(), fragment) {
                    (Some(Fragment::Text(last)), Fragment::Text(text)) => last.push_str(&text),
                    (_, fragment) => out.push(fragment),
                }
            }
        }
        (out, state.flush())
    }

    #[test]
    fn test_plain_text_passes_through() {
        let (out, rest) = feed_all(&["Hello", ", ", "world\n"]);
        assert_eq!(out, vec![Fragment::Text("Hello, world\n".to_string())]);
        assert_eq!(rest, None);
    }

    #[test]
    fn test_text_before_brace_is_forwarded_immediately() {
        let mut state = StreamState::default();
        assert_eq!(
            state.feed("Let me look. {\"content\""),
            vec![Fragment::Text("Let me look. ".to_string())]
        );
        assert_eq!(state.feed(":[{\"type\":\"text\""), vec![]);
    }

    #[test]
    fn test_block_split_across_tokens() {
        let (a, b) = BLOCK.split_at(40);
        let (out, rest) = feed_all(&["Sure. ", a, b, " Done"]);
        assert_eq!(rest, None);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], Fragment::Text("Sure. ".to_string()));
        let Fragment::Block { block, raw } = &out[1] else {
            panic!("expected a block, got {:?}", out[1]);
        };
        assert_eq!(raw, BLOCK);
        assert_eq!(
            block.content[1],
            BlockItem::ToolUse {
                name: "list_files".to_string(),
                input: json!({"path": "."})
            }
        );
        assert_eq!(out[2], Fragment::Text(" Done".to_string()));
    }

    #[test]
    fn test_malformed_block_becomes_text_and_clears_buffer() {
        let (out, rest) = feed_all(&["use {x} here"]);
        assert_eq!(out, vec![Fragment::Text("use {x} here".to_string())]);
        assert_eq!(rest, None);
    }

    #[test]
    fn test_over_escaped_json_does_not_swallow_later_block() {
        let (out, rest) = feed_all(&[r#"{\"a\":1} ok "#, BLOCK, " more text"]);
        assert_eq!(rest, None);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], Fragment::Text(r#"{\"a\":1} ok "#.to_string()));
        assert!(matches!(&out[1], Fragment::Block { raw, .. } if raw == BLOCK));
        assert_eq!(out[2], Fragment::Text(" more text".to_string()));
    }

    #[test]
    fn test_unclosed_brace_is_flushed_at_end() {
        let (out, rest) = feed_all(&["a { b", " c"]);
        assert_eq!(out, vec![Fragment::Text("a ".to_string())]);
        assert_eq!(rest.as_deref(), Some("{ b c"));
    }

    #[test]
    fn test_whitespace_is_preserved() {
        let (out, _) = feed_all(&["  two  spaces\n\n", "\tand tab "]);
        assert_eq!(
            out,
            vec![Fragment::Text("  two  spaces\n\n\tand tab ".to_string())]
        );
    }

    #[test]
    fn test_raw_output_includes_block() {
        let mut state = StreamState::default();
        state.feed("Hi ");
        state.feed(BLOCK);
        assert_eq!(state.take_raw_output(), format!("Hi {BLOCK}"));
        assert_eq!(state.take_raw_output(), "");
    }

    fn arb_output() -> impl Strategy<Value = String> {
        let piece = prop_oneof![
            "[a-z .,\n]{0,12}",
            Just(BLOCK.to_string()),
            Just("{oops}".to_string()),
        ];
        proptest::collection::vec(piece, 0..6).prop_map(|pieces| pieces.concat())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(300))]

        // Character-at-a-time and whole-output feeding agree
        #[test]
        fn prop_feed_is_chunk_size_independent(output in arb_output(), split in 1usize..8) {
            let whole = feed_all(&[output.as_str()]);

            let chars: Vec<char> = output.chars().collect();
            let chunks: Vec<String> = chars.chunks(split).map(|c| c.iter().collect()).collect();
            let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
            let chunked = feed_all(&refs);

            prop_assert_eq!(whole, chunked);
        }
    }
}
