//! Structured block extraction
//!
//! The model is prompted to embed tool requests in its prose as a single JSON
//! object:
//!
//! ```text
//! {"content": [{"type": "text", "text": "..."},
//!              {"type": "tool_use", "name": "list_files", "input": {...}}]}
//! ```
//!
//! [`find_block_end`] locates the end of such an object inside accumulating
//! text without parsing it, so the caller can keep buffering until the block
//! is complete. [`parse_block`] then validates the finished slice.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Parsed structured block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredBlock {
    pub content: Vec<BlockItem>,
}

/// One entry of a block's `content` array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockItem {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default = "empty_input")]
        input: Value,
    },
}

fn empty_input() -> Value {
    Value::Object(serde_json::Map::new())
}

impl StructuredBlock {
    /// Number of tool invocations the block requests
    #[allow(dead_code)] // Used in tests
    pub fn tool_use_count(&self) -> usize {
        self.content
            .iter()
            .filter(|item| matches!(item, BlockItem::ToolUse { .. }))
            .count()
    }
}

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("block is not valid JSON: {0}")]
    Invalid(#[from] serde_json::Error),
    #[error("block has an empty content array")]
    Empty,
}

/// Find the end of the structured block at the start of `text`.
///
/// Returns the exclusive byte offset just past the closing brace once the
/// outermost object is balanced, or `None` while the block is incomplete or
/// when the leading non-whitespace character is not `{`. Braces inside string
/// literals are ignored. A backslash suppresses the next character anywhere,
/// so over-escaped output like `{\"a\":1}` still closes.
pub fn find_block_end(text: &str) -> Option<usize> {
    let trimmed = text.trim_start();
    if !trimmed.starts_with('{') {
        return None;
    }
    let offset = text.len() - trimmed.len();

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in trimmed.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(offset + i + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a complete block slice
pub fn parse_block(text: &str) -> Result<StructuredBlock, BlockError> {
    let block: StructuredBlock = serde_json::from_str(text.trim())?;
    if block.content.is_empty() {
        return Err(BlockError::Empty);
    }
    Ok(block)
}
