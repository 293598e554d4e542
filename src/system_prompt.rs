//! System prompt construction
//!
//! Tells the model how to request tools through an embedded block and lists
//! the tools it may call.

use crate::llm::ToolDefinition;
use std::fmt::Write;

/// Base system prompt establishing the assistant's role
const BASE_PROMPT: &str = r"You are a helpful assistant. Be concise.";

/// Wire format of the embedded tool block
const TOOL_PROTOCOL: &str = r#"To use a tool, write exactly one JSON object on its own, shaped like this:

{"content": [{"type": "text", "text": "Checking the workspace."}, {"type": "tool_use", "name": "list_files", "input": {"path": "."}}]}

Rules:
- Request at most one tool per object, then stop and wait. The result arrives in the next user message as {"type": "tool_result", "name": ..., "result": ...} or with "error" instead of "result".
- Escape newlines inside strings as \n.
- Do not write a literal "{" outside a tool object unless it is balanced."#;

/// Build the system prompt for the given tools
pub fn build_system_prompt(tools: &[ToolDefinition]) -> String {
    let mut prompt = String::from(BASE_PROMPT);
    if tools.is_empty() {
        return prompt;
    }

    prompt.push_str("\n\n");
    prompt.push_str(TOOL_PROTOCOL);
    prompt.push_str("\n\nAvailable tools:\n");
    for tool in tools {
        let _ = writeln!(prompt, "\n## {}\n{}", tool.name, tool.description);
        let _ = writeln!(prompt, "Input schema: {}", tool.input_schema);
    }
    prompt
}
