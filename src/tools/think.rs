//! Scratchpad tool
//!
//! The model pauses its reply to write down reasoning. Tool results are the
//! only thing carried into the continuation request besides the raw output,
//! so any planned steps are echoed back as a numbered list.

use super::{Tool, ToolContext, ToolOutput};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt::Write as _;

pub struct ThinkTool;

#[derive(Debug, Deserialize)]
struct ScratchpadEntry {
    thoughts: String,
    #[serde(default)]
    steps: Vec<String>,
}

impl ScratchpadEntry {
    fn acknowledgement(&self) -> String {
        let steps: Vec<&str> = self
            .steps
            .iter()
            .map(String::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if steps.is_empty() {
            return "noted".to_string();
        }
        let mut out = format!("noted, plan of {} steps:", steps.len());
        for (i, step) in steps.iter().enumerate() {
            let _ = write!(out, "\n{}. {step}", i + 1);
        }
        out
    }
}

#[async_trait]
impl Tool for ThinkTool {
    fn name(&self) -> &'static str {
        "think"
    }

    fn description(&self) -> String {
        "Pause the reply to reason privately. Optional steps are echoed back as a numbered plan you can follow after the call.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["thoughts"],
            "properties": {
                "thoughts": { "type": "string" },
                "steps": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Planned next steps, in order"
                }
            }
        })
    }

    async fn run(&self, input: Value, _ctx: ToolContext) -> ToolOutput {
        let entry: ScratchpadEntry = match serde_json::from_value(input) {
            Ok(e) => e,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };
        if entry.thoughts.trim().is_empty() {
            return ToolOutput::error("thoughts must not be blank");
        }
        tracing::debug!(chars = entry.thoughts.len(), steps = entry.steps.len(), "Scratchpad entry");
        ToolOutput::success(entry.acknowledgement())
    }
}
