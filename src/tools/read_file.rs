//! Read file tool - returns text file contents from the workspace

use super::{Tool, ToolContext, ToolOutput};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::fs;

/// Maximum bytes returned to the model (256KB)
const MAX_READ_BYTES: usize = 256 * 1024;

pub struct ReadFileTool;

#[derive(Debug, Deserialize)]
struct ReadFileInput {
    path: String,
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &'static str {
        "read_file"
    }

    fn description(&self) -> String {
        "Read a UTF-8 text file from the workspace. Large files are truncated.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["path"],
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to the workspace root"
                }
            }
        })
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: ReadFileInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };
        let path = match ctx.resolve_path(&input.path) {
            Ok(p) => p,
            Err(e) => return ToolOutput::error(e),
        };

        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return ToolOutput::error(format!("Not a file: {}", input.path)),
            Err(e) => return ToolOutput::error(format!("Cannot read {}: {e}", input.path)),
        }

        let bytes = match fs::read(&path).await {
            Ok(b) => b,
            Err(e) => return ToolOutput::error(format!("Cannot read {}: {e}", input.path)),
        };

        let truncated = bytes.len() > MAX_READ_BYTES;
        let slice = &bytes[..bytes.len().min(MAX_READ_BYTES)];
        let mut text = match std::str::from_utf8(slice) {
            Ok(s) => s.to_string(),
            // A cut multi-byte character at the boundary is not a binary file
            Err(e) if truncated && e.error_len().is_none() => {
                String::from_utf8_lossy(&slice[..e.valid_up_to()]).into_owned()
            }
            Err(_) => return ToolOutput::error(format!("Not a text file: {}", input.path)),
        };
        if truncated {
            text.push_str(&format!("\n... (truncated, {} bytes total)", bytes.len()));
        }
        ToolOutput::success(text)
    }
}
