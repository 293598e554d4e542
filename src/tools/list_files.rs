//! List files tool - directory listing inside the workspace

use super::{Tool, ToolContext, ToolOutput};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::fs;

/// Entries beyond this are summarized
const MAX_ENTRIES: usize = 500;

pub struct ListFilesTool;

#[derive(Debug, Deserialize)]
struct ListFilesInput {
    #[serde(default = "default_path")]
    path: String,
}

fn default_path() -> String {
    ".".to_string()
}

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &'static str {
        "list_files"
    }

    fn description(&self) -> String {
        "List the entries of a directory in the workspace. Directories are suffixed with '/'."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory relative to the workspace root (default: '.')"
                }
            }
        })
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: ListFilesInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };
        let dir = match ctx.resolve_path(&input.path) {
            Ok(p) => p,
            Err(e) => return ToolOutput::error(e),
        };

        let mut reader = match fs::read_dir(&dir).await {
            Ok(r) => r,
            Err(e) => return ToolOutput::error(format!("Cannot list {}: {e}", input.path)),
        };

        let mut names = Vec::new();
        loop {
            match reader.next_entry().await {
                Ok(Some(entry)) => {
                    let mut name = entry.file_name().to_string_lossy().into_owned();
                    if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                        name.push('/');
                    }
                    names.push(name);
                }
                Ok(None) => break,
                Err(e) => return ToolOutput::error(format!("Cannot list {}: {e}", input.path)),
            }
        }
        names.sort();

        if names.is_empty() {
            return ToolOutput::success("(empty directory)");
        }
        let total = names.len();
        let mut output = names
            .into_iter()
            .take(MAX_ENTRIES)
            .collect::<Vec<_>>()
            .join("\n");
        if total > MAX_ENTRIES {
            output.push_str(&format!("\n... and {} more", total - MAX_ENTRIES));
        }
        ToolOutput::success(output)
    }
}
