//! In-process tool server hosting the local tools

use super::{ListFilesTool, ReadFileTool, ThinkTool, Tool, ToolContext, ToolServer, ToolServerError};
use crate::llm::ToolDefinition;
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

pub const BUILTIN_SERVER_ID: &str = "builtin";

/// Tool server backed by [`Tool`] implementations
pub struct BuiltinToolServer {
    tools: Vec<Arc<dyn Tool>>,
    working_dir: PathBuf,
}

impl BuiltinToolServer {
    /// Standard local tool set confined to `working_dir`
    pub fn standard(working_dir: PathBuf) -> Self {
        Self::with_tools(
            working_dir,
            vec![
                Arc::new(ListFilesTool),
                Arc::new(ReadFileTool),
                Arc::new(ThinkTool),
            ],
        )
    }

    pub fn with_tools(working_dir: PathBuf, tools: Vec<Arc<dyn Tool>>) -> Self {
        Self { tools, working_dir }
    }
}

#[async_trait]
impl ToolServer for BuiltinToolServer {
    fn id(&self) -> &str {
        BUILTIN_SERVER_ID
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolServerError> {
        Ok(self
            .tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description(),
                input_schema: t.input_schema(),
            })
            .collect())
    }

    async fn call_tool(&self, name: &str, input: Value) -> Result<Value, ToolServerError> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| ToolServerError::UnknownTool(name.to_string()))?;

        let output = tool
            .run(input, ToolContext::new(self.working_dir.clone()))
            .await;
        if output.success {
            Ok(Value::String(output.output))
        } else {
            Err(ToolServerError::Failed(output.output))
        }
    }
}
