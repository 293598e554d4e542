//! Tool servers and the tools hosted in-process
//!
//! The coordinator never runs tools directly. It resolves a tool name to a
//! [`ToolServer`] through the [`ToolServerRegistry`] and calls it there.
//! Servers are either remote (JSON-RPC over HTTP) or the builtin server
//! hosting the local [`Tool`] implementations.

mod builtin;
mod http_server;
mod list_files;
mod read_file;
mod registry;
mod think;

pub use builtin::BuiltinToolServer;
pub use http_server::HttpToolServer;
pub use list_files::ListFilesTool;
pub use read_file::ReadFileTool;
pub use registry::ToolServerRegistry;
pub use think::ThinkTool;

use crate::llm::ToolDefinition;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Errors a tool server can report
#[derive(Debug, Error)]
pub enum ToolServerError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("{0}")]
    Failed(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("invalid response: {0}")]
    Protocol(String),
}

/// A source of tools: lists them and invokes them by name
#[async_trait]
pub trait ToolServer: Send + Sync {
    /// Stable identifier recorded on `tool_call` turns
    fn id(&self) -> &str;

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolServerError>;

    async fn call_tool(&self, name: &str, input: Value) -> Result<Value, ToolServerError>;
}

/// Result from tool execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
}

impl ToolOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: message.into(),
        }
    }
}

/// All context needed for a local tool invocation.
///
/// Tools are stateless and derive everything from this struct.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Root directory file tools are confined to
    pub working_dir: PathBuf,
}

impl ToolContext {
    pub fn new(working_dir: PathBuf) -> Self {
        Self { working_dir }
    }

    /// Resolve a user-supplied path inside the working directory.
    ///
    /// Absolute paths and `..` components that would leave the working
    /// directory are rejected.
    pub fn resolve_path(&self, path: &str) -> Result<PathBuf, String> {
        let relative = Path::new(path);
        if relative.is_absolute() {
            return Err(format!("path must be relative to the workspace: {path}"));
        }

        let mut depth = 0usize;
        for component in relative.components() {
            match component {
                Component::Normal(_) => depth += 1,
                Component::CurDir => {}
                Component::ParentDir => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or_else(|| format!("path escapes the workspace: {path}"))?;
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(format!("path must be relative to the workspace: {path}"));
                }
            }
        }
        Ok(self.working_dir.join(relative))
    }
}

/// Trait for tools hosted by the builtin server
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name
    fn name(&self) -> &str;

    /// Tool description for LLM
    fn description(&self) -> String;

    /// JSON schema for tool input
    fn input_schema(&self) -> Value;

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput;
}
