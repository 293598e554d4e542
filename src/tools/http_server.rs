//! Remote tool server speaking JSON-RPC over HTTP
//!
//! Requests follow the MCP method names (`tools/list`, `tools/call`). A call
//! result carries a `content` array of text parts and an `isError` flag.

use super::{ToolServer, ToolServerError};
use crate::llm::ToolDefinition;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub struct HttpToolServer {
    id: String,
    url: String,
    client: Client,
    next_request_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ListToolsResult {
    tools: Vec<ToolDefinition>,
}

#[derive(Debug, Deserialize)]
struct CallToolResult {
    #[serde(default)]
    content: Vec<ContentPart>,
    #[serde(default, rename = "isError")]
    is_error: bool,
    #[serde(default, rename = "structuredContent")]
    structured_content: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ContentPart {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

impl HttpToolServer {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Result<Self, ToolServerError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ToolServerError::Transport(e.to_string()))?;
        Ok(Self {
            id: id.into(),
            url: url.into(),
            client,
            next_request_id: AtomicU64::new(1),
        })
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, ToolServerError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": request_id,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ToolServerError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ToolServerError::Transport(format!("HTTP {status}: {text}")));
        }

        let rpc: RpcResponse = response
            .json()
            .await
            .map_err(|e| ToolServerError::Protocol(e.to_string()))?;
        decode_rpc(rpc)
    }
}

fn decode_rpc(rpc: RpcResponse) -> Result<Value, ToolServerError> {
    if let Some(error) = rpc.error {
        return Err(ToolServerError::Rpc {
            code: error.code,
            message: error.message,
        });
    }
    rpc.result
        .ok_or_else(|| ToolServerError::Protocol("response has neither result nor error".into()))
}

/// Fold a `tools/call` result into the value recorded on the turn
fn decode_call_result(result: Value) -> Result<Value, ToolServerError> {
    let result: CallToolResult =
        serde_json::from_value(result).map_err(|e| ToolServerError::Protocol(e.to_string()))?;

    let text = result
        .content
        .into_iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(text),
            ContentPart::Other => None,
        })
        .collect::<Vec<_>>()
        .join("\n");

    if result.is_error {
        return Err(ToolServerError::Failed(text));
    }
    Ok(result.structured_content.unwrap_or(Value::String(text)))
}

#[async_trait]
impl ToolServer for HttpToolServer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolServerError> {
        let result = self.rpc("tools/list", json!({})).await?;
        let list: ListToolsResult =
            serde_json::from_value(result).map_err(|e| ToolServerError::Protocol(e.to_string()))?;
        Ok(list.tools)
    }

    async fn call_tool(&self, name: &str, input: Value) -> Result<Value, ToolServerError> {
        let result = self
            .rpc("tools/call", json!({ "name": name, "arguments": input }))
            .await?;
        decode_call_result(result)
    }
}
