//! API request and response types

use crate::db::Round;
use crate::llm::ToolDefinition;
use crate::transport::FeedMode;
use serde::{Deserialize, Serialize};

/// Request to send a chat message
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    /// Omitted to start a new session
    #[serde(default)]
    pub session_id: Option<String>,
    pub message: String,
}

/// Ids of the generation a chat message started
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub round_id: String,
    pub response_id: String,
}

/// Query of the SSE feed endpoint
#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub transport: Option<FeedMode>,
}

/// Response for cancel action
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize)]
pub struct RoundsResponse {
    pub rounds: Vec<Round>,
}

#[derive(Debug, Serialize)]
pub struct ToolsResponse {
    pub tools: Vec<ToolDefinition>,
}

/// Message from a WebSocket client
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Chat { message: String },
    Cancel,
}

/// Socket-level message; turn events are sent as they are
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Accepted {
        session_id: String,
        round_id: String,
        response_id: String,
    },
    Rejected {
        message: String,
    },
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}
