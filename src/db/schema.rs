//! Database schema and types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// SQL schema for initialization
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rounds (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    round_index INTEGER NOT NULL,
    request_text TEXT NOT NULL,
    response_id TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL DEFAULT 'streaming',
    created_at TEXT NOT NULL,

    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_rounds_session ON rounds(session_id, round_index);

CREATE TABLE IF NOT EXISTS turns (
    id TEXT PRIMARY KEY,
    response_id TEXT NOT NULL,
    turn_index INTEGER NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    FOREIGN KEY (response_id) REFERENCES rounds(response_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_turns_response ON turns(response_id, turn_index);
";

/// Durable conversation container
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// One user request and the model's reply
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Round {
    pub id: String,
    pub session_id: String,
    pub index: i64,
    pub request_text: String,
    pub response_id: String,
    pub status: ResponseStatus,
    pub created_at: DateTime<Utc>,
    /// Ordered turns of the reply (populated by `list_rounds`)
    #[serde(default)]
    pub turns: Vec<Turn>,
}

/// Lifecycle of a round's reply
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Streaming,
    Completed,
    Error,
}

impl ResponseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseStatus::Streaming => "streaming",
            ResponseStatus::Completed => "completed",
            ResponseStatus::Error => "error",
        }
    }

    pub fn is_finished(self) -> bool {
        !matches!(self, ResponseStatus::Streaming)
    }
}

impl std::str::FromStr for ResponseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "streaming" => Ok(ResponseStatus::Streaming),
            "completed" => Ok(ResponseStatus::Completed),
            "error" => Ok(ResponseStatus::Error),
            _ => Err(format!("Unknown response status: {s}")),
        }
    }
}

/// Result of `get_streaming_status`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamingStatus {
    pub session_id: String,
    pub status: ResponseStatus,
    pub is_complete: bool,
}

/// Kind of content a turn carries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    Text,
    ToolCall,
    ToolResult,
}

impl TurnKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnKind::Text => "text",
            TurnKind::ToolCall => "tool_call",
            TurnKind::ToolResult => "tool_result",
        }
    }
}

impl fmt::Display for TurnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TurnKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(TurnKind::Text),
            "tool_call" => Ok(TurnKind::ToolCall),
            "tool_result" => Ok(TurnKind::ToolResult),
            _ => Err(format!("Unknown turn kind: {s}")),
        }
    }
}

/// Turn status. Ordered: a turn only ever moves forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Pending,
    Streaming,
    Completed,
    Error,
}

impl TurnStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnStatus::Pending => "pending",
            TurnStatus::Streaming => "streaming",
            TurnStatus::Completed => "completed",
            TurnStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TurnStatus::Completed | TurnStatus::Error)
    }

    /// Whether moving from `self` to `next` respects monotonicity.
    ///
    /// Staying in a non-terminal status is allowed (streaming text grows),
    /// terminal statuses are final.
    pub fn can_advance_to(self, next: TurnStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next >= self
    }
}

impl std::str::FromStr for TurnStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TurnStatus::Pending),
            "streaming" => Ok(TurnStatus::Streaming),
            "completed" => Ok(TurnStatus::Completed),
            "error" => Ok(TurnStatus::Error),
            _ => Err(format!("Unknown turn status: {s}")),
        }
    }
}

/// Turn content, shaped by kind
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TurnPayload {
    ToolCall {
        server_id: String,
        tool_name: String,
        input: Value,
    },
    ToolResult(ToolOutcome),
    Text(String),
}

/// Outcome of a tool invocation as seen by the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    Result(Value),
    Error(String),
}

impl ToolOutcome {
    pub fn error(message: impl Into<String>) -> Self {
        ToolOutcome::Error(message.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ToolOutcome::Error(_))
    }
}

/// Atomic unit of a reply
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub id: String,
    pub response_id: String,
    pub index: i64,
    pub kind: TurnKind,
    pub payload: TurnPayload,
    pub status: TurnStatus,
}

impl Turn {
    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            TurnPayload::Text(text) => Some(text),
            _ => None,
        }
    }
}
