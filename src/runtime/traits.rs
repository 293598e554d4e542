//! Trait abstractions for runtime I/O
//!
//! These traits enable testing the coordinator with mock implementations.

use crate::db::{Database, ResponseStatus, Round, Session, StreamingStatus, Turn};
use crate::llm::ToolDefinition;
use crate::tools::ToolServer;
use async_trait::async_trait;
use std::sync::Arc;

/// Storage for sessions, rounds and turns
#[async_trait]
pub trait TurnStore: Send + Sync {
    /// Create the session if it does not exist yet
    async fn ensure_session(&self, session_id: &str, title: &str) -> Result<Session, String>;

    /// Create the next round of a session with fresh round and response ids
    async fn create_round(&self, session_id: &str, request_text: &str) -> Result<Round, String>;

    /// Insert or update a turn by id
    async fn append_turn(&self, turn: &Turn) -> Result<(), String>;

    /// Rounds of a session in index order, with their turns
    async fn list_rounds(&self, session_id: &str) -> Result<Vec<Round>, String>;

    /// Turns of a response in index order
    async fn list_turns(&self, response_id: &str) -> Result<Vec<Turn>, String>;

    async fn get_streaming_status(&self, response_id: &str) -> Result<StreamingStatus, String>;

    /// Mark the round owning `response_id` as finished
    async fn finish_response(&self, response_id: &str, status: ResponseStatus)
        -> Result<(), String>;
}

/// A tool name resolved to the server that hosts it
#[derive(Clone)]
pub struct ResolvedTool {
    pub server_id: String,
    pub server: Arc<dyn ToolServer>,
}

/// Maps tool names to servers; read-only once built
pub trait ToolResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<ResolvedTool>;

    /// Every tool the model may call
    fn list_tools(&self) -> Vec<ToolDefinition>;
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: TurnStore + ?Sized> TurnStore for Arc<T> {
    async fn ensure_session(&self, session_id: &str, title: &str) -> Result<Session, String> {
        (**self).ensure_session(session_id, title).await
    }

    async fn create_round(&self, session_id: &str, request_text: &str) -> Result<Round, String> {
        (**self).create_round(session_id, request_text).await
    }

    async fn append_turn(&self, turn: &Turn) -> Result<(), String> {
        (**self).append_turn(turn).await
    }

    async fn list_rounds(&self, session_id: &str) -> Result<Vec<Round>, String> {
        (**self).list_rounds(session_id).await
    }

    async fn list_turns(&self, response_id: &str) -> Result<Vec<Turn>, String> {
        (**self).list_turns(response_id).await
    }

    async fn get_streaming_status(&self, response_id: &str) -> Result<StreamingStatus, String> {
        (**self).get_streaming_status(response_id).await
    }

    async fn finish_response(
        &self,
        response_id: &str,
        status: ResponseStatus,
    ) -> Result<(), String> {
        (**self).finish_response(response_id, status).await
    }
}

impl<T: ToolResolver + ?Sized> ToolResolver for Arc<T> {
    fn resolve(&self, name: &str) -> Option<ResolvedTool> {
        (**self).resolve(name)
    }

    fn list_tools(&self) -> Vec<ToolDefinition> {
        (**self).list_tools()
    }
}

// ============================================================================
// Production Adapters
// ============================================================================

/// Adapter to use Database as a `TurnStore`
#[derive(Clone)]
pub struct DatabaseStorage {
    db: Database,
}

impl DatabaseStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TurnStore for DatabaseStorage {
    async fn ensure_session(&self, session_id: &str, title: &str) -> Result<Session, String> {
        self.db
            .ensure_session(session_id, title)
            .map_err(|e| e.to_string())
    }

    async fn create_round(&self, session_id: &str, request_text: &str) -> Result<Round, String> {
        let round_id = uuid::Uuid::new_v4().to_string();
        let response_id = uuid::Uuid::new_v4().to_string();
        self.db
            .create_round(&round_id, session_id, request_text, &response_id)
            .map_err(|e| e.to_string())
    }

    async fn append_turn(&self, turn: &Turn) -> Result<(), String> {
        self.db
            .append_turn(&turn.response_id, turn)
            .map_err(|e| e.to_string())
    }

    async fn list_rounds(&self, session_id: &str) -> Result<Vec<Round>, String> {
        self.db.list_rounds(session_id).map_err(|e| e.to_string())
    }

    async fn list_turns(&self, response_id: &str) -> Result<Vec<Turn>, String> {
        self.db.list_turns(response_id).map_err(|e| e.to_string())
    }

    async fn get_streaming_status(&self, response_id: &str) -> Result<StreamingStatus, String> {
        self.db
            .get_streaming_status(response_id)
            .map_err(|e| e.to_string())
    }

    async fn finish_response(
        &self,
        response_id: &str,
        status: ResponseStatus,
    ) -> Result<(), String> {
        self.db
            .finish_response(response_id, status)
            .map_err(|e| e.to_string())
    }
}
