//! Database module for toolchat
//!
//! Provides persistence for sessions, rounds and turns.

mod schema;

pub use schema::*;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Response not found: {0}")]
    ResponseNotFound(String),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
    #[error("Database lock poisoned")]
    Poisoned,
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn lock(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.lock()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Rounds left streaming by a previous process can never finish
    pub fn reset_streaming_rounds(&self) -> DbResult<usize> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE turns SET status = 'error', updated_at = ?1
             WHERE status IN ('pending', 'streaming')",
            params![now],
        )?;
        let updated = conn.execute(
            "UPDATE rounds SET status = 'error' WHERE status = 'streaming'",
            [],
        )?;
        Ok(updated)
    }

    // ==================== Session Operations ====================

    /// Create the session if it does not exist yet, return it either way
    pub fn ensure_session(&self, id: &str, title: &str) -> DbResult<Session> {
        let conn = self.lock()?;
        let now = Utc::now();
        conn.execute(
            "INSERT OR IGNORE INTO sessions (id, title, created_at) VALUES (?1, ?2, ?3)",
            params![id, title, now.to_rfc3339()],
        )?;

        conn.query_row(
            "SELECT id, title, created_at FROM sessions WHERE id = ?1",
            params![id],
            |row| {
                Ok(Session {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    created_at: parse_datetime(&row.get::<_, String>(2)?),
                })
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DbError::SessionNotFound(id.to_string()),
            other => DbError::Sqlite(other),
        })
    }

    // ==================== Round Operations ====================

    /// Create the next round of a session
    pub fn create_round(
        &self,
        id: &str,
        session_id: &str,
        request_text: &str,
        response_id: &str,
    ) -> DbResult<Round> {
        let conn = self.lock()?;
        let now = Utc::now();

        let exists: Option<String> = conn
            .query_row(
                "SELECT id FROM sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(DbError::SessionNotFound(session_id.to_string()));
        }

        let next_index: i64 = conn.query_row(
            "SELECT COALESCE(MAX(round_index) + 1, 0) FROM rounds WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;

        conn.execute(
            "INSERT INTO rounds (id, session_id, round_index, request_text, response_id, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'streaming', ?6)",
            params![id, session_id, next_index, request_text, response_id, now.to_rfc3339()],
        )?;

        Ok(Round {
            id: id.to_string(),
            session_id: session_id.to_string(),
            index: next_index,
            request_text: request_text.to_string(),
            response_id: response_id.to_string(),
            status: ResponseStatus::Streaming,
            created_at: now,
            turns: Vec::new(),
        })
    }

    /// List rounds of a session in order, each with its turns
    pub fn list_rounds(&self, session_id: &str) -> DbResult<Vec<Round>> {
        let mut rounds = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(
                "SELECT id, session_id, round_index, request_text, response_id, status, created_at
                 FROM rounds WHERE session_id = ?1 ORDER BY round_index ASC",
            )?;

            let rows = stmt.query_map(params![session_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?;

            let mut rounds = Vec::new();
            for row in rows {
                let (id, session_id, index, request_text, response_id, status, created_at) = row?;
                rounds.push(Round {
                    id,
                    session_id,
                    index,
                    request_text,
                    response_id,
                    status: status.parse().map_err(DbError::Corrupt)?,
                    created_at: parse_datetime(&created_at),
                    turns: Vec::new(),
                });
            }
            rounds
        };

        for round in &mut rounds {
            round.turns = self.list_turns(&round.response_id)?;
        }
        Ok(rounds)
    }

    /// Mark a round's reply as finished
    pub fn finish_response(&self, response_id: &str, status: ResponseStatus) -> DbResult<()> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE rounds SET status = ?1 WHERE response_id = ?2",
            params![status.as_str(), response_id],
        )?;
        if updated == 0 {
            return Err(DbError::ResponseNotFound(response_id.to_string()));
        }
        Ok(())
    }

    /// Whether the reply has finished streaming
    pub fn get_streaming_status(&self, response_id: &str) -> DbResult<StreamingStatus> {
        let conn = self.lock()?;
        let (session_id, status): (String, String) = conn
            .query_row(
                "SELECT session_id, status FROM rounds WHERE response_id = ?1",
                params![response_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    DbError::ResponseNotFound(response_id.to_string())
                }
                other => DbError::Sqlite(other),
            })?;
        let status: ResponseStatus = status.parse().map_err(DbError::Corrupt)?;
        Ok(StreamingStatus {
            session_id,
            status,
            is_complete: status.is_finished(),
        })
    }

    // ==================== Turn Operations ====================

    /// Insert a turn, or replace the stored copy with the same id
    pub fn append_turn(&self, response_id: &str, turn: &Turn) -> DbResult<()> {
        let conn = self.lock()?;
        let payload = serde_json::to_string(&turn.payload)
            .map_err(|e| DbError::Corrupt(e.to_string()))?;
        conn.execute(
            "INSERT INTO turns (id, response_id, turn_index, kind, payload, status, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET payload = excluded.payload,
                                           status = excluded.status,
                                           updated_at = excluded.updated_at",
            params![
                turn.id,
                response_id,
                turn.index,
                turn.kind.as_str(),
                payload,
                turn.status.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Ordered turns of a reply
    pub fn list_turns(&self, response_id: &str) -> DbResult<Vec<Turn>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, response_id, turn_index, kind, payload, status
             FROM turns WHERE response_id = ?1 ORDER BY turn_index ASC",
        )?;

        let rows = stmt.query_map(params![response_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut turns = Vec::new();
        for row in rows {
            let (id, response_id, index, kind, payload, status) = row?;
            turns.push(Turn {
                id,
                response_id,
                index,
                kind: kind.parse().map_err(DbError::Corrupt)?,
                payload: serde_json::from_str(&payload)
                    .map_err(|e| DbError::Corrupt(e.to_string()))?,
                status: status.parse().map_err(DbError::Corrupt)?,
            });
        }
        Ok(turns)
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text_turn(id: &str, response_id: &str, index: i64, status: TurnStatus) -> Turn {
        Turn {
            id: id.to_string(),
            response_id: response_id.to_string(),
            index,
            kind: TurnKind::Text,
            payload: TurnPayload::Text(format!("turn {index}")),
            status,
        }
    }

    #[test]
    fn test_round_indexes_are_monotonic() {
        let db = Database::open_in_memory().unwrap();
        db.ensure_session("s1", "first").unwrap();

        let r0 = db.create_round("r0", "s1", "hello", "resp-0").unwrap();
        let r1 = db.create_round("r1", "s1", "again", "resp-1").unwrap();
        assert_eq!(r0.index, 0);
        assert_eq!(r1.index, 1);

        let rounds = db.list_rounds("s1").unwrap();
        assert_eq!(rounds.len(), 2);
        assert_eq!(rounds[0].request_text, "hello");
        assert_eq!(rounds[1].response_id, "resp-1");
    }

    #[test]
    fn test_ensure_session_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let a = db.ensure_session("s1", "first title").unwrap();
        let b = db.ensure_session("s1", "other title").unwrap();
        assert_eq!(a.title, "first title");
        assert_eq!(b.title, "first title");
    }

    #[test]
    fn test_create_round_requires_session() {
        let db = Database::open_in_memory().unwrap();
        let err = db.create_round("r0", "missing", "hi", "resp").unwrap_err();
        assert!(matches!(err, DbError::SessionNotFound(_)));
    }

    #[test]
    fn test_append_turn_upserts() {
        let db = Database::open_in_memory().unwrap();
        db.ensure_session("s1", "t").unwrap();
        db.create_round("r0", "s1", "hi", "resp").unwrap();

        db.append_turn("resp", &text_turn("t0", "resp", 0, TurnStatus::Streaming))
            .unwrap();
        db.append_turn("resp", &text_turn("t0", "resp", 0, TurnStatus::Completed))
            .unwrap();

        let turns = db.list_turns("resp").unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].status, TurnStatus::Completed);
    }

    #[test]
    fn test_turn_payloads_survive_storage() {
        let db = Database::open_in_memory().unwrap();
        db.ensure_session("s1", "t").unwrap();
        db.create_round("r0", "s1", "hi", "resp").unwrap();

        let call = Turn {
            id: "t0".to_string(),
            response_id: "resp".to_string(),
            index: 0,
            kind: TurnKind::ToolCall,
            payload: TurnPayload::ToolCall {
                server_id: "builtin".to_string(),
                tool_name: "list_files".to_string(),
                input: json!({"path": "."}),
            },
            status: TurnStatus::Completed,
        };
        let result = Turn {
            id: "t1".to_string(),
            response_id: "resp".to_string(),
            index: 1,
            kind: TurnKind::ToolResult,
            payload: TurnPayload::ToolResult(ToolOutcome::error("boom")),
            status: TurnStatus::Error,
        };
        db.append_turn("resp", &call).unwrap();
        db.append_turn("resp", &result).unwrap();

        let turns = db.list_turns("resp").unwrap();
        assert_eq!(turns, vec![call, result]);
    }

    #[test]
    fn test_streaming_status_follows_round() {
        let db = Database::open_in_memory().unwrap();
        db.ensure_session("s1", "t").unwrap();
        db.create_round("r0", "s1", "hi", "resp").unwrap();

        let status = db.get_streaming_status("resp").unwrap();
        assert_eq!(status.session_id, "s1");
        assert!(!status.is_complete);
        db.finish_response("resp", ResponseStatus::Error).unwrap();
        let status = db.get_streaming_status("resp").unwrap();
        assert_eq!(status.status, ResponseStatus::Error);
        db.finish_response("resp", ResponseStatus::Completed).unwrap();
        assert!(db.get_streaming_status("resp").unwrap().is_complete);
        assert!(matches!(
            db.get_streaming_status("nope"),
            Err(DbError::ResponseNotFound(_))
        ));
    }

    #[test]
    fn test_reset_streaming_rounds() {
        let db = Database::open_in_memory().unwrap();
        db.ensure_session("s1", "t").unwrap();
        db.create_round("r0", "s1", "hi", "resp").unwrap();
        db.append_turn("resp", &text_turn("t0", "resp", 0, TurnStatus::Streaming))
            .unwrap();

        assert_eq!(db.reset_streaming_rounds().unwrap(), 1);
        assert!(db.get_streaming_status("resp").unwrap().is_complete);
        assert_eq!(db.list_turns("resp").unwrap()[0].status, TurnStatus::Error);
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toolchat.db");
        {
            let db = Database::open(&path).unwrap();
            db.ensure_session("s1", "persisted").unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(db.ensure_session("s1", "x").unwrap().title, "persisted");
    }
}
