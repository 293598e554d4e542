//! Turn ledger for one response
//!
//! Assigns ids and contiguous indexes and enforces the lifecycle of each
//! turn kind. Every mutating call returns the turn as it now stands so the
//! coordinator can publish and persist it.

use crate::db::{ToolOutcome, Turn, TurnKind, TurnPayload, TurnStatus};
use serde_json::Value;

pub struct TurnLedger {
    response_id: String,
    turns: Vec<Turn>,
    open_text: Option<usize>,
    open_tool_call: Option<usize>,
}

impl TurnLedger {
    pub fn new(response_id: impl Into<String>) -> Self {
        Self {
            response_id: response_id.into(),
            turns: Vec::new(),
            open_text: None,
            open_tool_call: None,
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    fn push(&mut self, kind: TurnKind, payload: TurnPayload, status: TurnStatus) -> usize {
        let index = self.turns.len();
        self.turns.push(Turn {
            id: uuid::Uuid::new_v4().to_string(),
            response_id: self.response_id.clone(),
            index: i64::try_from(index).unwrap_or(i64::MAX),
            kind,
            payload,
            status,
        });
        index
    }

    /// Append streamed text, opening a text turn if none is open.
    ///
    /// The flag is true when the turn was just created.
    pub fn append_text(&mut self, text: &str) -> (Turn, bool) {
        if let Some(index) = self.open_text {
            let turn = &mut self.turns[index];
            if let TurnPayload::Text(existing) = &mut turn.payload {
                existing.push_str(text);
            }
            return (turn.clone(), false);
        }
        let index = self.push(
            TurnKind::Text,
            TurnPayload::Text(text.to_string()),
            TurnStatus::Streaming,
        );
        self.open_text = Some(index);
        (self.turns[index].clone(), true)
    }

    /// Complete the open text turn, if any
    pub fn close_text(&mut self) -> Option<Turn> {
        let index = self.open_text.take()?;
        let turn = &mut self.turns[index];
        turn.status = TurnStatus::Completed;
        Some(turn.clone())
    }

    /// Open a `tool_call` turn; it streams until the result arrives
    pub fn open_tool_call(&mut self, server_id: &str, tool_name: &str, input: Value) -> Turn {
        let index = self.push(
            TurnKind::ToolCall,
            TurnPayload::ToolCall {
                server_id: server_id.to_string(),
                tool_name: tool_name.to_string(),
                input,
            },
            TurnStatus::Streaming,
        );
        self.open_tool_call = Some(index);
        self.turns[index].clone()
    }

    /// Settle the open `tool_call` turn and record the result turn.
    ///
    /// Returns the settled call (if one was open) and the new result turn,
    /// which is `error` for an error outcome.
    pub fn record_tool_result(&mut self, outcome: ToolOutcome) -> (Option<Turn>, Turn) {
        let call = self.open_tool_call.take().map(|index| {
            let turn = &mut self.turns[index];
            turn.status = TurnStatus::Completed;
            turn.clone()
        });
        let status = if outcome.is_error() {
            TurnStatus::Error
        } else {
            TurnStatus::Completed
        };
        let index = self.push(TurnKind::ToolResult, TurnPayload::ToolResult(outcome), status);
        (call, self.turns[index].clone())
    }

    /// Mark every unsettled turn `error`
    pub fn fail_open(&mut self) -> Vec<Turn> {
        self.open_text = None;
        self.open_tool_call = None;
        self.turns
            .iter_mut()
            .filter(|t| !t.status.is_terminal())
            .map(|t| {
                t.status = TurnStatus::Error;
                t.clone()
            })
            .collect()
    }
}
