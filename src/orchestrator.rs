//! Tool invocation orchestration
//!
//! Serializes tool calls within a generation: at most one call is
//! outstanding, its outcome is folded into the conversation history and the
//! coordinator then resumes the model.

use crate::db::{Round, ToolOutcome, TurnPayload};
use crate::llm::{LlmMessage, MessageRole};
use crate::runtime::ToolResolver;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum OrchestratorError {
    #[error("tool call `{requested}` issued while `{pending}` is still outstanding")]
    ProtocolViolation { pending: String, requested: String },
    #[error("no tool call is pending")]
    NothingPending,
}

/// A tool call that has been accepted and awaits its outcome
#[derive(Debug, Clone, PartialEq)]
pub struct PendingToolCall {
    pub name: String,
    pub input: Value,
    /// Server that owns the tool, if any does
    pub server_id: Option<String>,
}

/// What the coordinator does after a tool outcome is folded in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// Open a new model stream with the extended history
    Resume,
}

pub struct ToolOrchestrator {
    resolver: Arc<dyn ToolResolver>,
    timeout: Duration,
    pending: Option<PendingToolCall>,
}

impl ToolOrchestrator {
    pub fn new(resolver: Arc<dyn ToolResolver>, timeout: Duration) -> Self {
        Self {
            resolver,
            timeout,
            pending: None,
        }
    }

    pub fn pending(&self) -> Option<&PendingToolCall> {
        self.pending.as_ref()
    }

    /// Accept a tool call.
    ///
    /// Fails with [`OrchestratorError::ProtocolViolation`] while another call
    /// is outstanding.
    pub fn begin(
        &mut self,
        name: impl Into<String>,
        input: Value,
    ) -> Result<PendingToolCall, OrchestratorError> {
        let name = name.into();
        if let Some(pending) = &self.pending {
            return Err(OrchestratorError::ProtocolViolation {
                pending: pending.name.clone(),
                requested: name,
            });
        }

        let server_id = self.resolver.resolve(&name).map(|r| r.server_id);
        let call = PendingToolCall {
            name,
            input,
            server_id,
        };
        self.pending = Some(call.clone());
        Ok(call)
    }

    /// Invocation future for `call`, independent of `self` so it can be spawned
    pub fn invoke(&self, call: &PendingToolCall) -> impl Future<Output = ToolOutcome> + Send + 'static {
        invoke_tool(
            self.resolver.clone(),
            call.name.clone(),
            call.input.clone(),
            self.timeout,
        )
    }

    /// Fold the outcome into history and clear the pending slot.
    ///
    /// The assistant entry carries the raw model output including the block,
    /// the user entry carries the serialized outcome.
    pub fn complete(
        &mut self,
        outcome: &ToolOutcome,
        raw_assistant_output: &str,
        history: &mut ConversationHistory,
    ) -> Result<Continuation, OrchestratorError> {
        let call = self.pending.take().ok_or(OrchestratorError::NothingPending)?;
        history.push(LlmMessage::assistant(raw_assistant_output));
        history.push(LlmMessage::user(tool_result_message(&call.name, outcome)));
        Ok(Continuation::Resume)
    }
}

/// Invoke a tool through the resolver.
///
/// Never fails: a missing server, a server error and a timeout all become
/// [`ToolOutcome::Error`].
pub async fn invoke_tool(
    resolver: Arc<dyn ToolResolver>,
    name: String,
    input: Value,
    timeout: Duration,
) -> ToolOutcome {
    let Some(resolved) = resolver.resolve(&name) else {
        tracing::warn!(tool = %name, "No server for tool");
        return ToolOutcome::error(format!("no server for tool {name}"));
    };

    let start = Instant::now();
    let result = tokio::time::timeout(timeout, resolved.server.call_tool(&name, input)).await;
    let duration_ms = start.elapsed().as_millis();

    match result {
        Ok(Ok(value)) => {
            tracing::info!(tool = %name, server = %resolved.server_id, duration_ms, "Tool completed");
            ToolOutcome::Result(value)
        }
        Ok(Err(e)) => {
            tracing::warn!(tool = %name, server = %resolved.server_id, duration_ms, error = %e, "Tool failed");
            ToolOutcome::error(e.to_string())
        }
        Err(_) => {
            tracing::warn!(tool = %name, server = %resolved.server_id, duration_ms, "Tool timed out");
            ToolOutcome::error(format!(
                "tool {name} timed out after {}ms",
                timeout.as_millis()
            ))
        }
    }
}

/// Serialized outcome as the model sees it
pub fn tool_result_message(tool_name: &str, outcome: &ToolOutcome) -> String {
    let body = match outcome {
        ToolOutcome::Result(value) => {
            json!({"type": "tool_result", "name": tool_name, "result": value})
        }
        ToolOutcome::Error(message) => {
            json!({"type": "tool_result", "name": tool_name, "error": message})
        }
    };
    body.to_string()
}

/// Re-create the block a `tool_call` turn was parsed from
fn tool_use_block(tool_name: &str, input: &Value) -> String {
    json!({"content": [{"type": "tool_use", "name": tool_name, "input": input}]}).to_string()
}

/// Message history sent to the model.
///
/// Consecutive entries with the same role are merged so the history always
/// alternates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationHistory {
    messages: Vec<LlmMessage>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay prior rounds of a session
    pub fn from_rounds(rounds: &[Round]) -> Self {
        let mut history = Self::new();
        for round in rounds {
            history.push(LlmMessage::user(round.request_text.clone()));

            let mut assistant = String::new();
            let mut last_tool = String::new();
            for turn in &round.turns {
                match &turn.payload {
                    TurnPayload::Text(text) => assistant.push_str(text),
                    TurnPayload::ToolCall {
                        tool_name, input, ..
                    } => {
                        assistant.push_str(&tool_use_block(tool_name, input));
                        last_tool.clone_from(tool_name);
                    }
                    TurnPayload::ToolResult(outcome) => {
                        if !assistant.is_empty() {
                            history.push(LlmMessage::assistant(std::mem::take(&mut assistant)));
                        }
                        history.push(LlmMessage::user(tool_result_message(&last_tool, outcome)));
                    }
                }
            }
            if !assistant.is_empty() {
                history.push(LlmMessage::assistant(assistant));
            }
        }
        history
    }

    pub fn push(&mut self, message: LlmMessage) {
        if message.content.is_empty() {
            return;
        }
        match self.messages.last_mut() {
            Some(last) if last.role == message.role => {
                last.content.push_str("\n\n");
                last.content.push_str(&message.content);
            }
            _ => self.messages.push(message),
        }
    }

    pub fn messages(&self) -> &[LlmMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether the model is expected to speak next
    #[allow(dead_code)] // Used in tests
    pub fn ends_with_user(&self) -> bool {
        self.messages
            .last()
            .is_some_and(|m| m.role == MessageRole::User)
    }
}
