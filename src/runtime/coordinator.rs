//! Composition root of one generation
//!
//! Owns the select loop that converges the model token stream, tool
//! outcomes, turn tracking, the arbiter deadlines and cancellation. All state
//! changes go through the chat state machine; turns go to the publisher on
//! every change and to storage on creation and settlement.

use super::arbiter::{CompletionArbiter, Verdict};
use super::stream_state::{Fragment, StreamState};
use super::traits::{ToolResolver, TurnStore};
use super::turns::TurnLedger;
use crate::db::{ResponseStatus, Round, ToolOutcome, Turn};
use crate::extractor::{BlockItem, StructuredBlock};
use crate::llm::{LlmError, LlmRequest, ModelClient, SystemContent, TokenStream};
use crate::orchestrator::{Continuation, ConversationHistory, ToolOrchestrator};
use crate::state_machine::{ChatEvent, ChatMachine, Effect};
use crate::system_prompt::build_system_prompt;
use crate::transport::{TurnEvent, TurnProgress, TurnPublisher};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Recorded on `tool_call` turns for names no server declares
const UNRESOLVED_SERVER: &str = "unresolved";

/// Timing and request knobs for a generation
#[derive(Debug, Clone, Copy)]
pub struct GenerationSettings {
    pub grace: Duration,
    pub hard_timeout: Duration,
    pub tool_timeout: Duration,
    pub max_tokens: Option<u32>,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(8),
            hard_timeout: Duration::from_secs(180),
            tool_timeout: Duration::from_secs(60),
            max_tokens: None,
        }
    }
}

/// Everything a generation needs to start
pub struct GenerationRequest {
    pub session_id: String,
    pub round: Round,
    /// Prior rounds plus the new user message
    pub history: ConversationHistory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Completed { forced: bool },
    Failed { message: String },
    Cancelled,
}

/// What woke the select loop
enum Wake {
    Cancelled,
    Deadline,
    Token(Option<Result<String, LlmError>>),
    ToolDone(ToolOutcome),
    Progress(TurnProgress),
}

/// Mutable state of one running generation
struct Generation {
    session_id: String,
    response_id: String,
    state: StreamState,
    ledger: TurnLedger,
    orchestrator: ToolOrchestrator,
    history: ConversationHistory,
    arbiter: CompletionArbiter,
    stream: Option<TokenStream>,
    /// Tool outcome that arrived before the model stream ended
    ready_outcome: Option<ToolOutcome>,
    tool_task: Option<JoinHandle<()>>,
}

pub struct StreamCoordinator<M: ModelClient, S: TurnStore> {
    model: M,
    store: S,
    resolver: Arc<dyn ToolResolver>,
    publisher: Arc<TurnPublisher>,
    settings: GenerationSettings,
    system_prompt: String,
}

async fn next_token(stream: &mut Option<TokenStream>) -> Option<Result<String, LlmError>> {
    match stream {
        Some(s) => s.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

impl<M: ModelClient, S: TurnStore> StreamCoordinator<M, S> {
    pub fn new(
        model: M,
        store: S,
        resolver: Arc<dyn ToolResolver>,
        publisher: Arc<TurnPublisher>,
        settings: GenerationSettings,
    ) -> Self {
        let system_prompt = build_system_prompt(&resolver.list_tools());
        Self {
            model,
            store,
            resolver,
            publisher,
            settings,
            system_prompt,
        }
    }

    /// Run one generation to its end.
    ///
    /// The publisher must already hold the response (see
    /// [`TurnPublisher::open`]). Always ends with a `complete` or `error`
    /// event and a finished round in storage.
    pub async fn run(&self, request: GenerationRequest, cancel: CancellationToken) -> GenerationOutcome {
        let GenerationRequest {
            session_id,
            round,
            history,
        } = request;
        let response_id = round.response_id;
        tracing::info!(session_id = %session_id, response_id = %response_id, "Generation started");

        let mut machine = ChatMachine::new();
        let log_id = response_id.clone();
        machine.subscribe(Box::new(move |state| {
            tracing::debug!(response_id = %log_id, state = state.as_str(), "Chat state changed");
            Ok(())
        }));

        let mut cx = Generation {
            arbiter: CompletionArbiter::new(
                Instant::now(),
                self.settings.grace,
                self.settings.hard_timeout,
                self.publisher.track(&response_id),
            ),
            ledger: TurnLedger::new(response_id.clone()),
            orchestrator: ToolOrchestrator::new(self.resolver.clone(), self.settings.tool_timeout),
            state: StreamState::new(machine),
            history,
            session_id,
            response_id,
            stream: None,
            ready_outcome: None,
            tool_task: None,
        };
        cx.state.dispatch(ChatEvent::Start);

        let outcome = self.drive(&mut cx, &cancel).await;
        self.finish(&mut cx, &outcome).await;
        outcome
    }

    async fn drive(&self, cx: &mut Generation, cancel: &CancellationToken) -> GenerationOutcome {
        match self.open_stream(cx, cancel).await {
            Ok(stream) => cx.stream = Some(stream),
            Err(outcome) => return outcome,
        }

        let (tool_tx, mut tool_rx) = mpsc::channel::<ToolOutcome>(1);
        loop {
            let deadline = cx.arbiter.next_deadline();
            let wake = tokio::select! {
                biased;
                () = cancel.cancelled() => Wake::Cancelled,
                () = sleep_until(deadline) => Wake::Deadline,
                Some(outcome) = tool_rx.recv() => Wake::ToolDone(outcome),
                item = next_token(&mut cx.stream) => Wake::Token(item),
                progress = cx.arbiter.tracking_changed() => Wake::Progress(progress),
            };

            let stop = match wake {
                Wake::Cancelled => Some(GenerationOutcome::Cancelled),
                Wake::Deadline => cx
                    .arbiter
                    .on_deadline(Instant::now())
                    .map(|v| self.verdict_outcome(v)),
                Wake::Token(Some(Ok(token))) => self.on_token(cx, &token, &tool_tx).await,
                Wake::Token(Some(Err(e))) => Some(GenerationOutcome::Failed {
                    message: format!("model error: {}", e.message),
                }),
                Wake::Token(None) => self.on_stream_end(cx, cancel).await,
                Wake::ToolDone(outcome) => self.on_tool_outcome(cx, outcome, cancel).await,
                Wake::Progress(progress) => cx
                    .arbiter
                    .observe(progress, Instant::now())
                    .map(|v| self.verdict_outcome(v)),
            };
            if let Some(outcome) = stop {
                return outcome;
            }
        }
    }

    fn verdict_outcome(&self, verdict: Verdict) -> GenerationOutcome {
        match verdict {
            Verdict::Complete { forced } => GenerationOutcome::Completed { forced },
            Verdict::HardTimeout => self.timed_out(),
        }
    }

    fn timed_out(&self) -> GenerationOutcome {
        GenerationOutcome::Failed {
            message: format!("generation timed out after {:?}", self.settings.hard_timeout),
        }
    }

    async fn open_stream(
        &self,
        cx: &Generation,
        cancel: &CancellationToken,
    ) -> Result<TokenStream, GenerationOutcome> {
        let request = LlmRequest {
            system: vec![SystemContent::cached(self.system_prompt.clone())],
            messages: cx.history.messages().to_vec(),
            max_tokens: self.settings.max_tokens,
        };
        let deadline = cx.arbiter.next_deadline();
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(GenerationOutcome::Cancelled),
            () = sleep_until(deadline) => Err(self.timed_out()),
            result = self.model.stream(&request) => result.map_err(|e| GenerationOutcome::Failed {
                message: format!("model error: {}", e.message),
            }),
        }
    }

    async fn on_token(
        &self,
        cx: &mut Generation,
        token: &str,
        tool_tx: &mpsc::Sender<ToolOutcome>,
    ) -> Option<GenerationOutcome> {
        for fragment in cx.state.feed(token) {
            let stop = match fragment {
                Fragment::Text(text) => {
                    self.on_text(cx, text).await;
                    None
                }
                Fragment::Block { block, .. } => self.on_block(cx, block, tool_tx).await,
            };
            if stop.is_some() {
                return stop;
            }
        }
        None
    }

    async fn on_text(&self, cx: &mut Generation, text: String) {
        let Some(effects) = cx.state.dispatch(ChatEvent::Chunk { text }) else {
            return;
        };
        for effect in effects {
            if let Effect::EmitChunk { text } = effect {
                let (turn, created) = cx.ledger.append_text(&text);
                self.publish(cx, &turn);
                if created {
                    self.persist(&turn).await;
                }
            }
        }
    }

    async fn on_block(
        &self,
        cx: &mut Generation,
        block: StructuredBlock,
        tool_tx: &mpsc::Sender<ToolOutcome>,
    ) -> Option<GenerationOutcome> {
        for item in block.content {
            match item {
                BlockItem::Text { text } => self.on_text(cx, text).await,
                BlockItem::ToolUse { name, input } => {
                    let call = match cx.orchestrator.begin(name, input) {
                        Ok(call) => call,
                        Err(e) => {
                            tracing::warn!(response_id = %cx.response_id, error = %e, "Protocol violation");
                            return Some(GenerationOutcome::Failed {
                                message: e.to_string(),
                            });
                        }
                    };

                    let event = ChatEvent::ToolCall {
                        name: call.name.clone(),
                        input: call.input.clone(),
                    };
                    let Some(effects) = cx.state.dispatch(event) else {
                        return Some(GenerationOutcome::Failed {
                            message: format!(
                                "tool call `{}` not accepted while {}",
                                call.name,
                                cx.state.state().as_str()
                            ),
                        });
                    };

                    if let Some(turn) = cx.ledger.close_text() {
                        self.settle(cx, &turn).await;
                    }
                    for effect in effects {
                        if let Effect::EmitToolCall { name, input } = effect {
                            let server_id = call.server_id.as_deref().unwrap_or(UNRESOLVED_SERVER);
                            let turn = cx.ledger.open_tool_call(server_id, &name, input);
                            self.settle(cx, &turn).await;
                        }
                    }

                    tracing::info!(
                        response_id = %cx.response_id,
                        tool = %call.name,
                        server = call.server_id.as_deref().unwrap_or(UNRESOLVED_SERVER),
                        "Dispatching tool call"
                    );
                    let invocation = cx.orchestrator.invoke(&call);
                    let tx = tool_tx.clone();
                    cx.tool_task = Some(tokio::spawn(async move {
                        let outcome = invocation.await;
                        let _ = tx.send(outcome).await;
                    }));
                }
            }
        }
        None
    }

    async fn on_stream_end(
        &self,
        cx: &mut Generation,
        cancel: &CancellationToken,
    ) -> Option<GenerationOutcome> {
        cx.stream = None;
        cx.state.model_stream_finished = true;
        if let Some(rest) = cx.state.flush() {
            self.on_text(cx, rest).await;
        }
        if let Some(turn) = cx.ledger.close_text() {
            self.settle(cx, &turn).await;
        }

        if cx.orchestrator.pending().is_some() {
            return match cx.ready_outcome.take() {
                Some(outcome) => self.resume(cx, outcome, cancel).await,
                None => None,
            };
        }
        cx.arbiter
            .model_finished(Instant::now())
            .map(|v| self.verdict_outcome(v))
    }

    async fn on_tool_outcome(
        &self,
        cx: &mut Generation,
        outcome: ToolOutcome,
        cancel: &CancellationToken,
    ) -> Option<GenerationOutcome> {
        cx.tool_task = None;
        if let Some(turn) = cx.ledger.close_text() {
            self.settle(cx, &turn).await;
        }
        let (call, result) = cx.ledger.record_tool_result(outcome.clone());
        if let Some(call) = call {
            self.settle(cx, &call).await;
        }
        self.settle(cx, &result).await;

        if cx.state.model_stream_finished {
            self.resume(cx, outcome, cancel).await
        } else {
            cx.ready_outcome = Some(outcome);
            None
        }
    }

    /// Fold the tool outcome into history and open the continuation stream
    async fn resume(
        &self,
        cx: &mut Generation,
        outcome: ToolOutcome,
        cancel: &CancellationToken,
    ) -> Option<GenerationOutcome> {
        let raw = cx.state.take_raw_output();
        match cx.orchestrator.complete(&outcome, &raw, &mut cx.history) {
            Ok(Continuation::Resume) => {}
            Err(e) => {
                return Some(GenerationOutcome::Failed {
                    message: e.to_string(),
                })
            }
        }
        cx.state.dispatch(ChatEvent::ToolComplete);
        cx.state.begin_stream();

        tracing::debug!(response_id = %cx.response_id, messages = cx.history.len(), "Resuming model");
        match self.open_stream(cx, cancel).await {
            Ok(stream) => {
                cx.stream = Some(stream);
                None
            }
            Err(outcome) => Some(outcome),
        }
    }

    async fn finish(&self, cx: &mut Generation, outcome: &GenerationOutcome) {
        cx.arbiter.teardown();
        if let Some(task) = cx.tool_task.take() {
            task.abort();
        }
        cx.stream = None;

        let status = match outcome {
            GenerationOutcome::Completed { forced } => {
                cx.state.turns_finished = true;
                cx.state.dispatch(ChatEvent::Complete);
                if *forced {
                    tracing::warn!(response_id = %cx.response_id, "Completed before all turns settled");
                }
                ResponseStatus::Completed
            }
            GenerationOutcome::Failed { .. } | GenerationOutcome::Cancelled => {
                let message = match outcome {
                    GenerationOutcome::Failed { message } => message.clone(),
                    _ => "generation cancelled".to_string(),
                };
                cx.state.dispatch(ChatEvent::error(message));
                for turn in cx.ledger.fail_open() {
                    self.settle(cx, &turn).await;
                }
                ResponseStatus::Error
            }
        };

        if let Err(e) = self.store.finish_response(&cx.response_id, status).await {
            tracing::error!(response_id = %cx.response_id, error = %e, "Failed to finish round");
        }

        let event = match outcome {
            GenerationOutcome::Completed { .. } => TurnEvent::Complete {
                session_id: cx.session_id.clone(),
            },
            GenerationOutcome::Failed { message } => TurnEvent::Error {
                message: message.clone(),
            },
            GenerationOutcome::Cancelled => TurnEvent::Error {
                message: "generation cancelled".to_string(),
            },
        };
        self.publisher.emit(&cx.response_id, event);

        tracing::info!(
            session_id = %cx.session_id,
            response_id = %cx.response_id,
            turns = cx.ledger.turns().len(),
            outcome = ?outcome,
            "Generation finished"
        );
    }

    fn publish(&self, cx: &Generation, turn: &Turn) {
        self.publisher.emit(
            &cx.response_id,
            TurnEvent::Update { turn: turn.clone() },
        );
    }

    /// Publish and persist
    async fn settle(&self, cx: &Generation, turn: &Turn) {
        self.publish(cx, turn);
        self.persist(turn).await;
    }

    async fn persist(&self, turn: &Turn) {
        if let Err(e) = self.store.append_turn(turn).await {
            tracing::error!(turn_id = %turn.id, response_id = %turn.response_id, error = %e, "Failed to persist turn");
        }
    }
}
