//! Mock implementations for testing
//!
//! These mocks enable end-to-end generation tests without real I/O.

use super::coordinator::{GenerationOutcome, GenerationRequest, GenerationSettings, StreamCoordinator};
use super::traits::*;
use crate::db::{ResponseStatus, Round, Session, StreamingStatus, Turn};
use crate::llm::{LlmError, LlmMessage, LlmRequest, ModelClient, TokenStream, ToolDefinition};
use crate::orchestrator::ConversationHistory;
use crate::tools::{ToolServer, ToolServerError};
use crate::transport::{TurnEvent, TurnPublisher};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Mock Model Client
// ============================================================================

/// One step of a scripted model stream
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Token(String),
    Error(LlmError),
    Delay(Duration),
    /// Never yields again
    Hang,
}

impl ScriptStep {
    pub fn token(text: impl Into<String>) -> Self {
        ScriptStep::Token(text.into())
    }
}

/// Model client that plays back queued scripts, one per `stream` call
pub struct MockModelClient {
    scripts: Mutex<VecDeque<Result<Vec<ScriptStep>, LlmError>>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl MockModelClient {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn script(&self, steps: Vec<ScriptStep>) {
        self.scripts.lock().unwrap().push_back(Ok(steps));
    }

    /// The next `stream` call fails before yielding anything
    pub fn script_open_error(&self, error: LlmError) {
        self.scripts.lock().unwrap().push_back(Err(error));
    }

    pub fn recorded_requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Default for MockModelClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelClient for MockModelClient {
    async fn stream(&self, request: &LlmRequest) -> Result<TokenStream, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        let steps = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::unknown("no scripted response")))?;

        let stream = futures::stream::unfold(VecDeque::from(steps), |mut steps| async move {
            loop {
                match steps.pop_front()? {
                    ScriptStep::Token(text) => return Some((Ok(text), steps)),
                    ScriptStep::Error(e) => return Some((Err(e), steps)),
                    ScriptStep::Delay(d) => tokio::time::sleep(d).await,
                    ScriptStep::Hang => std::future::pending::<()>().await,
                }
            }
        });
        Ok(Box::pin(stream))
    }

    fn model_id(&self) -> &str {
        "mock-model"
    }
}

// ============================================================================
// Mock Tool Server
// ============================================================================

struct MockTool {
    name: String,
    delay: Option<Duration>,
    result: Result<Value, String>,
}

/// Tool server with canned results
pub struct MockToolServer {
    id: String,
    tools: Vec<MockTool>,
    available: bool,
    calls: Mutex<Vec<(String, Value)>>,
}

impl MockToolServer {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tools: Vec::new(),
            available: true,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_tool(mut self, name: impl Into<String>, result: Result<Value, String>) -> Self {
        self.tools.push(MockTool {
            name: name.into(),
            delay: None,
            result,
        });
        self
    }

    pub fn with_delayed_tool(
        mut self,
        name: impl Into<String>,
        delay: Duration,
        result: Result<Value, String>,
    ) -> Self {
        self.tools.push(MockTool {
            name: name.into(),
            delay: Some(delay),
            result,
        });
        self
    }

    /// Listing fails, as for a server that is down
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|tool| ToolDefinition {
                name: tool.name.clone(),
                description: format!("Mock tool {}", tool.name),
                input_schema: json!({"type": "object"}),
            })
            .collect()
    }

    pub fn recorded_calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    fn has_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name == name)
    }
}

#[async_trait]
impl ToolServer for MockToolServer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolServerError> {
        if !self.available {
            return Err(ToolServerError::Transport("connection refused".to_string()));
        }
        Ok(self.definitions())
    }

    async fn call_tool(&self, name: &str, input: Value) -> Result<Value, ToolServerError> {
        self.calls.lock().unwrap().push((name.to_string(), input));
        let tool = self
            .tools
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| ToolServerError::UnknownTool(name.to_string()))?;
        if let Some(delay) = tool.delay {
            tokio::time::sleep(delay).await;
        }
        tool.result.clone().map_err(ToolServerError::Failed)
    }
}

/// Resolver over mock servers; the first server declaring a name owns it
pub struct StaticResolver {
    servers: Vec<Arc<MockToolServer>>,
}

impl StaticResolver {
    pub fn new(servers: Vec<Arc<MockToolServer>>) -> Self {
        Self { servers }
    }
}

impl ToolResolver for StaticResolver {
    fn resolve(&self, name: &str) -> Option<ResolvedTool> {
        let server = self.servers.iter().find(|s| s.has_tool(name))?;
        Some(ResolvedTool {
            server_id: server.id().to_string(),
            server: server.clone(),
        })
    }

    fn list_tools(&self) -> Vec<ToolDefinition> {
        let mut tools: Vec<ToolDefinition> = Vec::new();
        for definition in self.servers.iter().flat_map(|s| s.definitions()) {
            if !tools.iter().any(|t| t.name == definition.name) {
                tools.push(definition);
            }
        }
        tools
    }
}

// ============================================================================
// In-Memory Storage
// ============================================================================

/// In-memory storage for testing
pub struct InMemoryStorage {
    sessions: Mutex<HashMap<String, Session>>,
    rounds: Mutex<Vec<Round>>,
    turns: Mutex<HashMap<String, Vec<Turn>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            rounds: Mutex::new(Vec::new()),
            turns: Mutex::new(HashMap::new()),
        }
    }

    /// Persisted turns of a response in index order
    pub fn turns(&self, response_id: &str) -> Vec<Turn> {
        self.turns
            .lock()
            .unwrap()
            .get(response_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn round_status(&self, response_id: &str) -> Option<ResponseStatus> {
        self.rounds
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.response_id == response_id)
            .map(|r| r.status)
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TurnStore for InMemoryStorage {
    async fn ensure_session(&self, session_id: &str, title: &str) -> Result<Session, String> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session {
                id: session_id.to_string(),
                title: title.to_string(),
                created_at: chrono::Utc::now(),
            });
        Ok(session.clone())
    }

    async fn create_round(&self, session_id: &str, request_text: &str) -> Result<Round, String> {
        if !self.sessions.lock().unwrap().contains_key(session_id) {
            return Err(format!("Session not found: {session_id}"));
        }
        let mut rounds = self.rounds.lock().unwrap();
        let index = rounds.iter().filter(|r| r.session_id == session_id).count();
        let round = Round {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            index: i64::try_from(index).unwrap(),
            request_text: request_text.to_string(),
            response_id: uuid::Uuid::new_v4().to_string(),
            status: ResponseStatus::Streaming,
            created_at: chrono::Utc::now(),
            turns: Vec::new(),
        };
        rounds.push(round.clone());
        Ok(round)
    }

    async fn append_turn(&self, turn: &Turn) -> Result<(), String> {
        let mut turns = self.turns.lock().unwrap();
        let list = turns.entry(turn.response_id.clone()).or_default();
        match list.iter_mut().find(|t| t.id == turn.id) {
            Some(existing) => existing.clone_from(turn),
            None => {
                list.push(turn.clone());
                list.sort_by_key(|t| t.index);
            }
        }
        Ok(())
    }

    async fn list_rounds(&self, session_id: &str) -> Result<Vec<Round>, String> {
        let mut rounds: Vec<Round> = self
            .rounds
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect();
        rounds.sort_by_key(|r| r.index);
        for round in &mut rounds {
            round.turns = self.turns(&round.response_id);
        }
        Ok(rounds)
    }

    async fn list_turns(&self, response_id: &str) -> Result<Vec<Turn>, String> {
        Ok(self.turns(response_id))
    }

    async fn get_streaming_status(&self, response_id: &str) -> Result<StreamingStatus, String> {
        self.rounds
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.response_id == response_id)
            .map(|r| StreamingStatus {
                session_id: r.session_id.clone(),
                status: r.status,
                is_complete: r.status.is_finished(),
            })
            .ok_or_else(|| format!("Response not found: {response_id}"))
    }

    async fn finish_response(
        &self,
        response_id: &str,
        status: ResponseStatus,
    ) -> Result<(), String> {
        let mut rounds = self.rounds.lock().unwrap();
        let round = rounds
            .iter_mut()
            .find(|r| r.response_id == response_id)
            .ok_or_else(|| format!("Response not found: {response_id}"))?;
        round.status = status;
        Ok(())
    }
}

// ============================================================================
// Generation Harness
// ============================================================================

pub const TEST_SESSION: &str = "test-session";

/// Wires a coordinator to mocks and records what observers would see
pub struct TestGeneration {
    pub model: Arc<MockModelClient>,
    pub store: Arc<InMemoryStorage>,
    pub publisher: Arc<TurnPublisher>,
    servers: Vec<Arc<MockToolServer>>,
    settings: GenerationSettings,
}

/// Result of one harness run
pub struct GenerationRun {
    pub response_id: String,
    pub outcome: GenerationOutcome,
    /// Every event a subscriber attached at `start` received
    pub events: Vec<TurnEvent>,
}

impl TestGeneration {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryStorage::new());
        let publisher = Arc::new(TurnPublisher::new(store.clone(), Duration::from_secs(60)));
        Self {
            model: Arc::new(MockModelClient::new()),
            store,
            publisher,
            servers: Vec::new(),
            settings: GenerationSettings::default(),
        }
    }

    pub fn with_tools(mut self, server: MockToolServer) -> Self {
        self.servers.push(Arc::new(server));
        self
    }

    pub fn with_settings(mut self, settings: GenerationSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn script(&self, steps: Vec<ScriptStep>) {
        self.model.script(steps);
    }

    pub fn script_open_error(&self, error: LlmError) {
        self.model.script_open_error(error);
    }

    pub fn resolver(&self) -> Arc<dyn ToolResolver> {
        Arc::new(StaticResolver::new(self.servers.clone()))
    }

    pub async fn run(&self, message: &str) -> GenerationRun {
        self.run_with_cancel(message, CancellationToken::new()).await
    }

    pub async fn run_with_cancel(&self, message: &str, cancel: CancellationToken) -> GenerationRun {
        self.store.ensure_session(TEST_SESSION, "test").await.unwrap();
        let prior = self.store.list_rounds(TEST_SESSION).await.unwrap();
        let round = self.store.create_round(TEST_SESSION, message).await.unwrap();
        let mut history = ConversationHistory::from_rounds(&prior);
        history.push(LlmMessage::user(message));

        let response_id = round.response_id.clone();
        self.publisher.open(TEST_SESSION, &response_id);
        let subscription = self.publisher.subscribe(&response_id).unwrap();

        let coordinator = StreamCoordinator::new(
            self.model.clone(),
            self.store.clone(),
            self.resolver(),
            self.publisher.clone(),
            self.settings,
        );
        let request = GenerationRequest {
            session_id: TEST_SESSION.to_string(),
            round,
            history,
        };
        let outcome = coordinator.run(request, cancel).await;

        let mut events = subscription.backlog;
        let mut receiver = subscription.receiver;
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        GenerationRun {
            response_id,
            outcome,
            events,
        }
    }
}

impl Default for TestGeneration {
    fn default() -> Self {
        Self::new()
    }
}

/// Compact event trace with consecutive duplicates collapsed
pub fn summarize(events: &[TurnEvent]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for event in events {
        let line = match event {
            TurnEvent::Start { .. } => "start".to_string(),
            TurnEvent::Update { turn } => {
                format!("update {} {}", turn.kind, turn.status.as_str())
            }
            TurnEvent::Complete { .. } => "complete".to_string(),
            TurnEvent::Error { message } => format!("error {message}"),
        };
        if out.last() != Some(&line) {
            out.push(line);
        }
    }
    out
}
