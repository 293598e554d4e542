//! Generation runtime
//!
//! One coordinator task per active round. The [`GenerationManager`] allows a
//! single active generation per session and owns the cancellation tokens.

mod arbiter;
mod coordinator;
mod stream_state;
pub mod traits;
mod turns;

#[cfg(test)]
pub mod testing;

pub use coordinator::{GenerationOutcome, GenerationRequest, GenerationSettings, StreamCoordinator};
pub use traits::*;

use crate::llm::{LlmMessage, ModelClient};
use crate::orchestrator::ConversationHistory;
use crate::transport::TurnPublisher;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Longest session title taken from the first message
const TITLE_CHARS: usize = 60;

#[derive(Debug, Error)]
pub enum StartError {
    #[error("session {0} already has an active generation")]
    Busy(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Ids of a generation that has been started
#[derive(Debug, Clone)]
pub struct StartedGeneration {
    pub session_id: String,
    pub round_id: String,
    pub response_id: String,
    /// Cancels this generation only
    pub cancel: CancellationToken,
}

struct ActiveGeneration {
    /// `None` while the round is being created
    response_id: Option<String>,
    cancel: CancellationToken,
}

/// Frees a session slot when the generation task ends, panics included
struct SlotGuard {
    manager: Arc<GenerationManager>,
    session_id: String,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let session_id = std::mem::take(&mut self.session_id);
        if let Ok(mut active) = self.manager.active.try_write() {
            active.remove(&session_id);
            tracing::debug!(session_id = %session_id, "Generation slot released");
            return;
        }
        // Contended: release from a task instead of blocking in drop
        let manager = Arc::clone(&self.manager);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                manager.active.write().await.remove(&session_id);
                tracing::debug!(session_id = %session_id, "Generation slot released");
            });
        }
    }
}

/// Manager for all running generations
pub struct GenerationManager {
    model: Arc<dyn ModelClient>,
    store: Arc<dyn TurnStore>,
    resolver: Arc<dyn ToolResolver>,
    publisher: Arc<TurnPublisher>,
    settings: GenerationSettings,
    active: RwLock<HashMap<String, ActiveGeneration>>,
}

impl GenerationManager {
    pub fn new(
        model: Arc<dyn ModelClient>,
        store: Arc<dyn TurnStore>,
        resolver: Arc<dyn ToolResolver>,
        publisher: Arc<TurnPublisher>,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            model,
            store,
            resolver,
            publisher,
            settings,
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Record the user message and spawn the coordinator.
    ///
    /// Returns as soon as the round exists; progress is observed through the
    /// publisher. A new session is created when `session_id` is `None`.
    pub async fn start(
        self: &Arc<Self>,
        session_id: Option<String>,
        message: &str,
    ) -> Result<StartedGeneration, StartError> {
        let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let cancel = CancellationToken::new();

        {
            let mut active = self.active.write().await;
            if active.contains_key(&session_id) {
                tracing::info!(session_id = %session_id, "Rejecting message, generation in progress");
                return Err(StartError::Busy(session_id));
            }
            active.insert(
                session_id.clone(),
                ActiveGeneration {
                    response_id: None,
                    cancel: cancel.clone(),
                },
            );
        }

        let (round, history) = match self.prepare(&session_id, message).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.active.write().await.remove(&session_id);
                tracing::error!(session_id = %session_id, error = %e, "Failed to record user message");
                return Err(StartError::Storage(e));
            }
        };

        let started = StartedGeneration {
            session_id: session_id.clone(),
            round_id: round.id.clone(),
            response_id: round.response_id.clone(),
            cancel: cancel.clone(),
        };
        if let Some(entry) = self.active.write().await.get_mut(&session_id) {
            entry.response_id = Some(round.response_id.clone());
        }
        self.publisher.open(&session_id, &round.response_id);

        let coordinator = StreamCoordinator::new(
            self.model.clone(),
            self.store.clone(),
            self.resolver.clone(),
            self.publisher.clone(),
            self.settings,
        );
        let request = GenerationRequest {
            session_id: session_id.clone(),
            round,
            history,
        };
        let slot = SlotGuard {
            manager: Arc::clone(self),
            session_id,
        };
        tokio::spawn(async move {
            let outcome = coordinator.run(request, cancel).await;
            tracing::debug!(session_id = %slot.session_id, outcome = ?outcome, "Generation finished");
            drop(slot);
        });

        Ok(started)
    }

    async fn prepare(
        &self,
        session_id: &str,
        message: &str,
    ) -> Result<(crate::db::Round, ConversationHistory), String> {
        let title: String = message.chars().take(TITLE_CHARS).collect();
        self.store.ensure_session(session_id, &title).await?;

        let prior = self.store.list_rounds(session_id).await?;
        let round = self.store.create_round(session_id, message).await?;

        let mut history = ConversationHistory::from_rounds(&prior);
        history.push(LlmMessage::user(message));
        Ok((round, history))
    }

    /// Cancel the generation producing `response_id`
    pub async fn cancel_response(&self, response_id: &str) -> bool {
        let active = self.active.read().await;
        let Some(entry) = active
            .values()
            .find(|g| g.response_id.as_deref() == Some(response_id))
        else {
            return false;
        };
        tracing::info!(response_id = %response_id, "Cancelling generation");
        entry.cancel.cancel();
        true
    }

    /// Cancel whatever the session is generating
    pub async fn cancel_session(&self, session_id: &str) -> bool {
        let active = self.active.read().await;
        let Some(entry) = active.get(session_id) else {
            return false;
        };
        tracing::info!(session_id = %session_id, "Cancelling session generation");
        entry.cancel.cancel();
        true
    }

    pub async fn is_active(&self, session_id: &str) -> bool {
        self.active.read().await.contains_key(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{InMemoryStorage, MockModelClient, ScriptStep, StaticResolver};
    use super::*;
    use crate::db::ResponseStatus;
    use crate::llm::MessageRole;
    use crate::transport::TurnEvent;
    use std::time::Duration;

    struct Fixture {
        manager: Arc<GenerationManager>,
        model: Arc<MockModelClient>,
        store: Arc<InMemoryStorage>,
        publisher: Arc<TurnPublisher>,
    }

    fn fixture() -> Fixture {
        let model = Arc::new(MockModelClient::new());
        let store = Arc::new(InMemoryStorage::new());
        let publisher = Arc::new(TurnPublisher::new(store.clone(), Duration::from_secs(60)));
        let manager = Arc::new(GenerationManager::new(
            model.clone(),
            store.clone(),
            Arc::new(StaticResolver::new(vec![])),
            publisher.clone(),
            GenerationSettings::default(),
        ));
        Fixture {
            manager,
            model,
            store,
            publisher,
        }
    }

    async fn wait_finished(fx: &Fixture, started: &StartedGeneration) -> TurnEvent {
        let sub = fx.publisher.subscribe(&started.response_id).unwrap();
        let mut receiver = sub.receiver;
        let terminal = match sub.backlog.into_iter().find(TurnEvent::is_terminal) {
            Some(event) => event,
            None => loop {
                let event = receiver.recv().await.unwrap();
                if event.is_terminal() {
                    break event;
                }
            },
        };
        while fx.manager.is_active(&started.session_id).await {
            tokio::task::yield_now().await;
        }
        terminal
    }

    #[tokio::test]
    async fn test_start_runs_and_releases_slot() {
        let fx = fixture();
        fx.model.script(vec![ScriptStep::token("Hi there")]);

        let started = fx.manager.start(None, "hello").await.unwrap();
        let terminal = wait_finished(&fx, &started).await;

        assert!(matches!(terminal, TurnEvent::Complete { .. }));
        assert!(!fx.manager.is_active(&started.session_id).await);
        assert_eq!(
            fx.store.round_status(&started.response_id),
            Some(ResponseStatus::Completed)
        );
    }

    #[tokio::test]
    async fn test_history_carries_prior_rounds() {
        let fx = fixture();
        fx.model.script(vec![ScriptStep::token("First answer")]);
        fx.model.script(vec![ScriptStep::token("Second answer")]);

        let first = fx.manager.start(Some("s1".to_string()), "one").await.unwrap();
        wait_finished(&fx, &first).await;
        let second = fx.manager.start(Some("s1".to_string()), "two").await.unwrap();
        wait_finished(&fx, &second).await;

        let requests = fx.model.recorded_requests();
        let messages = &requests[1].messages;
        let roles: Vec<_> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![MessageRole::User, MessageRole::Assistant, MessageRole::User]
        );
        assert_eq!(messages[1].content, "First answer");
        assert_eq!(messages[2].content, "two");
    }

    #[tokio::test]
    async fn test_one_generation_per_session() {
        let fx = fixture();
        fx.model.script(vec![ScriptStep::token("..."), ScriptStep::Hang]);

        let started = fx.manager.start(Some("s1".to_string()), "go").await.unwrap();
        let err = fx
            .manager
            .start(Some("s1".to_string()), "again")
            .await
            .unwrap_err();
        assert!(matches!(err, StartError::Busy(id) if id == "s1"));

        assert!(fx.manager.cancel_session("s1").await);
        let terminal = wait_finished(&fx, &started).await;
        assert_eq!(
            terminal,
            TurnEvent::Error {
                message: "generation cancelled".to_string()
            }
        );
        assert_eq!(
            fx.store.round_status(&started.response_id),
            Some(ResponseStatus::Error)
        );
    }

    /// Model client whose stream blows up inside the coordinator task
    struct PanickingModel;

    #[async_trait::async_trait]
    impl ModelClient for PanickingModel {
        async fn stream(
            &self,
            _request: &crate::llm::LlmRequest,
        ) -> Result<crate::llm::TokenStream, crate::llm::LlmError> {
            panic!("model client bug");
        }

        fn model_id(&self) -> &str {
            "panicking"
        }
    }

    #[tokio::test]
    async fn test_panicking_generation_releases_slot() {
        let store = Arc::new(InMemoryStorage::new());
        let publisher = Arc::new(TurnPublisher::new(store.clone(), Duration::from_secs(60)));
        let manager = Arc::new(GenerationManager::new(
            Arc::new(PanickingModel),
            store,
            Arc::new(StaticResolver::new(vec![])),
            publisher,
            GenerationSettings::default(),
        ));

        manager.start(Some("s1".to_string()), "go").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.is_active("s1").await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("slot was never released");

        assert!(manager.start(Some("s1".to_string()), "again").await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_by_response_id() {
        let fx = fixture();
        fx.model.script(vec![ScriptStep::Hang]);

        let started = fx.manager.start(None, "go").await.unwrap();
        assert!(!fx.manager.cancel_response("unknown").await);
        assert!(fx.manager.cancel_response(&started.response_id).await);
        assert!(matches!(
            wait_finished(&fx, &started).await,
            TurnEvent::Error { .. }
        ));
    }
}
