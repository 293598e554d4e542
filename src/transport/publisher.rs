//! Fan-out hub for turn events
//!
//! One log per response holds the latest copy of every turn, a broadcast
//! sender for live observers and a watch channel the completion arbiter
//! tracks. Critical sections are short and never await.

use super::TurnEvent;
use crate::db::{ResponseStatus, Turn};
use crate::runtime::TurnStore;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

const CHANNEL_CAPACITY: usize = 256;

/// Settledness of a response's turns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnProgress {
    /// At least one turn has been published
    pub tracked: bool,
    /// Every published turn is completed or errored
    pub all_terminal: bool,
}

impl TurnProgress {
    fn of(turns: &[Turn]) -> Self {
        let tracked = !turns.is_empty();
        Self {
            tracked,
            all_terminal: tracked && turns.iter().all(|t| t.status.is_terminal()),
        }
    }
}

/// Pull-mode view of a response
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub session_id: String,
    pub turns: Vec<Turn>,
    pub is_complete: bool,
    pub error: Option<String>,
}

/// Backlog and live receiver taken under one lock
pub struct PushSubscription {
    pub backlog: Vec<TurnEvent>,
    pub receiver: broadcast::Receiver<TurnEvent>,
}

struct Finished {
    error: Option<String>,
    at: Instant,
}

struct ResponseLog {
    session_id: String,
    turns: Vec<Turn>,
    sender: broadcast::Sender<TurnEvent>,
    progress: watch::Sender<TurnProgress>,
    finished: Option<Finished>,
}

impl ResponseLog {
    fn expired(&self, now: Instant, retention: Duration) -> bool {
        self.finished
            .as_ref()
            .is_some_and(|f| now.duration_since(f.at) >= retention)
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            session_id: self.session_id.clone(),
            turns: self.turns.clone(),
            is_complete: self.finished.is_some(),
            error: self.finished.as_ref().and_then(|f| f.error.clone()),
        }
    }

    fn backlog(&self) -> Vec<TurnEvent> {
        let mut events = Vec::with_capacity(self.turns.len() + 2);
        events.push(TurnEvent::Start {
            session_id: self.session_id.clone(),
        });
        events.extend(
            self.turns
                .iter()
                .map(|turn| TurnEvent::Update { turn: turn.clone() }),
        );
        if let Some(finished) = &self.finished {
            events.push(match &finished.error {
                Some(message) => TurnEvent::Error {
                    message: message.clone(),
                },
                None => TurnEvent::Complete {
                    session_id: self.session_id.clone(),
                },
            });
        }
        events
    }

    /// Apply an update; returns false when it would regress a turn
    fn apply(&mut self, turn: &Turn) -> bool {
        match self.turns.iter_mut().find(|t| t.id == turn.id) {
            Some(existing) => {
                if !existing.status.can_advance_to(turn.status) {
                    return false;
                }
                existing.clone_from(turn);
            }
            None => {
                self.turns.push(turn.clone());
                self.turns.sort_by_key(|t| t.index);
            }
        }
        self.progress.send_replace(TurnProgress::of(&self.turns));
        true
    }
}

pub struct TurnPublisher {
    responses: RwLock<HashMap<String, ResponseLog>>,
    store: Arc<dyn TurnStore>,
    retention: Duration,
}

impl TurnPublisher {
    pub fn new(store: Arc<dyn TurnStore>, retention: Duration) -> Self {
        Self {
            responses: RwLock::new(HashMap::new()),
            store,
            retention,
        }
    }

    /// Register a response and emit its `start` event
    pub fn open(&self, session_id: &str, response_id: &str) {
        let now = Instant::now();
        let mut responses = self
            .responses
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let retention = self.retention;
        responses.retain(|_, log| !log.expired(now, retention));

        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (progress, _) = watch::channel(TurnProgress::default());
        let log = ResponseLog {
            session_id: session_id.to_string(),
            turns: Vec::new(),
            sender,
            progress,
            finished: None,
        };
        let _ = log.sender.send(TurnEvent::Start {
            session_id: session_id.to_string(),
        });
        if responses.insert(response_id.to_string(), log).is_some() {
            tracing::warn!(response_id = %response_id, "Response reopened, previous log dropped");
        }
    }

    /// Publish an event.
    ///
    /// Returns false if the event was dropped: the response is unknown or
    /// already finished, the update would regress a turn, or it is a repeated
    /// `start`.
    pub fn emit(&self, response_id: &str, event: TurnEvent) -> bool {
        let mut responses = self
            .responses
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(log) = responses.get_mut(response_id) else {
            tracing::warn!(response_id = %response_id, event = event.event_type(), "Event for unknown response");
            return false;
        };
        if log.finished.is_some() {
            tracing::debug!(response_id = %response_id, event = event.event_type(), "Event after finish dropped");
            return false;
        }

        match &event {
            TurnEvent::Start { .. } => return false,
            TurnEvent::Update { turn } => {
                if !log.apply(turn) {
                    tracing::debug!(
                        response_id = %response_id,
                        turn_id = %turn.id,
                        status = turn.status.as_str(),
                        "Regressing turn update dropped"
                    );
                    return false;
                }
            }
            TurnEvent::Complete { .. } => {
                log.finished = Some(Finished {
                    error: None,
                    at: Instant::now(),
                });
            }
            TurnEvent::Error { message } => {
                log.finished = Some(Finished {
                    error: Some(message.clone()),
                    at: Instant::now(),
                });
            }
        }

        // No receivers is fine; late observers replay the backlog
        let _ = log.sender.send(event);
        true
    }

    /// Backlog replay plus a live receiver, or `None` if the response is not
    /// held in memory
    pub fn subscribe(&self, response_id: &str) -> Option<PushSubscription> {
        let responses = self
            .responses
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let log = responses.get(response_id)?;
        if log.expired(Instant::now(), self.retention) {
            return None;
        }
        Some(PushSubscription {
            backlog: log.backlog(),
            receiver: log.sender.subscribe(),
        })
    }

    /// Watch turn settledness of a live response
    pub fn track(&self, response_id: &str) -> Option<watch::Receiver<TurnProgress>> {
        let responses = self
            .responses
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        responses.get(response_id).map(|log| log.progress.subscribe())
    }

    /// Whether push delivery is possible for the response
    pub fn is_live(&self, response_id: &str) -> bool {
        let responses = self
            .responses
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        responses
            .get(response_id)
            .is_some_and(|log| !log.expired(Instant::now(), self.retention))
    }

    /// Current view of a response, from memory within the retention window,
    /// from storage after it
    pub async fn snapshot(&self, response_id: &str) -> Result<Snapshot, String> {
        let live = {
            let responses = self
                .responses
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            responses
                .get(response_id)
                .filter(|log| !log.expired(Instant::now(), self.retention))
                .map(ResponseLog::snapshot)
        };
        if let Some(snapshot) = live {
            return Ok(snapshot);
        }

        let status = self.store.get_streaming_status(response_id).await?;
        let turns = self.store.list_turns(response_id).await?;
        Ok(Snapshot {
            session_id: status.session_id,
            turns,
            is_complete: status.is_complete,
            error: (status.status == ResponseStatus::Error)
                .then(|| "generation failed".to_string()),
        })
    }
}
