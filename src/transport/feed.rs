//! Observer-side feeds over the turn publisher

use super::{PushSubscription, Snapshot, TurnEvent, TurnPublisher};
use crate::db::Turn;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast::Receiver;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("push feed lagged by {0} events")]
    Lagged(u64),
    #[error("push feed closed before the response finished")]
    Closed,
    #[error("snapshot failed: {0}")]
    Snapshot(String),
}

/// A source of turn events for one response.
///
/// An empty batch means the feed is exhausted: the terminal event has been
/// delivered.
#[async_trait]
pub trait TurnFeed: Send {
    async fn next_batch(&mut self) -> Result<Vec<TurnEvent>, FeedError>;
}

/// Something that can produce a pull snapshot
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn snapshot(&self, response_id: &str) -> Result<Snapshot, String>;
}

#[async_trait]
impl SnapshotSource for TurnPublisher {
    async fn snapshot(&self, response_id: &str) -> Result<Snapshot, String> {
        TurnPublisher::snapshot(self, response_id).await
    }
}

/// Delivery mode requested by an observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedMode {
    Push,
    Pull,
}

impl FeedMode {
    /// Pick the mode to serve: pull when asked for or when push is impossible
    pub fn negotiate(requested: Option<FeedMode>, push_available: bool) -> FeedMode {
        match requested {
            Some(FeedMode::Pull) => FeedMode::Pull,
            _ if push_available => FeedMode::Push,
            _ => FeedMode::Pull,
        }
    }
}

/// What an observer has already been given
#[derive(Debug, Default)]
struct Delivered {
    started: bool,
    finished: bool,
    turns: HashMap<String, Turn>,
}

impl Delivered {
    /// Record an event; returns false if the observer already has it
    fn accept(&mut self, event: &TurnEvent) -> bool {
        if self.finished {
            return false;
        }
        match event {
            TurnEvent::Start { .. } => !std::mem::replace(&mut self.started, true),
            TurnEvent::Update { turn } => {
                let fresh = match self.turns.get(&turn.id) {
                    None => true,
                    Some(prev) => {
                        prev.status.can_advance_to(turn.status)
                            && (prev.status != turn.status || prev.payload != turn.payload)
                    }
                };
                if fresh {
                    self.turns.insert(turn.id.clone(), turn.clone());
                }
                fresh
            }
            TurnEvent::Complete { .. } | TurnEvent::Error { .. } => {
                self.finished = true;
                true
            }
        }
    }
}

/// Live delivery over the publisher's broadcast channel
pub struct PushFeed {
    backlog: Vec<TurnEvent>,
    receiver: Receiver<TurnEvent>,
    delivered: Delivered,
}

impl PushFeed {
    pub fn new(subscription: PushSubscription) -> Self {
        Self {
            backlog: subscription.backlog,
            receiver: subscription.receiver,
            delivered: Delivered::default(),
        }
    }
}

#[async_trait]
impl TurnFeed for PushFeed {
    async fn next_batch(&mut self) -> Result<Vec<TurnEvent>, FeedError> {
        loop {
            if self.delivered.finished {
                return Ok(Vec::new());
            }

            let mut incoming = std::mem::take(&mut self.backlog);
            if incoming.is_empty() {
                match self.receiver.recv().await {
                    Ok(event) => incoming.push(event),
                    Err(RecvError::Lagged(n)) => return Err(FeedError::Lagged(n)),
                    Err(RecvError::Closed) => return Err(FeedError::Closed),
                }
                // Drain whatever else is already queued into the same batch
                loop {
                    match self.receiver.try_recv() {
                        Ok(event) => incoming.push(event),
                        Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                        Err(TryRecvError::Lagged(n)) => {
                            // Deliver what we have; the next recv reports the lag
                            tracing::debug!(lagged = n, "Push feed fell behind");
                            break;
                        }
                    }
                }
            }

            let batch: Vec<TurnEvent> = incoming
                .into_iter()
                .filter(|event| self.delivered.accept(event))
                .collect();
            if !batch.is_empty() {
                return Ok(batch);
            }
        }
    }
}

/// Snapshot polling with diffing by turn id
pub struct PullFeed {
    source: Arc<dyn SnapshotSource>,
    response_id: String,
    interval: Duration,
    delivered: Delivered,
    polled: bool,
}

impl PullFeed {
    pub fn new(source: Arc<dyn SnapshotSource>, response_id: impl Into<String>, interval: Duration) -> Self {
        Self::seeded(source, response_id, interval, Delivered::default())
    }

    fn seeded(
        source: Arc<dyn SnapshotSource>,
        response_id: impl Into<String>,
        interval: Duration,
        delivered: Delivered,
    ) -> Self {
        Self {
            source,
            response_id: response_id.into(),
            interval,
            delivered,
            polled: false,
        }
    }

    fn diff(&mut self, snapshot: Snapshot) -> Vec<TurnEvent> {
        let mut candidates = Vec::with_capacity(snapshot.turns.len() + 2);
        candidates.push(TurnEvent::Start {
            session_id: snapshot.session_id.clone(),
        });
        candidates.extend(snapshot.turns.into_iter().map(|turn| TurnEvent::Update { turn }));
        if snapshot.is_complete {
            candidates.push(match snapshot.error {
                Some(message) => TurnEvent::Error { message },
                None => TurnEvent::Complete {
                    session_id: snapshot.session_id,
                },
            });
        }
        candidates
            .into_iter()
            .filter(|event| self.delivered.accept(event))
            .collect()
    }
}

#[async_trait]
impl TurnFeed for PullFeed {
    async fn next_batch(&mut self) -> Result<Vec<TurnEvent>, FeedError> {
        loop {
            if self.delivered.finished {
                return Ok(Vec::new());
            }
            if self.polled {
                tokio::time::sleep(self.interval).await;
            }
            self.polled = true;

            let snapshot = self
                .source
                .snapshot(&self.response_id)
                .await
                .map_err(FeedError::Snapshot)?;
            let batch = self.diff(snapshot);
            if !batch.is_empty() {
                return Ok(batch);
            }
        }
    }
}

/// Push first, pull once push lags or closes early
pub struct ResilientFeed {
    push: Option<PushFeed>,
    pull: Option<PullFeed>,
    source: Arc<dyn SnapshotSource>,
    response_id: String,
    interval: Duration,
}

impl ResilientFeed {
    pub fn new(
        subscription: PushSubscription,
        source: Arc<dyn SnapshotSource>,
        response_id: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            push: Some(PushFeed::new(subscription)),
            pull: None,
            source,
            response_id: response_id.into(),
            interval,
        }
    }

    /// Whether the feed has degraded to polling
    #[allow(dead_code)] // Used in tests
    pub fn is_pulling(&self) -> bool {
        self.pull.is_some()
    }
}

#[async_trait]
impl TurnFeed for ResilientFeed {
    async fn next_batch(&mut self) -> Result<Vec<TurnEvent>, FeedError> {
        if let Some(push) = self.push.as_mut() {
            match push.next_batch().await {
                Ok(batch) => return Ok(batch),
                Err(e) => {
                    tracing::info!(
                        response_id = %self.response_id,
                        reason = %e,
                        "Push feed degraded, falling back to polling"
                    );
                }
            }
            if let Some(push) = self.push.take() {
                self.pull = Some(PullFeed::seeded(
                    self.source.clone(),
                    self.response_id.clone(),
                    self.interval,
                    push.delivered,
                ));
            }
        }

        match self.pull.as_mut() {
            Some(pull) => pull.next_batch().await,
            None => Ok(Vec::new()),
        }
    }
}
