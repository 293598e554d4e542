//! Turn-level progress delivery
//!
//! The [`TurnPublisher`] is the hub every generation reports into. Observers
//! read from it through a [`TurnFeed`]: live push over a broadcast channel,
//! snapshot polling, or push that degrades to polling when it falls behind.

mod feed;
mod publisher;

pub use feed::{FeedError, FeedMode, PullFeed, PushFeed, ResilientFeed, SnapshotSource, TurnFeed};
pub use publisher::{PushSubscription, Snapshot, TurnProgress, TurnPublisher};

use crate::db::Turn;
use serde::Serialize;

/// Event delivered to observers of one response
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    Start { session_id: String },
    Update { turn: Turn },
    Complete { session_id: String },
    Error { message: String },
}

impl TurnEvent {
    /// Nothing follows a terminal event for the same response
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnEvent::Complete { .. } | TurnEvent::Error { .. })
    }

    /// SSE event name
    pub fn event_type(&self) -> &'static str {
        match self {
            TurnEvent::Start { .. } => "start",
            TurnEvent::Update { .. } => "update",
            TurnEvent::Complete { .. } => "complete",
            TurnEvent::Error { .. } => "error",
        }
    }
}
