//! HTTP API
//!
//! Chat submission, response feeds over SSE and WebSocket, snapshots and
//! cancellation.

mod handlers;
mod sse;
mod types;
mod ws;

pub use handlers::create_router;

use crate::llm::ModelClient;
use crate::runtime::{GenerationManager, GenerationSettings, ToolResolver, TurnStore};
use crate::transport::TurnPublisher;
use std::sync::Arc;
use std::time::Duration;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<GenerationManager>,
    pub publisher: Arc<TurnPublisher>,
    pub store: Arc<dyn TurnStore>,
    pub resolver: Arc<dyn ToolResolver>,
    /// Pull feed polling interval
    pub poll_interval: Duration,
}

impl AppState {
    pub fn new(
        model: Arc<dyn ModelClient>,
        store: Arc<dyn TurnStore>,
        resolver: Arc<dyn ToolResolver>,
        settings: GenerationSettings,
        poll_interval: Duration,
        retention: Duration,
    ) -> Self {
        let publisher = Arc::new(TurnPublisher::new(store.clone(), retention));
        let manager = Arc::new(GenerationManager::new(
            model,
            store.clone(),
            resolver.clone(),
            publisher.clone(),
            settings,
        ));
        Self {
            manager,
            publisher,
            store,
            resolver,
            poll_interval,
        }
    }
}
