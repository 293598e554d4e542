//! toolchat - streaming tool-augmented chat coordinator
//!
//! Streams model output, runs the tools it asks for through tool servers
//! and publishes turn-level progress to observers.

mod api;
mod config;
mod db;
mod extractor;
mod llm;
mod orchestrator;
mod runtime;
mod state_machine;
mod system_prompt;
mod tools;
mod transport;

use api::{create_router, AppState};
use config::Config;
use db::Database;
use llm::{AnthropicService, LoggingModelClient, ModelClient};
use runtime::{DatabaseStorage, ToolResolver, TurnStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tools::{BuiltinToolServer, HttpToolServer, ToolServer, ToolServerRegistry};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "toolchat=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Config::from_env()?;

    // Ensure database directory exists
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.db_path.display(), "Opening database");
    let db = Database::open(&config.db_path)?;
    let reset = db.reset_streaming_rounds()?;
    if reset > 0 {
        tracing::warn!(rounds = reset, "Marked rounds interrupted by a restart as failed");
    }
    let store: Arc<dyn TurnStore> = Arc::new(DatabaseStorage::new(db));

    // Tool servers: builtin first so its names win
    let mut servers: Vec<Arc<dyn ToolServer>> =
        vec![Arc::new(BuiltinToolServer::standard(config.workspace.clone()))];
    for server in &config.tool_servers {
        match HttpToolServer::new(server.id.clone(), server.url.clone()) {
            Ok(http) => servers.push(Arc::new(http)),
            Err(e) => tracing::warn!(server = %server.id, error = %e, "Skipping tool server"),
        }
    }
    let registry = ToolServerRegistry::build(servers).await;
    let resolver: Arc<dyn ToolResolver> = Arc::new(registry);
    tracing::info!(
        tools = ?resolver.list_tools().iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
        "Tool registry initialized"
    );

    let api_key = match (&config.anthropic_api_key, &config.gateway) {
        (Some(key), _) => key.clone(),
        // The gateway authenticates on our behalf
        (None, Some(_)) => "implicit".to_string(),
        (None, None) => {
            return Err("No LLM credentials configured. Set ANTHROPIC_API_KEY or LLM_GATEWAY.".into());
        }
    };
    let anthropic = AnthropicService::new(api_key, config.model.clone(), config.gateway.as_deref())?;
    let model: Arc<dyn ModelClient> = Arc::new(LoggingModelClient::new(Arc::new(anthropic)));
    tracing::info!(model = %config.model, gateway = ?config.gateway, "Model client initialized");

    let state = AppState::new(
        model,
        store,
        resolver,
        config.generation_settings(),
        config.poll_interval,
        config.retention,
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compression = CompressionLayer::new()
        .gzip(true)
        .br(true)
        .deflate(true)
        .zstd(true);

    let app = create_router(state)
        .layer(cors)
        .layer(compression)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("toolchat server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
