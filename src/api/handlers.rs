//! HTTP request handlers

use super::sse::feed_stream;
use super::types::{
    CancelResponse, ChatRequest, ChatResponse, ErrorResponse, RoundsResponse, StreamQuery,
    ToolsResponse,
};
use super::{ws, AppState};
use crate::runtime::StartError;
use crate::transport::{FeedMode, PullFeed, ResilientFeed, Snapshot, TurnFeed};
use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(send_chat))
        .route("/api/responses/:id/stream", get(stream_response))
        .route("/api/responses/:id/turns", get(get_turns))
        .route("/api/responses/:id/cancel", post(cancel_response))
        .route("/api/sessions/:id/ws", get(session_socket))
        .route("/api/sessions/:id/rounds", get(list_rounds))
        .route("/api/tools", get(list_tools))
        .route("/version", get(get_version))
        .with_state(state)
}

// ============================================================
// Chat
// ============================================================

async fn send_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    if req.message.trim().is_empty() {
        return Err(AppError::BadRequest("message must not be empty".to_string()));
    }

    let started = state
        .manager
        .start(req.session_id, &req.message)
        .await
        .map_err(|e| match e {
            StartError::Busy(_) => AppError::Conflict(e.to_string()),
            StartError::Storage(_) => AppError::Internal(e.to_string()),
        })?;

    Ok(Json(ChatResponse {
        session_id: started.session_id,
        round_id: started.round_id,
        response_id: started.response_id,
    }))
}

async fn session_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| ws::serve(socket, state, session_id))
}

// ============================================================
// Response feeds
// ============================================================

async fn stream_response(
    State(state): State<AppState>,
    Path(response_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Result<impl IntoResponse, AppError> {
    let push = match FeedMode::negotiate(query.transport, state.publisher.is_live(&response_id)) {
        FeedMode::Push => state.publisher.subscribe(&response_id),
        FeedMode::Pull => None,
    };

    let feed: Box<dyn TurnFeed> = if let Some(subscription) = push {
        tracing::debug!(response_id = %response_id, "Serving push feed");
        Box::new(ResilientFeed::new(
            subscription,
            state.publisher.clone(),
            response_id,
            state.poll_interval,
        ))
    } else {
        // Fail fast on unknown responses instead of streaming errors
        state
            .publisher
            .snapshot(&response_id)
            .await
            .map_err(AppError::NotFound)?;
        tracing::debug!(response_id = %response_id, "Serving pull feed");
        Box::new(PullFeed::new(
            state.publisher.clone(),
            response_id,
            state.poll_interval,
        ))
    };

    Ok(feed_stream(feed))
}

async fn get_turns(
    State(state): State<AppState>,
    Path(response_id): Path<String>,
) -> Result<Json<Snapshot>, AppError> {
    let snapshot = state
        .publisher
        .snapshot(&response_id)
        .await
        .map_err(AppError::NotFound)?;
    Ok(Json(snapshot))
}

async fn cancel_response(
    State(state): State<AppState>,
    Path(response_id): Path<String>,
) -> Json<CancelResponse> {
    let ok = state.manager.cancel_response(&response_id).await;
    Json(CancelResponse { ok })
}

// ============================================================
// Sessions and tools
// ============================================================

async fn list_rounds(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<RoundsResponse>, AppError> {
    let rounds = state
        .store
        .list_rounds(&session_id)
        .await
        .map_err(AppError::Internal)?;
    Ok(Json(RoundsResponse { rounds }))
}

async fn list_tools(State(state): State<AppState>) -> Json<ToolsResponse> {
    Json(ToolsResponse {
        tools: state.resolver.list_tools(),
    })
}

async fn get_version() -> &'static str {
    concat!("toolchat ", env!("CARGO_PKG_VERSION"))
}

// ============================================================
// Error Handling
// ============================================================

enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}
