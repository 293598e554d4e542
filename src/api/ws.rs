//! Duplex WebSocket connection for one session
//!
//! The client submits messages and cancels over the socket; turn events of
//! every generation it started are pushed back. Closing the socket cancels
//! those generations.

use super::types::{ClientMessage, ServerMessage};
use super::AppState;
use crate::runtime::StartError;
use crate::transport::{ResilientFeed, TurnFeed};
use axum::extract::ws::{Message, WebSocket};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

const OUTBOUND_CAPACITY: usize = 64;

fn encode<T: Serialize>(message: &T) -> Option<Message> {
    match serde_json::to_string(message) {
        Ok(json) => Some(Message::Text(json)),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode socket message");
            None
        }
    }
}

async fn send<T: Serialize>(out: &mpsc::Sender<Message>, message: &T) {
    if let Some(message) = encode(message) {
        let _ = out.send(message).await;
    }
}

/// Generations this socket started
#[derive(Default)]
struct Started {
    tokens: Vec<CancellationToken>,
    forwarders: Vec<JoinHandle<()>>,
}

pub async fn serve(socket: WebSocket, state: AppState, session_id: String) {
    tracing::info!(session_id = %session_id, "Socket connected");
    let (sink, mut stream) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);

    let writer = tokio::spawn(async move {
        let sent = ReceiverStream::new(out_rx)
            .map(Ok::<Message, axum::Error>)
            .forward(sink)
            .await;
        if let Err(e) = sent {
            tracing::debug!(error = %e, "Socket writer stopped");
        }
    });

    let mut started = Started::default();
    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Chat { message }) => {
                handle_chat(&state, &session_id, &message, &out_tx, &mut started).await;
            }
            Ok(ClientMessage::Cancel) => {
                state.manager.cancel_session(&session_id).await;
            }
            Err(e) => {
                send(
                    &out_tx,
                    &ServerMessage::Rejected {
                        message: format!("invalid message: {e}"),
                    },
                )
                .await;
            }
        }
    }

    // Disconnect cancels everything this socket started
    for token in &started.tokens {
        token.cancel();
    }
    for forwarder in started.forwarders {
        forwarder.abort();
    }
    writer.abort();
    tracing::info!(
        session_id = %session_id,
        cancelled = started.tokens.len(),
        "Socket disconnected"
    );
}

async fn handle_chat(
    state: &AppState,
    session_id: &str,
    message: &str,
    out: &mpsc::Sender<Message>,
    started: &mut Started,
) {
    if message.trim().is_empty() {
        send(
            out,
            &ServerMessage::Rejected {
                message: "message must not be empty".to_string(),
            },
        )
        .await;
        return;
    }

    let generation = match state
        .manager
        .start(Some(session_id.to_string()), message)
        .await
    {
        Ok(generation) => generation,
        Err(e) => {
            if matches!(e, StartError::Storage(_)) {
                tracing::error!(session_id = %session_id, error = %e, "Socket chat failed to start");
            }
            send(out, &ServerMessage::Rejected { message: e.to_string() }).await;
            return;
        }
    };

    // Subscribe before acknowledging so no event is missed
    let subscription = state.publisher.subscribe(&generation.response_id);
    send(
        out,
        &ServerMessage::Accepted {
            session_id: generation.session_id.clone(),
            round_id: generation.round_id.clone(),
            response_id: generation.response_id.clone(),
        },
    )
    .await;

    started.tokens.push(generation.cancel.clone());
    let Some(subscription) = subscription else {
        return;
    };
    let feed = ResilientFeed::new(
        subscription,
        state.publisher.clone(),
        generation.response_id.clone(),
        state.poll_interval,
    );
    let out = out.clone();
    started.forwarders.push(tokio::spawn(forward(feed, out)));
}

async fn forward(mut feed: impl TurnFeed, out: mpsc::Sender<Message>) {
    loop {
        let batch = match feed.next_batch().await {
            Ok(batch) if batch.is_empty() => return,
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!(error = %e, "Socket feed failed");
                return;
            }
        };
        for event in &batch {
            let Some(message) = encode(event) else {
                continue;
            };
            if out.send(message).await.is_err() {
                return;
            }
        }
    }
}
