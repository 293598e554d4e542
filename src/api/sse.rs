//! Server-Sent Events support

use crate::transport::{TurnEvent, TurnFeed};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;

/// Drain a feed into an SSE response; the stream ends after the terminal event
///
/// SSE readers only observe: a dropped stream stops the feed but leaves the
/// generation running. Cancellation belongs to the socket that started it or
/// to the explicit cancel route.
pub fn feed_stream(
    feed: Box<dyn TurnFeed>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let batches = stream::unfold(Some(feed), |feed| async move {
        let mut feed = feed?;
        match feed.next_batch().await {
            Ok(batch) if batch.is_empty() => None,
            Ok(batch) => {
                let events: Vec<Event> = batch.iter().map(turn_event_to_axum).collect();
                Some((events, Some(feed)))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Feed failed, closing SSE stream");
                let event = Event::default()
                    .event("feed_error")
                    .data(json!({"type": "feed_error", "message": e.to_string()}).to_string());
                Some((vec![event], None))
            }
        }
    });

    let events = batches.flat_map(stream::iter).map(Ok);

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn turn_event_to_axum(event: &TurnEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|e| {
        json!({"type": "error", "message": format!("unserializable event: {e}")}).to_string()
    });
    Event::default().event(event.event_type()).data(data)
}
