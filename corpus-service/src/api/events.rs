//! Server-sent event stream of job progress and document status changes.

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt, future};
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::api::AppState;

/// GET /api/events
///
/// Slow subscribers skip events they lagged behind on rather than
/// disconnecting.
pub async fn events_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let stream = BroadcastStream::new(state.service.events.subscribe())
        .filter_map(|message| {
            future::ready(match message {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged");
                    None
                }
            })
        })
        .map(|event| Event::default().event(event.kind()).json_data(&event));

    Sse::new(stream).keep_alive(KeepAlive::default())
}
