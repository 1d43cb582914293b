use super::AppState;
use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use tokio::sync::broadcast::error::RecvError;

#[derive(Deserialize)]
pub struct EventsQuery {
    /// One topic, e.g. `deploy.completed`. All topics when absent.
    pub topic: Option<String>,
    pub model: Option<String>,
}

/// Server-sent stream of bus events. Each SSE event is named after its topic
/// and carries the JSON envelope.
pub async fn stream(
    State(state): State<AppState>,
    Query(q): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = match &q.topic {
        Some(topic) => state.ops.events().subscribe(topic),
        None => state.ops.events().subscribe_all(),
    };
    let model = q.model;

    let events = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    if model.as_deref().is_some_and(|m| m != envelope.event.model_id()) {
                        continue;
                    }
                    match Event::default().event(envelope.topic.clone()).json_data(&envelope) {
                        Ok(event) => yield Ok(event),
                        Err(e) => tracing::warn!("unserializable event on {}: {}", envelope.topic, e),
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    yield Ok(Event::default().event("lagged").data(n.to_string()));
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(events).keep_alive(KeepAlive::default())
}
