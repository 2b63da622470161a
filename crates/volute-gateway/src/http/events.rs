//! The live event stream (`GET /api/events`) and the activity log.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::warn;

use crate::app::AppState;
use crate::error::ApiResult;
use volute_events::SequencedEvent;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Replay events with ids greater than this.
    #[serde(default)]
    pub since: Option<u64>,
}

fn to_sse(event: &SequencedEvent) -> Event {
    Event::default()
        .id(event.id.to_string())
        .event(event.event.clone())
        .data(event.data.to_string())
}

/// GET /api/events. Replays the in-window tail after `since` (or the
/// standard `Last-Event-ID` reconnect header), then streams live events in
/// id order without gaps or duplicates.
pub async fn event_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let last_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .or(query.since)
        .unwrap_or(0);

    // Subscribe before snapshotting the ring so nothing falls in between.
    let mut rx = state.bus.subscribe();
    let replay = state.bus.events_since(last_id);

    let stream = async_stream::stream! {
        let mut last = last_id;
        for event in &replay {
            last = event.id;
            yield Ok(to_sse(event));
        }
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if event.id <= last {
                        continue;
                    }
                    last = event.id;
                    yield Ok(to_sse(&event));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "SSE subscriber lagged, refilling from ring");
                    for event in state.bus.events_since(last) {
                        last = event.id;
                        yield Ok(to_sse(&event));
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)))
}

#[derive(Debug, Deserialize)]
pub struct TypingSignal {
    pub channel: String,
    #[serde(default)]
    pub sender: Option<String>,
    /// Persistent entries never expire; connector bridges use them for
    /// presence that they clear explicitly.
    #[serde(default)]
    pub persistent: bool,
}

/// POST /api/typing. Records a typing signal and notifies the channel's
/// subscribers.
pub async fn set_typing(
    State(state): State<Arc<AppState>>,
    axum::Extension(user): axum::Extension<crate::auth::AuthUser>,
    Json(signal): Json<TypingSignal>,
) -> ApiResult<Json<serde_json::Value>> {
    let sender = signal.sender.unwrap_or_else(|| user.0.username.clone());
    state.typing.set(&signal.channel, &sender, signal.persistent);
    crate::bootstrap::publish_typing(&state, &signal.channel);
    Ok(Json(serde_json::json!({
        "channel": signal.channel,
        "senders": state.typing.get(&signal.channel),
    })))
}

/// DELETE /api/typing/{sender}. Drops the sender from every channel and
/// notifies each affected channel's subscribers.
pub async fn clear_typing(
    State(state): State<Arc<AppState>>,
    axum::extract::Path(sender): axum::extract::Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let affected = state.typing.delete_sender(&sender);
    for channel in &affected {
        crate::bootstrap::publish_typing(&state, channel);
    }
    Ok(Json(serde_json::json!({ "affected": affected })))
}

#[derive(Debug, Deserialize)]
pub struct ActivityQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

/// GET /api/activity. Recent persisted activity, newest first.
pub async fn recent_activity(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ActivityQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let rows = state
        .store
        .recent_activity(query.limit.unwrap_or(50).min(500))?;
    Ok(Json(serde_json::json!({ "activity": rows })))
}
