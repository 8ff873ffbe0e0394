// src/sse.rs
//
// Server-Sent Events endpoint of the local control API.
//
// ─ Usage ────────────────────────────────────────────────────────────────────
//
//   GET /v1/session/events
//
//   The connection stays open and streams, as they occur:
//     event: view        -- the full SessionView, on every change
//                            (and once on connect)
//     event: <type>      -- lifecycle events from the EventBus,
//                            e.g. "peer.dropped"
//
//   Optional query parameters:
//     types     -- comma-separated event types to receive
//                  (e.g. "view,participant.joined"). Omit for all.
//
// ─ Implementation ───────────────────────────────────────────────────────────
//
//   The handler holds a `watch::Receiver<SessionView>` and an `EventBus`
//   subscription and selects over both. A closed session ends the stream
//   after its final view frame.
//
// ────────────────────────────────────────────────────────────────────────────

use axum::{
    extract::{Query, State},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
};
use futures::stream::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::api::AppState;
use crate::events::{EventType, MeetingEvent};
use crate::session::SessionView;

const VIEW_EVENT: &str = "view";

// ─── Query parameters ───────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct SseQuery {
    /// Comma-separated list of event types. Example: "view,peer.dropped"
    pub types: Option<String>,
}

impl SseQuery {
    fn requested(&self) -> Option<Vec<String>> {
        self.types.as_ref().map(|s| {
            s.split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect()
        })
    }

    fn wants_views(&self) -> bool {
        match self.requested() {
            Some(types) if !types.is_empty() => types.iter().any(|t| t == VIEW_EVENT),
            _ => true,
        }
    }

    /// Returns `true` if the event matches this query's filter.
    fn matches(&self, event_type: EventType) -> bool {
        match self.requested() {
            Some(types) if !types.is_empty() => types.iter().any(|t| t == event_type.as_str()),
            _ => true,
        }
    }
}

enum Next {
    /// `false` once the session's view channel is gone.
    View(bool),
    Event(Result<MeetingEvent, RecvError>),
}

fn view_frame(view: &SessionView) -> Option<SseEvent> {
    match serde_json::to_string(view) {
        Ok(json) => Some(SseEvent::default().event(VIEW_EVENT).data(json)),
        Err(e) => {
            warn!("SSE: failed to serialize view: {e}");
            None
        }
    }
}

fn event_frame(event: &MeetingEvent) -> Option<SseEvent> {
    match serde_json::to_string(event) {
        Ok(json) => Some(
            SseEvent::default()
                .event(event.event_type.as_str())
                .id(event.id.clone())
                .data(json),
        ),
        Err(e) => {
            warn!("SSE: failed to serialize event: {e}");
            None
        }
    }
}

// ─── SSE handler ────────────────────────────────────────────────────────────

/// `GET /v1/session/events` -- SSE stream of view changes and lifecycle
/// events, with a heartbeat comment every 15 seconds.
pub async fn session_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SseQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let mut views = state.session.watch();
    let mut events = state.event_bus.subscribe();

    info!(types = query.types.as_deref().unwrap_or("*"), "SSE client connected");

    let stream = async_stream::stream! {
        let wants_views = query.wants_views();
        if wants_views {
            let current = views.borrow_and_update().clone();
            if let Some(frame) = view_frame(&current) {
                yield Ok(frame);
            }
        }

        let mut views_open = true;
        loop {
            // `yield` cannot appear inside `select!`.
            let next = tokio::select! {
                changed = views.changed(), if views_open => Next::View(changed.is_ok()),
                received = events.recv() => Next::Event(received),
            };

            match next {
                Next::View(false) => views_open = false,
                Next::View(true) => {
                    let current = views.borrow_and_update().clone();
                    if wants_views {
                        if let Some(frame) = view_frame(&current) {
                            yield Ok(frame);
                        }
                    }
                    if current.closed {
                        info!("SSE: session closed, ending stream");
                        break;
                    }
                }
                Next::Event(Ok(event)) => {
                    if !query.matches(event.event_type) {
                        continue;
                    }
                    if let Some(frame) = event_frame(&event) {
                        yield Ok(frame);
                    }
                }
                Next::Event(Err(RecvError::Lagged(n))) => {
                    warn!("SSE client lagged, skipped {n} events");
                    let warning = SseEvent::default()
                        .event("_warning")
                        .data(format!("{{\"message\":\"lagged, skipped {n} events\"}}"));
                    yield Ok(warning);
                }
                Next::Event(Err(RecvError::Closed)) => {
                    info!("SSE: event bus closed, ending stream");
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}

// ─── Tests ──────────────────────────────────────────────────────────────────
