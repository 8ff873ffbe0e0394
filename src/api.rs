use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::events::EventBus;
use crate::session::{SessionHandle, SessionView};

// ─── AppState ───────────────────────────────────────────────────────────────

pub struct AppState {
    pub session: SessionHandle,
    pub event_bus: EventBus,
}

// ─── Router ─────────────────────────────────────────────────────────────────

/// Local control API a UI process binds to.
pub fn router(state: Arc<AppState>, allowed_origins: &str) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/session", get(get_session))
        .route("/v1/session/mic", post(toggle_mic))
        .route("/v1/session/video", post(toggle_video))
        .route("/v1/session/screen", post(toggle_screen_share))
        .route("/v1/session/leave", post(leave_session))
        .route("/v1/session/events", get(crate::sse::session_events))
        .fallback(not_found_handler)
        .layer(middleware::from_fn(version_header_middleware))
        .layer(build_cors_layer(allowed_origins))
        .with_state(state)
}

// ─── Health endpoint ────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let view = state.session.view();
    let connected = view
        .peer_states
        .values()
        .filter(|s| **s == crate::peer::PeerState::Connected)
        .count();

    Json(serde_json::json!({
        "status": if view.closed { "closed" } else { "ok" },
        "version": env!("CARGO_PKG_VERSION"),
        "meeting_id": view.meeting_id,
        "participants": view.participants.len(),
        "peers_connected": connected,
    }))
}

// ---------------------------------------------------------------------------
// GET /v1/session
// ---------------------------------------------------------------------------

pub async fn get_session(State(state): State<Arc<AppState>>) -> Json<SessionView> {
    Json(state.session.view())
}

// ---------------------------------------------------------------------------
// POST /v1/session/{mic,video,screen}: toggles returning the new view
// ---------------------------------------------------------------------------

pub async fn toggle_mic(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SessionView>, ApiError> {
    let view = state.session.toggle_mic().await?;
    info!(mic_on = view.is_mic_on, "mic toggled via API");
    Ok(Json(view))
}

pub async fn toggle_video(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SessionView>, ApiError> {
    let view = state.session.toggle_video().await?;
    info!(video_on = view.is_video_on, "video toggled via API");
    Ok(Json(view))
}

pub async fn toggle_screen_share(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SessionView>, ApiError> {
    let view = state.session.toggle_screen_share().await?;
    info!(sharing = view.is_screen_sharing, "screen share toggled via API");
    Ok(Json(view))
}

// ---------------------------------------------------------------------------
// POST /v1/session/leave
// ---------------------------------------------------------------------------

pub async fn leave_session(State(state): State<Arc<AppState>>) -> Result<StatusCode, ApiError> {
    state.session.leave_meeting().await?;
    info!("session left via API");
    Ok(StatusCode::NO_CONTENT)
}

async fn not_found_handler(uri: axum::http::Uri) -> ApiError {
    ApiError::not_found(format!("no route for {uri}"))
}

// ─── Version header middleware ──────────────────────────────────────────────

async fn version_header_middleware(request: Request, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        HeaderName::from_static("x-meetmesh-version"),
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    response
}

// ─── CORS configuration ────────────────────────────────────────────────────

fn build_cors_layer(allowed_origins: &str) -> CorsLayer {
    if allowed_origins == "*" {
        warn!("CORS: permissive mode (allow all origins)");
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = s, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    info!("CORS: restricted to {} origin(s)", origins.len());

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([HeaderName::from_static("content-type")])
}

// ─── Tests ──────────────────────────────────────────────────────────────────
