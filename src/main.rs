use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use meetmesh::api::{self, AppState};
use meetmesh::config::Config;
use meetmesh::events::EventBus;
use meetmesh::media::SyntheticDevices;
use meetmesh::session::{self, SessionDeps, SessionHandle};
use meetmesh::transport::WebrtcTransportFactory;
use meetmesh::{store, telemetry};

// ─── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────────────
    // Load .env before anything else so MEETMESH_LOG_LEVEL is available.
    let _ = dotenvy::dotenv();
    let log_level = std::env::var("MEETMESH_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let log_json = std::env::var("MEETMESH_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    telemetry::init_tracing(&log_level, log_json);

    let cfg = Config::from_env();

    // ── Store ───────────────────────────────────────────────────────────
    let stores = store::open(&cfg.store_url, cfg.store_retry.clone())
        .await
        .context("opening presence store")?;

    // ── Media and transports ────────────────────────────────────────────
    let transports = Arc::new(
        WebrtcTransportFactory::new(&cfg.ice_servers()).context("building WebRTC API")?,
    );
    let devices = Arc::new(SyntheticDevices::new(cfg.identity.id.clone()));

    // ── Join ────────────────────────────────────────────────────────────
    let event_bus = EventBus::new();
    let deps = SessionDeps {
        presence: stores.presence,
        signaling: stores.signaling,
        devices,
        transports,
        events: event_bus.clone(),
    };
    let session = session::join(cfg.session_config(), deps)
        .await
        .with_context(|| format!("joining meeting '{}'", cfg.meeting_id))?;

    // ── Control API ─────────────────────────────────────────────────────
    let state = Arc::new(AppState {
        session: session.clone(),
        event_bus,
    });
    let app = api::router(state, &cfg.allowed_origins);

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("binding {}", cfg.bind_addr))?;
    info!("meetmesh control API listening on http://{}", cfg.bind_addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(session.clone()))
        .await;
    if let Err(e) = &served {
        error!("control API stopped: {e}");
    }

    session.leave_meeting().await?;
    info!("meetmesh stopped");
    served.context("serving control API")
}

/// Resolves on Ctrl-C, after the session has left. Leaving first closes open
/// SSE streams so graceful shutdown can finish.
async fn shutdown_signal(session: SessionHandle) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("could not listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    info!("Ctrl-C received, leaving meeting");
    if let Err(e) = session.leave_meeting().await {
        error!("leaving meeting failed: {e}");
    }
}
