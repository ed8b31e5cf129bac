//! Router configuration.
//!
//! # Endpoints
//!
//! - `GET /v1/session` - WebSocket upgrade for the duplex voice session
//! - `GET /healthz` - liveness probe
//!
//! # Protocol
//!
//! After the WebSocket upgrade, the client's first message must be a
//! `client.hello` envelope carrying its credential and session options:
//!
//! ```json
//! {"seq": 1, "type": "client.hello", "payload": {"credential": "tok", "session_config": {"binary_audio": true}}}
//! ```
//!
//! The server answers with `server.session.state` events (`ready`, then
//! `listening`), after which the client streams audio and the server streams
//! transcripts, audio, and triage events back.

use std::sync::Arc;

use axum::{Json, Router, routing::get};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::gateway::session_handler;
use crate::state::AppState;

/// Build the application router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = match state.config.cors_allowed_origins.as_deref() {
        Some("*") => CorsLayer::new().allow_origin(Any),
        Some(origins) => {
            let parsed: Vec<_> = origins
                .split(',')
                .filter_map(|origin| origin.trim().parse().ok())
                .collect();
            CorsLayer::new().allow_origin(parsed)
        }
        // Same-origin only; browsers block cross-origin requests.
        None => CorsLayer::new(),
    };

    Router::new()
        .route("/v1/session", get(session_handler))
        .route("/healthz", get(health_check))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Liveness probe, mirroring the workers' `/healthz` shape.
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}
