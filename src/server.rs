//! Inbound webhook server.
//!
//! One POST endpoint receives the provider's inbound-SMS callback and runs
//! it through the processor; the reply rides back in the HTTP response.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::phone;
use crate::processor::{InboundMessage, MessageProcessor};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<MessageProcessor>,
}

/// Build the Axum router with the inbound webhook and health routes.
pub fn routes(processor: Arc<MessageProcessor>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/inbound", post(inbound))
        .layer(cors)
        .with_state(AppState { processor })
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// POST /inbound
///
/// Accepts `{phone, message, role?, model?}`, normalizes the phone, and
/// returns the processed reply. Malformed phones are a 400 — the provider
/// retries those nowhere.
async fn inbound(
    State(state): State<AppState>,
    Json(mut payload): Json<InboundMessage>,
) -> impl IntoResponse {
    let Some(normalized) = phone::normalize(&payload.phone) else {
        warn!(phone = %payload.phone, "Rejected inbound with unusable phone");
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "invalid phone number"})),
        )
            .into_response();
    };
    payload.phone = normalized;

    let reply = state.processor.process(payload).await;
    Json(reply).into_response()
}
