//! RPC endpoint handlers.
//!
//! Handlers only route: enqueueing is a fast durable write, so a reply never
//! waits on the SMTP relay.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::router::{MailRouter, SendEmailRequest, SendEmailResponse};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub router: MailRouter,
}

impl AppState {
    pub fn new(router: MailRouter) -> Self {
        Self { router }
    }
}

/// Build the HTTP application.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/rpc/send_email", post(send_email))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub mailboxes: usize,
    pub running: usize,
}

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let registry = state.router.registry();
    let running = registry.workers().filter(|w| w.is_running()).count();

    Json(HealthResponse {
        status: if running == registry.len() { "ok" } else { "degraded" },
        mailboxes: registry.len(),
        running,
    })
}

// =============================================================================
// send_email
// =============================================================================

pub async fn send_email(
    State(state): State<AppState>,
    Json(request): Json<SendEmailRequest>,
) -> Json<SendEmailResponse> {
    info!(
        mailbox = %request.key,
        recipients = request.recipients.len(),
        has_html = request.html.is_some(),
        "rpc_send_email_received"
    );

    let outcome = state.router.send_email(&request).await;
    Json(outcome.into())
}
