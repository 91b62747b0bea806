use anyhow::Result;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use crate::agent::config::Config;
use crate::client::decorator::CHALLENGE_HEADER;
use crate::issuer::ChallengeIssuer;
use crate::transport::{Envelope, LogEntry};

type SharedState = Arc<AppState>;

#[derive(Debug, Clone)]
pub struct AppState {
    pub issuer: ChallengeIssuer,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        Self {
            issuer: ChallengeIssuer::new(config.challenge_ttl_secs, config.challenge_capacity),
        }
    }
}

async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    let outstanding = state.issuer.store().outstanding().await;
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "challengesOutstanding": outstanding
    }))
}

// Empty body in, one challenge out
async fn challenge_handler(State(state): State<SharedState>) -> impl IntoResponse {
    let envelope = state.issuer.issue().await;
    let status = if envelope.result.is_some() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(envelope))
}

async fn verify_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let presented = headers
        .get(CHALLENGE_HEADER)
        .and_then(|value| value.to_str().ok());

    match state.issuer.verify_header(presented).await {
        Ok(challenge) => {
            let log = LogEntry::success("Challenge Verified", challenge.id.to_string());
            (
                StatusCode::OK,
                Json(Envelope::ok(json!({"$id": challenge.id}), vec![log.normalized()])),
            )
        }
        Err(e) => (
            StatusCode::UNAUTHORIZED,
            Json(Envelope::failure(
                LogEntry::error("Unauthorized", e.to_string()).normalized(),
            )),
        ),
    }
}

pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/challenge", post(challenge_handler))
        .route("/verify", post(verify_handler))
        .with_state(state)
}

pub async fn serve(config: Config, port: u16) -> Result<()> {
    let state = Arc::new(AppState::new(&config));
    let app = create_router(state).into_make_service_with_connect_info::<SocketAddr>();

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        ttl_secs = config.challenge_ttl_secs,
        capacity = config.challenge_capacity,
        "challenge server listening on {}",
        addr
    );
    axum::serve(listener, app).into_future().await?;
    Ok(())
}
