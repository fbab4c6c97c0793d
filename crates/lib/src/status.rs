//! Status HTTP endpoint: `GET /` for health probes, `GET /stats` for consumer and session counters.

use crate::consumer::ConsumerStats;
use crate::limiter::ConcurrencyLimiter;
use crate::session::SessionStore;
use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Json, Router};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct StatusState {
    pub stats: Arc<ConsumerStats>,
    pub store: Arc<SessionStore>,
    pub limiter: ConcurrencyLimiter,
    pub inbound_queue: String,
    pub outbound_queue: String,
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/stats", get(stats_http))
        .with_state(state)
}

/// Serve until `shutdown` fires.
pub async fn run_status_server(
    bind: &str,
    port: u16,
    state: StatusState,
    shutdown: CancellationToken,
) -> Result<()> {
    let bind_addr = format!("{}:{}", bind, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("status: listening on {}", bind_addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("status server exited")?;
    log::info!("status: stopped");
    Ok(())
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<StatusState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "inboundQueue": state.inbound_queue,
        "outboundQueue": state.outbound_queue,
        "maxConcurrent": state.limiter.capacity(),
    }))
}

async fn stats_http(State(state): State<StatusState>) -> Json<serde_json::Value> {
    let sessions = state.store.stats().await;
    Json(json!({
        "consumer": state.stats.snapshot(),
        "inFlight": state.limiter.in_flight(),
        "waiting": state.limiter.queued(),
        "sessions": sessions,
    }))
}
