use crate::metrics::IngestMetrics;
use crate::write_queue::PendingGauge;
use anyhow::{anyhow, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone)]
pub struct HealthState {
    pub metrics: Arc<IngestMetrics>,
    pub pending: PendingGauge,
    pub draining: Arc<AtomicBool>,
}

pub async fn run_health_server(
    port: u16,
    state: HealthState,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|err| anyhow!("failed to bind health server on port {port}: {err}"))?;
    info!("health server listening on port {port}");
    serve(listener, state, shutdown).await
}

pub async fn serve(
    listener: TcpListener,
    state: HealthState,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .fallback(not_found)
        .with_state(state)
}

async fn health(State(state): State<HealthState>) -> Response {
    let snapshot = state.metrics.snapshot(state.pending.pending());
    let status = if state.draining.load(Ordering::Relaxed) {
        "draining"
    } else {
        "ok"
    };
    Json(json!({
        "status": status,
        "uptime": snapshot.uptime_seconds,
        "totalInserted": snapshot.total_inserted,
        "throughputEps": snapshot.throughput_eps,
        "activeWorkers": snapshot.active_workers,
    }))
    .into_response()
}

async fn metrics(State(state): State<HealthState>) -> Response {
    let snapshot = state.metrics.snapshot(state.pending.pending());
    Json(snapshot).into_response()
}

async fn not_found() -> Response {
    StatusCode::NOT_FOUND.into_response()
}
