//! Embeddable HTTP healthcheck endpoints.
//!
//! `GET /live` answers 200 while the process is up. `GET /ready` checks
//! that the database answers and that this worker's heartbeat is younger
//! than the configured threshold; 503 otherwise.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{Value, json};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use workhorse_core::WorkerId;
use workhorse_db::repo::WorkerRepo;

use crate::error::WorkerResult;

#[derive(Clone)]
pub struct HealthState {
    pool: PgPool,
    records: Arc<dyn WorkerRepo>,
    worker_id: WorkerId,
    heartbeat_timeout: Duration,
}

impl HealthState {
    pub fn new(
        pool: PgPool,
        records: Arc<dyn WorkerRepo>,
        worker_id: WorkerId,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            records,
            worker_id,
            heartbeat_timeout,
        }
    }
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/live", get(live))
        .route("/ready", get(ready))
        .with_state(state)
}

/// Serve the healthcheck endpoints until the token is cancelled.
pub async fn serve(
    addr: SocketAddr,
    state: HealthState,
    shutdown: CancellationToken,
) -> WorkerResult<()> {
    let app = router(state).layer(tower_http::trace::TraceLayer::new_for_http());
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "healthcheck endpoint listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn live() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn ready(State(state): State<HealthState>) -> (StatusCode, Json<Value>) {
    if !workhorse_db::connection_active(&state.pool).await {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "database unreachable" })),
        );
    }
    let record = match state.records.find(state.worker_id).await {
        Ok(Some(record)) => record,
        _ => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "worker record missing" })),
            );
        }
    };
    let age = Utc::now() - record.last_heartbeat_at;
    if age.to_std().unwrap_or(Duration::ZERO) > state.heartbeat_timeout {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "heartbeat stale",
                "last_heartbeat_at": record.last_heartbeat_at.to_rfc3339(),
            })),
        );
    }
    (StatusCode::OK, Json(json!({ "status": "ready" })))
}
