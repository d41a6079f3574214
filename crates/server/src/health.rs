//! Operational surface: readiness probe plus queue depth counters.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;
use winback_core::domain::job::{JobKind, QueueStats};
use winback_db::repositories::QueueRepository;
use winback_db::DbPool;

#[derive(Clone)]
pub struct OpsState {
    pub db_pool: DbPool,
    pub queue: Arc<dyn QueueRepository>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub checked_at: String,
}

/// Depth counters per queue, straight from storage. `waiting` jobs are
/// runnable now; `delayed` jobs have a backoff deadline in the future.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueueStatsResponse {
    pub inbound: QueueStats,
    pub outbound: QueueStats,
    pub checked_at: String,
}

#[derive(Debug, Serialize)]
pub struct OpsError {
    pub error: String,
}

pub fn router(state: OpsState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ops/queues", get(queue_stats))
        .with_state(state)
}

pub async fn health(State(state): State<OpsState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let ready = database.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        service: HealthCheck {
            status: "ready",
            detail: "winback-server runtime initialized".to_string(),
        },
        database,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

pub async fn queue_stats(
    State(state): State<OpsState>,
) -> Result<Json<QueueStatsResponse>, (StatusCode, Json<OpsError>)> {
    let now = Utc::now();
    let inbound = fetch_stats(&state, JobKind::InboundMessage, now).await?;
    let outbound = fetch_stats(&state, JobKind::OutboundDelivery, now).await?;
    Ok(Json(QueueStatsResponse { inbound, outbound, checked_at: now.to_rfc3339() }))
}

async fn fetch_stats(
    state: &OpsState,
    kind: JobKind,
    now: DateTime<Utc>,
) -> Result<QueueStats, (StatusCode, Json<OpsError>)> {
    state.queue.stats(kind, now).await.map_err(|error| {
        warn!(
            event_name = "ops.queue_stats_failed",
            kind = kind.as_str(),
            error = %error,
            "queue counters could not be read"
        );
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(OpsError { error: format!("queue counters unavailable: {error}") }),
        )
    })
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}
