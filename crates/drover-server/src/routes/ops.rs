//! Ops endpoints at the server root: service metadata, health, queue
//! stats, and the Prometheus exposition.

use axum::Json;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;

use drover_db::queries::{tasks, workers};

use crate::error::ApiError;
use crate::state::AppState;

/// `GET /` -- service metadata.
pub async fn index() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "drover",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Durable task-execution service for AIOpsLab problem runs",
        "api_base": "/api/v1",
    }))
}

/// `GET /health` -- liveness plus a database ping.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.pool)
        .await
    {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "ok", "database": "up"})),
        ),
        Err(e) => {
            tracing::error!(error = %e, "health check database ping failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({"status": "degraded", "database": "down"})),
            )
        }
    }
}

/// `GET /queue/stats` -- task counts by status plus worker counts.
pub async fn queue_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let task_stats = tasks::task_stats(&state.pool).await?;
    let worker_counts = workers::worker_counts(&state.pool).await?;

    Ok(Json(serde_json::json!({
        "tasks": task_stats,
        "workers": worker_counts,
    })))
}

/// `GET /metrics` -- Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    // Queue-depth gauges reflect the store at scrape time.
    let stats = tasks::task_stats(&state.pool).await?;
    crate::metrics::record_queue_depth(&stats);

    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
