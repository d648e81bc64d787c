//! Worker endpoints: registration, heartbeats, claims, completion and
//! failure reporting, stats, and the internal pool controls.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use drover_core::manager::MAX_WORKERS;
use drover_core::{queue, registry};
use drover_db::models::WorkerStatus;
use drover_db::queries::tasks;
use drover_db::queries::workers::{self, WorkerSpec};

use crate::error::ApiError;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
pub struct Capabilities {
    pub max_parallel_tasks: Option<i32>,
    pub supported_problems: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub worker_id: String,
    pub backend_type: Option<String>,
    pub capabilities: Option<Capabilities>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Default)]
pub struct HeartbeatRequest {
    pub status: Option<String>,
    pub current_task_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, Default)]
pub struct CompleteRequest {
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Default)]
pub struct FailRequest {
    pub error_details: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct ScaleQuery {
    pub num_workers: usize,
}

#[derive(Debug, Serialize)]
pub struct WorkerStatsResponse {
    pub worker_id: String,
    pub backend_type: String,
    pub status: WorkerStatus,
    pub live: bool,
    pub current_task_id: Option<Uuid>,
    pub last_heartbeat: DateTime<Utc>,
    pub tasks_completed: i64,
    pub tasks_failed: i64,
    pub registered_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Worker lifecycle handlers
// ---------------------------------------------------------------------------

/// `POST /api/v1/workers/register`.
///
/// Upserts the worker row. The identifier must match `worker-NNN-kind`.
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let capabilities = req.capabilities.unwrap_or_default();
    let spec = WorkerSpec {
        worker_id: req.worker_id,
        backend_type: req.backend_type.unwrap_or_else(|| "internal".to_string()),
        max_parallel_tasks: capabilities.max_parallel_tasks.unwrap_or(1),
        supported_problems: capabilities.supported_problems.unwrap_or_default(),
        metadata: req.metadata.unwrap_or_else(|| serde_json::json!({})),
    };

    let worker = registry::register(&state.pool, spec).await?;
    tracing::info!(worker_id = %worker.worker_id, backend_type = %worker.backend_type, "worker registered");

    Ok((StatusCode::CREATED, Json(worker)))
}

/// `GET /api/v1/workers`.
pub async fn list_workers(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let workers = workers::list_workers(&state.pool).await?;
    Ok(Json(workers))
}

/// `GET /api/v1/workers/{id}`.
pub async fn get_worker(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let worker = workers::get_worker(&state.pool, &id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("worker {id} not found")))?;

    Ok(Json(worker))
}

/// `POST /api/v1/workers/{id}/heartbeat`.
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<HeartbeatRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();

    let status = req
        .status
        .as_deref()
        .map(|s| {
            s.parse::<WorkerStatus>()
                .map_err(|e| ApiError::validation(e.to_string()))
        })
        .transpose()?
        .unwrap_or(WorkerStatus::Idle);

    let worker = registry::heartbeat(&state.pool, &id, status, req.current_task_id).await?;
    Ok(Json(worker))
}

/// `POST /api/v1/workers/{id}/claim`.
///
/// Returns `{"task": <task>}` or `{"task": null}` when nothing is
/// claimable. Refused with 503 while the service drains.
pub async fn claim(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if state.is_draining() {
        return Err(ApiError::shutdown_in_progress());
    }

    let task = queue::claim_for_worker(&state.pool, &id, &state.config).await?;
    Ok(Json(serde_json::json!({ "task": task })))
}

/// `POST /api/v1/workers/{id}/tasks/{task_id}/complete`.
///
/// Only the owning worker may complete a running task.
pub async fn complete_task(
    State(state): State<AppState>,
    Path((id, task_id)): Path<(String, Uuid)>,
    body: Option<Json<CompleteRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let result = body
        .and_then(|Json(req)| req.result)
        .unwrap_or_else(|| serde_json::json!({}));

    let task = tasks::complete_task(&state.pool, task_id, &id, result).await?;
    metrics::counter!("drover_tasks_completed_total").increment(1);
    tracing::info!(worker_id = %id, task_id = %task_id, "task completed via API");

    Ok(Json(task))
}

/// `POST /api/v1/workers/{id}/tasks/{task_id}/fail`.
pub async fn fail_task(
    State(state): State<AppState>,
    Path((id, task_id)): Path<(String, Uuid)>,
    body: Option<Json<FailRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let details = body.and_then(|Json(req)| req.error_details).unwrap_or_else(|| {
        serde_json::json!({
            "kind": "execution_failure",
            "message": "worker reported failure",
        })
    });

    let task = tasks::fail_task(&state.pool, task_id, &id, details).await?;
    metrics::counter!("drover_tasks_failed_total").increment(1);
    tracing::warn!(worker_id = %id, task_id = %task_id, "task failed via API");

    Ok(Json(task))
}

/// `GET /api/v1/workers/{id}/stats`.
pub async fn worker_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let worker = workers::get_worker(&state.pool, &id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("worker {id} not found")))?;

    let live = registry::is_claimable(&worker, Utc::now(), state.config.worker_heartbeat_timeout);

    Ok(Json(WorkerStatsResponse {
        worker_id: worker.worker_id,
        backend_type: worker.backend_type,
        status: worker.status,
        live,
        current_task_id: worker.current_task_id,
        last_heartbeat: worker.last_heartbeat,
        tasks_completed: worker.tasks_completed,
        tasks_failed: worker.tasks_failed,
        registered_at: worker.registered_at,
    }))
}

// ---------------------------------------------------------------------------
// Internal pool controls
// ---------------------------------------------------------------------------

/// `GET /api/v1/workers/internal/status`.
pub async fn internal_status(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let manager = state.manager.status().await;
    let counts = workers::worker_counts(&state.pool).await?;
    Ok(Json(serde_json::json!({
        "manager": manager,
        "workers": counts,
    })))
}

/// `POST /api/v1/workers/internal/scale?num_workers=N`.
pub async fn internal_scale(
    State(state): State<AppState>,
    Query(query): Query<ScaleQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if query.num_workers > MAX_WORKERS {
        return Err(ApiError::validation(format!(
            "num_workers must be between 0 and {MAX_WORKERS}, got {}",
            query.num_workers
        )));
    }

    state.manager.set_count(query.num_workers).await?;
    tracing::info!(num_workers = query.num_workers, "worker pool scaled");

    Ok(Json(serde_json::json!({ "num_workers": query.num_workers })))
}

/// `POST /api/v1/workers/internal/start`.
pub async fn internal_start(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    state.manager.start().await?;
    let status = state.manager.status().await;
    Ok(Json(status))
}

/// `POST /api/v1/workers/internal/stop`.
pub async fn internal_stop(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    state.manager.stop().await;
    let status = state.manager.status().await;
    Ok(Json(status))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use drover_test_utils::{create_test_db, drop_test_db};

    use crate::routes::test_support::{body_json, get, post_empty, post_json, test_router};

    async fn register_worker(pool: sqlx::PgPool, worker_id: &str, backend: &str) {
        let resp = post_json(
            test_router(pool),
            "/api/v1/workers/register",
            serde_json::json!({
                "worker_id": worker_id,
                "backend_type": backend,
                "capabilities": {"max_parallel_tasks": 1, "supported_problems": []},
                "metadata": {"host": "test"}
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn register_and_fetch_worker() {
        let (pool, db_name) = create_test_db().await;

        register_worker(pool.clone(), "worker-100-kind", "orchestrator").await;

        let resp = get(test_router(pool.clone()), "/api/v1/workers/worker-100-kind").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["worker_id"], "worker-100-kind");
        assert_eq!(json["backend_type"], "orchestrator");
        assert_eq!(json["status"], "idle");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn register_rejects_malformed_worker_id() {
        let (pool, db_name) = create_test_db().await;

        let resp = post_json(
            test_router(pool.clone()),
            "/api/v1/workers/register",
            serde_json::json!({"worker_id": "worker-1-kind"}),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let json = body_json(resp).await;
        assert_eq!(json["error"]["kind"], "conflict");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn heartbeat_unknown_worker_is_404() {
        let (pool, db_name) = create_test_db().await;

        let resp = post_empty(
            test_router(pool.clone()),
            "/api/v1/workers/worker-400-kind/heartbeat",
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn claim_complete_roundtrip_updates_worker_counters() {
        let (pool, db_name) = create_test_db().await;

        register_worker(pool.clone(), "worker-100-kind", "internal").await;

        let resp = post_json(
            test_router(pool.clone()),
            "/api/v1/tasks",
            serde_json::json!({"problem_id": "revoke-auth-001"}),
        )
        .await;
        let task = body_json(resp).await;
        let task_id = task["id"].as_str().unwrap().to_string();

        // Claim.
        let resp = post_empty(
            test_router(pool.clone()),
            "/api/v1/workers/worker-100-kind/claim",
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["task"]["id"].as_str().unwrap(), task_id);
        assert_eq!(json["task"]["status"], "running");
        assert_eq!(json["task"]["worker_id"], "worker-100-kind");
        assert!(json["task"]["timeout_at"].is_string());

        // A second claim finds nothing (worker at capacity).
        let resp = post_empty(
            test_router(pool.clone()),
            "/api/v1/workers/worker-100-kind/claim",
        )
        .await;
        let json = body_json(resp).await;
        assert!(json["task"].is_null());

        // Complete.
        let resp = post_json(
            test_router(pool.clone()),
            &format!("/api/v1/workers/worker-100-kind/tasks/{task_id}/complete"),
            serde_json::json!({"result": {"score": 1}}),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "completed");
        assert_eq!(json["result"]["score"], 1);

        // Worker is idle again with an incremented lifetime counter.
        let resp = get(
            test_router(pool.clone()),
            "/api/v1/workers/worker-100-kind/stats",
        )
        .await;
        let json = body_json(resp).await;
        assert_eq!(json["status"], "idle");
        assert_eq!(json["tasks_completed"], 1);
        assert_eq!(json["tasks_failed"], 0);
        assert!(json["current_task_id"].is_null());

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn complete_by_non_owner_is_conflict() {
        let (pool, db_name) = create_test_db().await;

        register_worker(pool.clone(), "worker-100-kind", "internal").await;
        register_worker(pool.clone(), "worker-101-kind", "internal").await;

        let resp = post_json(
            test_router(pool.clone()),
            "/api/v1/tasks",
            serde_json::json!({"problem_id": "owned-elsewhere"}),
        )
        .await;
        let task = body_json(resp).await;
        let task_id = task["id"].as_str().unwrap().to_string();

        let resp = post_empty(
            test_router(pool.clone()),
            "/api/v1/workers/worker-100-kind/claim",
        )
        .await;
        let json = body_json(resp).await;
        assert!(json["task"].is_object());

        // The other worker tries to complete it.
        let resp = post_json(
            test_router(pool.clone()),
            &format!("/api/v1/workers/worker-101-kind/tasks/{task_id}/complete"),
            serde_json::json!({"result": {}}),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn complete_non_running_task_is_conflict() {
        let (pool, db_name) = create_test_db().await;

        register_worker(pool.clone(), "worker-100-kind", "internal").await;

        let resp = post_json(
            test_router(pool.clone()),
            "/api/v1/tasks",
            serde_json::json!({"problem_id": "never-claimed"}),
        )
        .await;
        let task = body_json(resp).await;
        let task_id = task["id"].as_str().unwrap();

        let resp = post_json(
            test_router(pool.clone()),
            &format!("/api/v1/workers/worker-100-kind/tasks/{task_id}/complete"),
            serde_json::json!({"result": {}}),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn backend_affinity_is_strict() {
        let (pool, db_name) = create_test_db().await;

        register_worker(pool.clone(), "worker-100-kind", "internal").await;

        let resp = post_json(
            test_router(pool.clone()),
            "/api/v1/tasks",
            serde_json::json!({
                "problem_id": "needs-orchestrator",
                "parameters": {"backend_type": "orchestrator"}
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        // The internal worker never sees the orchestrator task.
        let resp = post_empty(
            test_router(pool.clone()),
            "/api/v1/workers/worker-100-kind/claim",
        )
        .await;
        let json = body_json(resp).await;
        assert!(json["task"].is_null());

        // A matching worker claims it on its first poll.
        register_worker(pool.clone(), "worker-101-kind", "orchestrator").await;
        let resp = post_empty(
            test_router(pool.clone()),
            "/api/v1/workers/worker-101-kind/claim",
        )
        .await;
        let json = body_json(resp).await;
        assert_eq!(json["task"]["problem_id"], "needs-orchestrator");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn supported_problems_substring_filter() {
        let (pool, db_name) = create_test_db().await;

        let resp = post_json(
            test_router(pool.clone()),
            "/api/v1/workers/register",
            serde_json::json!({
                "worker_id": "worker-100-kind",
                "backend_type": "internal",
                "capabilities": {"supported_problems": ["k8s"]}
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        post_json(
            test_router(pool.clone()),
            "/api/v1/tasks",
            serde_json::json!({"problem_id": "vm-disk-full"}),
        )
        .await;

        let resp = post_empty(
            test_router(pool.clone()),
            "/api/v1/workers/worker-100-kind/claim",
        )
        .await;
        let json = body_json(resp).await;
        assert!(json["task"].is_null(), "no substring hit, no claim");

        post_json(
            test_router(pool.clone()),
            "/api/v1/tasks",
            serde_json::json!({"problem_id": "misconfig-k8s-dns"}),
        )
        .await;

        let resp = post_empty(
            test_router(pool.clone()),
            "/api/v1/workers/worker-100-kind/claim",
        )
        .await;
        let json = body_json(resp).await;
        assert_eq!(json["task"]["problem_id"], "misconfig-k8s-dns");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn scale_out_of_range_is_validation_error() {
        let (pool, db_name) = create_test_db().await;

        let resp = post_empty(
            test_router(pool.clone()),
            "/api/v1/workers/internal/scale?num_workers=51",
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert_eq!(json["error"]["kind"], "validation_error");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn internal_status_reports_stopped_pool() {
        let (pool, db_name) = create_test_db().await;

        let resp = get(test_router(pool.clone()), "/api/v1/workers/internal/status").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["manager"]["running"], false);
        assert_eq!(json["manager"]["num_workers"], 0);

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
