//! Database query functions for the `workers` table: registration upserts,
//! heartbeats, liveness sweeps, and per-worker stats.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Worker, WorkerStatus};

/// Parameters for registering (or re-registering) a worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub worker_id: String,
    pub backend_type: String,
    pub max_parallel_tasks: i32,
    pub supported_problems: Vec<String>,
    pub metadata: serde_json::Value,
}

/// Upsert a worker row. Re-registration refreshes the capability fields and
/// heartbeat and brings the worker back to `idle`, but preserves lifetime
/// counters.
pub async fn upsert_worker(pool: &PgPool, spec: &WorkerSpec) -> Result<Worker, StoreError> {
    let worker = sqlx::query_as::<_, Worker>(
        "INSERT INTO workers \
             (worker_id, backend_type, max_parallel_tasks, supported_problems, metadata) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (worker_id) DO UPDATE \
         SET backend_type = EXCLUDED.backend_type, \
             max_parallel_tasks = EXCLUDED.max_parallel_tasks, \
             supported_problems = EXCLUDED.supported_problems, \
             metadata = EXCLUDED.metadata, \
             status = 'idle', \
             current_task_id = NULL, \
             last_heartbeat = NOW() \
         RETURNING *",
    )
    .bind(&spec.worker_id)
    .bind(&spec.backend_type)
    .bind(spec.max_parallel_tasks)
    .bind(&spec.supported_problems)
    .bind(&spec.metadata)
    .fetch_one(pool)
    .await?;

    Ok(worker)
}

/// Fetch a single worker by ID.
pub async fn get_worker(pool: &PgPool, worker_id: &str) -> Result<Option<Worker>, StoreError> {
    let worker = sqlx::query_as::<_, Worker>("SELECT * FROM workers WHERE worker_id = $1")
        .bind(worker_id)
        .fetch_optional(pool)
        .await?;

    Ok(worker)
}

/// List all workers, oldest registration first.
pub async fn list_workers(pool: &PgPool) -> Result<Vec<Worker>, StoreError> {
    let workers =
        sqlx::query_as::<_, Worker>("SELECT * FROM workers ORDER BY registered_at ASC")
            .fetch_all(pool)
            .await?;

    Ok(workers)
}

/// Refresh a worker's heartbeat, status, and current task pointer.
///
/// Unknown workers are a NotFound: heartbeats never implicitly register.
pub async fn heartbeat(
    pool: &PgPool,
    worker_id: &str,
    status: WorkerStatus,
    current_task_id: Option<Uuid>,
) -> Result<Worker, StoreError> {
    let worker = sqlx::query_as::<_, Worker>(
        "UPDATE workers \
         SET status = $2, current_task_id = $3, last_heartbeat = NOW() \
         WHERE worker_id = $1 \
         RETURNING *",
    )
    .bind(worker_id)
    .bind(status)
    .bind(current_task_id)
    .fetch_optional(pool)
    .await?;

    worker.ok_or_else(|| StoreError::not_found(format!("worker {worker_id} not registered")))
}

/// Return a busy worker to `idle` and clear its current task pointer.
///
/// Used when a run ends without going through complete/fail (cooperative
/// cancellation). No counters change.
pub async fn release_worker(pool: &PgPool, worker_id: &str) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE workers \
         SET status = 'idle', current_task_id = NULL, last_heartbeat = NOW() \
         WHERE worker_id = $1",
    )
    .bind(worker_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Mark a single worker offline (deregistration on drain).
pub async fn mark_offline(pool: &PgPool, worker_id: &str) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE workers \
         SET status = 'offline', current_task_id = NULL \
         WHERE worker_id = $1",
    )
    .bind(worker_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Mark every worker whose last heartbeat predates `cutoff` as offline and
/// free its current task pointer. The task row is untouched; it has its own
/// deadline. Returns the affected worker ids.
pub async fn mark_stale_offline(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<String>, StoreError> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "UPDATE workers \
         SET status = 'offline', current_task_id = NULL \
         WHERE status != 'offline' AND last_heartbeat < $1 \
         RETURNING worker_id",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Counts of workers by status, for the internal status endpoint.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerCounts {
    pub idle: i64,
    pub busy: i64,
    pub offline: i64,
    pub total: i64,
}

/// Count workers grouped by status.
pub async fn worker_counts(pool: &PgPool) -> Result<WorkerCounts, StoreError> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status::text, COUNT(*) as cnt FROM workers GROUP BY status")
            .fetch_all(pool)
            .await?;

    let mut counts = WorkerCounts::default();
    for (status, count) in &rows {
        match status.as_str() {
            "idle" => counts.idle = *count,
            "busy" => counts.busy = *count,
            "offline" => counts.offline = *count,
            _ => {}
        }
        counts.total += count;
    }
    Ok(counts)
}
