//! Database query functions for the `tasks` table: submission, lookup, the
//! atomic claim, completion/failure with ownership checks, cancellation, and
//! deadline expiry.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::error::{MAX_DB_RETRIES, RETRY_BASE_DELAY, StoreError, is_transient};
use crate::models::{Task, TaskStatus};
use crate::queries::task_logs;

/// Parameters for inserting a new task row.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub problem_id: String,
    /// Full parameter map as submitted; unknown keys are preserved.
    pub parameters: serde_json::Value,
    pub priority: i32,
    /// Denormalized copy of `parameters.backend_type`.
    pub backend_type: String,
}

/// Insert a new task row. Returns the inserted task with server-generated
/// defaults (id, created_at, status).
pub async fn insert_task(pool: &PgPool, new: &NewTask) -> Result<Task, StoreError> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (problem_id, parameters, priority, backend_type) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(&new.problem_id)
    .bind(&new.parameters)
    .bind(new.priority)
    .bind(&new.backend_type)
    .fetch_one(pool)
    .await?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>, StoreError> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(task)
}

/// List tasks, newest first, with optional status / backend filters and
/// limit+offset pagination.
pub async fn list_tasks(
    pool: &PgPool,
    status: Option<TaskStatus>,
    backend_type: Option<&str>,
    limit: i64,
    offset: i64,
) -> Result<Vec<Task>, StoreError> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE ($1::text IS NULL OR status = $1) \
           AND ($2::text IS NULL OR backend_type = $2) \
         ORDER BY created_at DESC \
         LIMIT $3 OFFSET $4",
    )
    .bind(status.map(|s| s.to_string()))
    .bind(backend_type)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    Ok(tasks)
}

/// Atomically claim the next eligible pending task for a worker.
///
/// Inside one transaction:
/// 1. Pick the best pending row for the worker's backend, ordered by
///    `priority DESC, created_at ASC`, with `FOR UPDATE SKIP LOCKED` so two
///    racing claimants never see the same candidate.
/// 2. Apply the substring capability filter: an empty `supported_problems`
///    accepts anything; otherwise at least one entry must occur in
///    `problem_id`.
/// 3. Flip the row to `running` and stamp `worker_id`, `started_at`, and
///    `timeout_at` (`NOW()` plus the task's `timeout_minutes`, falling back
///    to `default_timeout_minutes`).
/// 4. Mark the worker busy on its row.
///
/// Returns `None` when nothing is claimable. Transient database errors are
/// retried with bounded exponential backoff.
pub async fn claim_next(
    pool: &PgPool,
    worker_id: &str,
    backend_type: &str,
    supported_problems: &[String],
    default_timeout_minutes: f64,
) -> Result<Option<Task>, StoreError> {
    let mut retries = 0;

    loop {
        let result = try_claim(
            pool,
            worker_id,
            backend_type,
            supported_problems,
            default_timeout_minutes,
        )
        .await;

        match result {
            Ok(task) => return Ok(task),
            Err(StoreError::Database(e)) if is_transient(&e) && retries < MAX_DB_RETRIES => {
                retries += 1;
                let delay = RETRY_BASE_DELAY * (1 << retries);
                warn!(
                    worker_id,
                    error = %e,
                    retry = retries,
                    "transient error claiming task, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn try_claim(
    pool: &PgPool,
    worker_id: &str,
    backend_type: &str,
    supported_problems: &[String],
    default_timeout_minutes: f64,
) -> Result<Option<Task>, StoreError> {
    let mut tx = pool.begin().await?;

    let task = sqlx::query_as::<_, Task>(
        "WITH candidate AS ( \
             SELECT id FROM tasks \
             WHERE status = 'pending' \
               AND backend_type = $2 \
               AND (cardinality($3::text[]) = 0 \
                    OR EXISTS (SELECT 1 FROM unnest($3::text[]) AS p \
                               WHERE problem_id LIKE '%' || p || '%')) \
             ORDER BY priority DESC, created_at ASC \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED \
         ) \
         UPDATE tasks t \
         SET status = 'running', \
             worker_id = $1, \
             started_at = NOW(), \
             timeout_at = NOW() + make_interval(secs => \
                 60 * COALESCE((t.parameters->>'timeout_minutes')::double precision, $4)) \
         FROM candidate \
         WHERE t.id = candidate.id \
         RETURNING t.*",
    )
    .bind(worker_id)
    .bind(backend_type)
    .bind(supported_problems)
    .bind(default_timeout_minutes)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(task) = task else {
        tx.rollback().await?;
        return Ok(None);
    };

    sqlx::query(
        "UPDATE workers \
         SET status = 'busy', current_task_id = $2, last_heartbeat = NOW() \
         WHERE worker_id = $1",
    )
    .bind(worker_id)
    .bind(task.id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(Some(task))
}

/// Mark a running task completed with its result map, verifying ownership.
///
/// The UPDATE only matches `status = 'running' AND worker_id = $2`; when no
/// row matches, the current row is re-read to classify the refusal as
/// NotFound or Conflict. The owning worker is released and its
/// `tasks_completed` counter bumped in the same transaction.
pub async fn complete_task(
    pool: &PgPool,
    task_id: Uuid,
    worker_id: &str,
    result: serde_json::Value,
) -> Result<Task, StoreError> {
    finish_task(pool, task_id, worker_id, TaskFinish::Completed(result)).await
}

/// Mark a running task failed with its error details, verifying ownership.
///
/// Same transaction shape as [`complete_task`], bumping `tasks_failed`.
pub async fn fail_task(
    pool: &PgPool,
    task_id: Uuid,
    worker_id: &str,
    error_details: serde_json::Value,
) -> Result<Task, StoreError> {
    finish_task(pool, task_id, worker_id, TaskFinish::Failed(error_details)).await
}

enum TaskFinish {
    Completed(serde_json::Value),
    Failed(serde_json::Value),
}

async fn finish_task(
    pool: &PgPool,
    task_id: Uuid,
    worker_id: &str,
    finish: TaskFinish,
) -> Result<Task, StoreError> {
    let mut tx = pool.begin().await?;

    let (sql, payload, counter_sql) = match &finish {
        TaskFinish::Completed(result) => (
            "UPDATE tasks \
             SET status = 'completed', completed_at = NOW(), result = $3 \
             WHERE id = $1 AND status = 'running' AND worker_id = $2 \
             RETURNING *",
            result,
            "UPDATE workers \
             SET status = 'idle', current_task_id = NULL, \
                 tasks_completed = tasks_completed + 1, last_heartbeat = NOW() \
             WHERE worker_id = $1",
        ),
        TaskFinish::Failed(details) => (
            "UPDATE tasks \
             SET status = 'failed', completed_at = NOW(), error_details = $3 \
             WHERE id = $1 AND status = 'running' AND worker_id = $2 \
             RETURNING *",
            details,
            "UPDATE workers \
             SET status = 'idle', current_task_id = NULL, \
                 tasks_failed = tasks_failed + 1, last_heartbeat = NOW() \
             WHERE worker_id = $1",
        ),
    };

    let task = sqlx::query_as::<_, Task>(sql)
        .bind(task_id)
        .bind(worker_id)
        .bind(payload)
        .fetch_optional(&mut *tx)
        .await?;

    let Some(task) = task else {
        tx.rollback().await?;
        // Re-read to say precisely why the transition was refused.
        let current = get_task(pool, task_id).await?;
        return Err(match current {
            None => StoreError::not_found(format!("task {task_id} not found")),
            Some(t) if t.status != TaskStatus::Running => StoreError::conflict(format!(
                "task {task_id} has status {}, expected running",
                t.status
            )),
            Some(t) => StoreError::conflict(format!(
                "task {task_id} is owned by {}, not {worker_id}",
                t.worker_id.as_deref().unwrap_or("nobody")
            )),
        });
    };

    sqlx::query(counter_sql)
        .bind(worker_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(task)
}

/// Cancel a task. Allowed only from `pending` or `running`; any other
/// current status yields a Conflict.
///
/// Cancelling a running task flips the row immediately; the executor is
/// expected to observe the new status between steps and abort. `worker_id`
/// is cleared so the row satisfies the ownership invariant for terminal
/// cancelled tasks.
pub async fn cancel_task(pool: &PgPool, task_id: Uuid) -> Result<Task, StoreError> {
    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = 'cancelled', completed_at = NOW(), worker_id = NULL \
         WHERE id = $1 AND status IN ('pending', 'running') \
         RETURNING *",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await?;

    match task {
        Some(task) => Ok(task),
        None => match get_task(pool, task_id).await? {
            None => Err(StoreError::not_found(format!("task {task_id} not found"))),
            Some(t) => Err(StoreError::conflict(format!(
                "task {task_id} has status {}, cannot cancel",
                t.status
            ))),
        },
    }
}

/// Expire every running task whose deadline has passed.
///
/// One transaction: lock the expired rows (`FOR UPDATE SKIP LOCKED`, so a
/// row mid-completion elsewhere is skipped), flip them to `timeout` with an
/// explanatory error record, append a `level=error` log entry per task, and
/// release each owning worker. Returns the expired tasks. Re-running over
/// the same window is a no-op.
pub async fn expire_running(pool: &PgPool, now: DateTime<Utc>) -> Result<Vec<Task>, StoreError> {
    let mut tx = pool.begin().await?;

    let expired = sqlx::query_as::<_, Task>(
        "WITH expired AS ( \
             SELECT id FROM tasks \
             WHERE status = 'running' AND timeout_at <= $1 \
             FOR UPDATE SKIP LOCKED \
         ) \
         UPDATE tasks t \
         SET status = 'timeout', \
             completed_at = $1, \
             error_details = jsonb_build_object( \
                 'kind', 'timeout', \
                 'message', 'task exceeded its deadline', \
                 'timeout_at', to_char(t.timeout_at, 'YYYY-MM-DD\"T\"HH24:MI:SS.USOF')) \
         FROM expired \
         WHERE t.id = expired.id \
         RETURNING t.*",
    )
    .bind(now)
    .fetch_all(&mut *tx)
    .await?;

    for task in &expired {
        task_logs::append_log_tx(
            &mut tx,
            task.id,
            crate::models::LogLevel::Error,
            &format!("task timed out (deadline {})", task.timeout_at.unwrap_or(now)),
            serde_json::json!({"worker_id": task.worker_id}),
        )
        .await?;

        if let Some(worker_id) = &task.worker_id {
            sqlx::query(
                "UPDATE workers \
                 SET status = 'idle', current_task_id = NULL \
                 WHERE worker_id = $1 AND current_task_id = $2",
            )
            .bind(worker_id)
            .bind(task.id)
            .execute(&mut *tx)
            .await?;
        }
    }

    tx.commit().await?;
    Ok(expired)
}

/// Count tasks currently running under a worker, for capacity checks
/// against `max_parallel_tasks`.
pub async fn count_running_for_worker(
    pool: &PgPool,
    worker_id: &str,
) -> Result<i64, StoreError> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tasks WHERE worker_id = $1 AND status = 'running'",
    )
    .bind(worker_id)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

/// Task counts by status, for the queue stats endpoint.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TaskStats {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub timeout: i64,
    pub cancelled: i64,
    pub total: i64,
}

/// Count tasks grouped by status.
pub async fn task_stats(pool: &PgPool) -> Result<TaskStats, StoreError> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status::text, COUNT(*) as cnt FROM tasks GROUP BY status")
            .fetch_all(pool)
            .await?;

    let mut stats = TaskStats::default();
    for (status, count) in &rows {
        match status.as_str() {
            "pending" => stats.pending = *count,
            "running" => stats.running = *count,
            "completed" => stats.completed = *count,
            "failed" => stats.failed = *count,
            "timeout" => stats.timeout = *count,
            "cancelled" => stats.cancelled = *count,
            _ => {}
        }
        stats.total += count;
    }
    Ok(stats)
}
