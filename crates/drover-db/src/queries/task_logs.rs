//! Database query functions for the append-only `task_logs` table.
//!
//! Each task's log entries carry a gap-free `seq` assigned at insert time
//! via an insert-select over the current maximum. A `UNIQUE (task_id, seq)`
//! constraint backs this up; on the rare concurrent append the losing insert
//! is retried.

use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::{StoreError, is_unique_violation};
use crate::models::{LogLevel, TaskLog};

/// Retry budget for seq races. Each round has a winner, so this bounds the
/// number of appenders that can contend simultaneously on one task.
const SEQ_RETRY_MAX: u32 = 10;

const INSERT_SQL: &str = "INSERT INTO task_logs (task_id, seq, level, message, context) \
     VALUES ($1, \
             (SELECT COALESCE(MAX(seq), 0) + 1 FROM task_logs WHERE task_id = $1), \
             $2, $3, $4) \
     RETURNING *";

/// Append a log entry for a task, assigning the next `seq`.
pub async fn append_log(
    pool: &PgPool,
    task_id: Uuid,
    level: LogLevel,
    message: &str,
    context: serde_json::Value,
) -> Result<TaskLog, StoreError> {
    let mut attempts = 0;

    loop {
        let result = sqlx::query_as::<_, TaskLog>(INSERT_SQL)
            .bind(task_id)
            .bind(level)
            .bind(message)
            .bind(&context)
            .fetch_one(pool)
            .await;

        match result {
            Ok(log) => return Ok(log),
            Err(e) if is_unique_violation(&e) && attempts < SEQ_RETRY_MAX => {
                // Lost a seq race with a concurrent append; recompute.
                attempts += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Append a log entry inside an existing transaction.
///
/// Used by multi-row operations (deadline expiry) that must record the log
/// atomically with the status flip. The surrounding transaction already
/// holds the task row lock, so no seq retry is needed.
pub async fn append_log_tx(
    tx: &mut Transaction<'_, Postgres>,
    task_id: Uuid,
    level: LogLevel,
    message: &str,
    context: serde_json::Value,
) -> Result<TaskLog, StoreError> {
    let log = sqlx::query_as::<_, TaskLog>(INSERT_SQL)
        .bind(task_id)
        .bind(level)
        .bind(message)
        .bind(&context)
        .fetch_one(&mut **tx)
        .await?;

    Ok(log)
}

/// List a task's log entries in `seq` order, optionally filtered by level.
pub async fn list_logs(
    pool: &PgPool,
    task_id: Uuid,
    level: Option<LogLevel>,
    limit: i64,
) -> Result<Vec<TaskLog>, StoreError> {
    let logs = sqlx::query_as::<_, TaskLog>(
        "SELECT * FROM task_logs \
         WHERE task_id = $1 \
           AND ($2::text IS NULL OR level = $2) \
         ORDER BY seq ASC \
         LIMIT $3",
    )
    .bind(task_id)
    .bind(level.map(|l| l.to_string()))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(logs)
}
