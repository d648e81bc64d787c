//! Claim-side queue logic: worker eligibility checks in front of the
//! store's atomic `claim_next`.

use sqlx::PgPool;
use tracing::debug;

use drover_db::StoreError;
use drover_db::models::Task;
use drover_db::queries::{tasks, workers};

use crate::config::ServiceConfig;
use crate::registry;

/// Claim the next eligible task for a worker.
///
/// Eligibility gates, in order:
/// 1. The worker must be registered (NotFound otherwise).
/// 2. It must not be offline and its heartbeat must be fresh (Conflict).
/// 3. It must have capacity under `max_parallel_tasks` (returns `None`).
///
/// Backend affinity and the substring capability filter are applied inside
/// the store's claim transaction, so two workers racing for the same row
/// see exactly one winner.
pub async fn claim_for_worker(
    pool: &PgPool,
    worker_id: &str,
    config: &ServiceConfig,
) -> Result<Option<Task>, StoreError> {
    let worker = workers::get_worker(pool, worker_id)
        .await?
        .ok_or_else(|| StoreError::not_found(format!("worker {worker_id} not registered")))?;

    let now = chrono::Utc::now();
    if !registry::is_claimable(&worker, now, config.worker_heartbeat_timeout) {
        return Err(StoreError::conflict(format!(
            "worker {worker_id} is not claimable (status {}, last heartbeat {})",
            worker.status, worker.last_heartbeat
        )));
    }

    let running = tasks::count_running_for_worker(pool, worker_id).await?;
    if running >= i64::from(worker.max_parallel_tasks) {
        debug!(
            worker_id,
            running,
            max_parallel_tasks = worker.max_parallel_tasks,
            "worker at capacity, no claim"
        );
        return Ok(None);
    }

    let claimed = tasks::claim_next(
        pool,
        worker_id,
        &worker.backend_type,
        &worker.supported_problems,
        config.default_timeout_minutes,
    )
    .await?;

    if let Some(task) = &claimed {
        metrics::counter!("drover_claims_total").increment(1);
        debug!(
            worker_id,
            task_id = %task.id,
            problem_id = %task.problem_id,
            priority = task.priority,
            "task claimed"
        );
    }

    Ok(claimed)
}
