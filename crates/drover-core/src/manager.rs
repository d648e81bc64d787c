//! In-process worker manager: boots N claim loops, scales the pool up and
//! down, and supervises graceful shutdown.
//!
//! Each loop's lifecycle is starting -> idle <-> claiming <-> busy ->
//! draining -> stopped. Those states are local to the loop; external
//! observers read the worker rows in the store, which the loops keep
//! current through registration, heartbeats, and offline marks.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use drover_db::StoreError;
use drover_db::models::{Task, WorkerStatus};
use drover_db::queries::tasks;
use drover_db::queries::workers::{self, WorkerSpec};

use crate::config::ServiceConfig;
use crate::executor::{ExecutionContext, ExecutionOutcome, Executor};
use crate::queue;
use crate::registry;

/// Hard ceiling on the in-process pool size.
pub const MAX_WORKERS: usize = 50;

/// How long `stop` waits for loops to drain before aborting them.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(30);

/// A running claim loop.
struct LoopHandle {
    worker_id: String,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

#[derive(Default)]
struct ManagerInner {
    active: Vec<LoopHandle>,
    draining: Vec<LoopHandle>,
}

/// Snapshot of the manager for the internal status endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ManagerStatus {
    pub running: bool,
    pub num_workers: usize,
    pub worker_ids: Vec<String>,
}

/// Owns the pool of in-process workers.
///
/// Injected into HTTP handlers as an explicit dependency; its lifecycle is
/// scoped to the service (boot on start, drain on shutdown).
pub struct WorkerManager {
    pool: PgPool,
    config: Arc<ServiceConfig>,
    executor: Arc<dyn Executor>,
    inner: Mutex<ManagerInner>,
}

impl WorkerManager {
    pub fn new(pool: PgPool, config: Arc<ServiceConfig>, executor: Arc<dyn Executor>) -> Self {
        Self {
            pool,
            config,
            executor,
            inner: Mutex::new(ManagerInner::default()),
        }
    }

    /// Boot the configured number of workers. Idempotent.
    pub async fn start(&self) -> Result<(), StoreError> {
        self.set_count(self.config.num_internal_workers).await
    }

    /// Scale the pool to `n` loops, clamped to `[0, MAX_WORKERS]`.
    ///
    /// Growing spawns loops on the next free `worker-NNN-kind` slots.
    /// Shrinking signals the oldest loops to drain: each finishes its
    /// current task, skips further claims, and marks its worker offline.
    pub async fn set_count(&self, n: usize) -> Result<(), StoreError> {
        if n > MAX_WORKERS {
            return Err(StoreError::validation(format!(
                "num_workers must be between 0 and {MAX_WORKERS}, got {n}"
            )));
        }

        let mut inner = self.inner.lock().await;
        prune_finished(&mut inner);

        while inner.active.len() > n {
            // Oldest loop first.
            let handle = inner.active.remove(0);
            info!(worker_id = %handle.worker_id, "draining worker loop");
            handle.cancel.cancel();
            inner.draining.push(handle);
        }

        while inner.active.len() < n {
            let Some(slot) = next_free_slot(&inner) else {
                return Err(StoreError::validation(
                    "no free internal worker slots below 100",
                ));
            };
            let worker_id = registry::internal_worker_id(slot);
            info!(worker_id = %worker_id, "spawning worker loop");

            let cancel = CancellationToken::new();
            let join = tokio::spawn(worker_loop(
                self.pool.clone(),
                Arc::clone(&self.config),
                Arc::clone(&self.executor),
                worker_id.clone(),
                cancel.clone(),
            ));
            inner.active.push(LoopHandle {
                worker_id,
                cancel,
                join,
            });
        }

        Ok(())
    }

    /// Drain every loop, wait up to the shutdown budget, then abort
    /// stragglers and mark their workers offline.
    pub async fn stop(&self) {
        let handles = {
            let mut inner = self.inner.lock().await;
            let mut handles = std::mem::take(&mut inner.active);
            handles.append(&mut inner.draining);
            handles
        };

        if handles.is_empty() {
            return;
        }

        info!(count = handles.len(), "stopping worker loops");
        for handle in &handles {
            handle.cancel.cancel();
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_BUDGET;
        for handle in handles {
            match tokio::time::timeout_at(deadline, handle.join).await {
                Ok(_) => {}
                Err(_elapsed) => {
                    warn!(
                        worker_id = %handle.worker_id,
                        "worker loop did not drain within shutdown budget, aborting"
                    );
                    // The JoinHandle was consumed by timeout_at; the loop
                    // itself observes the cancelled token at its next await
                    // point. Make the store reflect the forced stop.
                    let _ = workers::mark_offline(&self.pool, &handle.worker_id).await;
                }
            }
        }
        info!("worker loops stopped");
    }

    /// Snapshot for the internal status endpoint.
    pub async fn status(&self) -> ManagerStatus {
        let mut inner = self.inner.lock().await;
        prune_finished(&mut inner);
        let worker_ids: Vec<String> =
            inner.active.iter().map(|h| h.worker_id.clone()).collect();
        ManagerStatus {
            running: !worker_ids.is_empty(),
            num_workers: worker_ids.len(),
            worker_ids,
        }
    }
}

/// Drop handles whose loops have already exited.
fn prune_finished(inner: &mut ManagerInner) {
    inner.active.retain(|h| !h.join.is_finished());
    inner.draining.retain(|h| !h.join.is_finished());
}

/// Lowest internal slot number not taken by an active or draining loop.
fn next_free_slot(inner: &ManagerInner) -> Option<u32> {
    let used: Vec<u32> = inner
        .active
        .iter()
        .chain(inner.draining.iter())
        .filter_map(|h| registry::worker_slot(&h.worker_id))
        .collect();
    (1..=registry::INTERNAL_SLOT_MAX).find(|slot| !used.contains(slot))
}

/// One claim loop: register, then poll-claim-execute until cancelled.
async fn worker_loop(
    pool: PgPool,
    config: Arc<ServiceConfig>,
    executor: Arc<dyn Executor>,
    worker_id: String,
    cancel: CancellationToken,
) {
    if !register_with_retry(&pool, &worker_id, &cancel).await {
        return;
    }

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match queue::claim_for_worker(&pool, &worker_id, &config).await {
            Ok(Some(task)) => {
                run_claimed_task(&pool, &config, executor.as_ref(), &worker_id, task, &cancel)
                    .await;
                // Claim again right away; the queue may be deep.
                continue;
            }
            Ok(None) => {
                if let Err(e) =
                    registry::heartbeat(&pool, &worker_id, WorkerStatus::Idle, None).await
                {
                    warn!(worker_id, error = %e, "idle heartbeat failed");
                }
            }
            Err(StoreError::Conflict(msg)) => {
                // Typically the sweeper marked us offline while we could
                // not heartbeat. Re-register and carry on.
                warn!(worker_id, %msg, "claim refused, re-registering");
                let _ = register_with_retry(&pool, &worker_id, &cancel).await;
            }
            Err(e) => {
                warn!(worker_id, error = %e, "claim attempt failed");
            }
        }

        // Jittered poll sleep so a fleet of loops does not thunder in step.
        let jitter = rand::rng().random_range(0.8..1.2);
        let sleep = config.worker_poll_interval.mul_f64(jitter);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(sleep) => {}
        }
    }

    if let Err(e) = workers::mark_offline(&pool, &worker_id).await {
        warn!(worker_id, error = %e, "failed to mark worker offline on exit");
    }
    info!(worker_id, "worker loop stopped");
}

/// Register the loop's worker row, retrying until it sticks or the loop is
/// cancelled. Returns false when cancelled before registration succeeded.
async fn register_with_retry(pool: &PgPool, worker_id: &str, cancel: &CancellationToken) -> bool {
    let spec = WorkerSpec {
        worker_id: worker_id.to_string(),
        backend_type: "internal".to_string(),
        max_parallel_tasks: 1,
        supported_problems: Vec::new(),
        metadata: serde_json::json!({"runtime": "in-process"}),
    };

    loop {
        match registry::register(pool, spec.clone()).await {
            Ok(_) => return true,
            Err(e) => {
                warn!(worker_id, error = %e, "worker registration failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return false,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }
    }
}

/// Run one claimed task to its outcome and record it.
async fn run_claimed_task(
    pool: &PgPool,
    config: &ServiceConfig,
    executor: &dyn Executor,
    worker_id: &str,
    task: Task,
    cancel: &CancellationToken,
) {
    let task_id = task.id;
    info!(
        worker_id,
        task_id = %task_id,
        problem_id = %task.problem_id,
        executor = executor.name(),
        "executing task"
    );

    // Keep the worker visibly alive while the executor runs.
    let hb_cancel = CancellationToken::new();
    let hb_join = tokio::spawn(heartbeat_while_busy(
        pool.clone(),
        worker_id.to_string(),
        task_id,
        config.worker_heartbeat_timeout / 3,
        hb_cancel.clone(),
    ));

    let ctx = ExecutionContext {
        pool: pool.clone(),
        task,
        worker_id: worker_id.to_string(),
        cancel: cancel.clone(),
    };
    let outcome = executor.execute(&ctx).await;

    hb_cancel.cancel();
    let _ = hb_join.await;

    match outcome {
        ExecutionOutcome::Completed(result) => {
            match tasks::complete_task(pool, task_id, worker_id, result).await {
                Ok(_) => {
                    metrics::counter!("drover_tasks_completed_total").increment(1);
                    info!(worker_id, task_id = %task_id, "task completed");
                }
                Err(StoreError::Conflict(msg)) => {
                    // The task was cancelled or expired mid-run; its row is
                    // already terminal. Just free the worker.
                    warn!(worker_id, task_id = %task_id, %msg, "completion refused");
                    let _ = workers::release_worker(pool, worker_id).await;
                }
                Err(e) => {
                    error!(worker_id, task_id = %task_id, error = %e, "failed to record completion");
                    let _ = workers::release_worker(pool, worker_id).await;
                }
            }
        }
        ExecutionOutcome::Failed(details) => {
            match tasks::fail_task(pool, task_id, worker_id, details).await {
                Ok(_) => {
                    metrics::counter!("drover_tasks_failed_total").increment(1);
                    warn!(worker_id, task_id = %task_id, "task failed");
                }
                Err(StoreError::Conflict(msg)) => {
                    warn!(worker_id, task_id = %task_id, %msg, "failure record refused");
                    let _ = workers::release_worker(pool, worker_id).await;
                }
                Err(e) => {
                    error!(worker_id, task_id = %task_id, error = %e, "failed to record failure");
                    let _ = workers::release_worker(pool, worker_id).await;
                }
            }
        }
        ExecutionOutcome::Cancelled => {
            info!(worker_id, task_id = %task_id, "execution aborted, task no longer running");
            let _ = workers::release_worker(pool, worker_id).await;
        }
    }
}

/// Busy-status heartbeats at a cadence well inside the liveness window.
async fn heartbeat_while_busy(
    pool: PgPool,
    worker_id: String,
    task_id: uuid::Uuid,
    cadence: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(cadence.max(Duration::from_millis(100)));
    ticker.tick().await; // first tick fires immediately
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) =
                    registry::heartbeat(&pool, &worker_id, WorkerStatus::Busy, Some(task_id)).await
                {
                    warn!(worker_id, error = %e, "busy heartbeat failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn next_free_slot_skips_used() {
        let mut inner = ManagerInner::default();
        assert_eq!(next_free_slot(&inner), Some(1));

        // Fabricate handles for slots 1 and 2.
        for slot in [1u32, 2] {
            inner.active.push(LoopHandle {
                worker_id: registry::internal_worker_id(slot),
                cancel: CancellationToken::new(),
                join: tokio::spawn(async {}),
            });
        }
        assert_eq!(next_free_slot(&inner), Some(3));
    }
}
