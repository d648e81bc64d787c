//! Timeout sweeper: the periodic job that enforces task deadlines and
//! worker liveness.
//!
//! Each cycle expires running tasks whose `timeout_at` has passed, then
//! marks workers offline when their heartbeat has lapsed. Both passes are
//! idempotent, so overlapping or repeated cycles cause no extra state
//! changes. Per-cycle errors are logged and the loop continues.

use std::sync::Arc;

use chrono::Utc;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use drover_db::queries::{tasks, workers};

use crate::config::ServiceConfig;

/// Run the sweeper until the cancellation token fires.
pub async fn run_sweeper(pool: PgPool, config: Arc<ServiceConfig>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(config.timeout_check_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(
        interval_secs = config.timeout_check_interval.as_secs_f64(),
        "timeout sweeper started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                sweep_once(&pool, &config).await;
            }
        }
    }

    info!("timeout sweeper stopped");
}

/// One sweep cycle: deadline expiry, then the liveness pass.
pub async fn sweep_once(pool: &PgPool, config: &ServiceConfig) {
    let now = Utc::now();

    match tasks::expire_running(pool, now).await {
        Ok(expired) => {
            for task in &expired {
                metrics::counter!("drover_tasks_timed_out_total").increment(1);
                warn!(
                    task_id = %task.id,
                    problem_id = %task.problem_id,
                    worker_id = ?task.worker_id,
                    "task expired past its deadline"
                );
            }
        }
        Err(e) => {
            error!(error = %e, "deadline expiry pass failed");
        }
    }

    let cutoff = now
        - chrono::Duration::from_std(config.worker_heartbeat_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(90));
    match workers::mark_stale_offline(pool, cutoff).await {
        Ok(stale) => {
            for worker_id in &stale {
                warn!(worker_id, "worker heartbeat lapsed, marked offline");
            }
        }
        Err(e) => {
            error!(error = %e, "worker liveness pass failed");
        }
    }
}
