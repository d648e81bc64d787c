//! Integration tests for the timeout sweeper: deadline expiry of hung runs
//! and the worker liveness pass.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use drover_core::config::ServiceConfig;
use drover_core::executor::{ExecutionContext, ExecutionOutcome, Executor};
use drover_core::manager::WorkerManager;
use drover_core::sweeper;
use drover_db::models::{LogLevel, TaskStatus, WorkerStatus};
use drover_db::queries::task_logs;
use drover_db::queries::tasks::{self, NewTask};
use drover_db::queries::workers::{self, WorkerSpec};
use drover_test_utils::{create_test_db, drop_test_db};

/// An executor that never finishes on its own; it only stops when the task
/// leaves `running` or the loop is cancelled.
struct HangExecutor;

#[async_trait]
impl Executor for HangExecutor {
    fn name(&self) -> &str {
        "hang"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> ExecutionOutcome {
        loop {
            if ctx.cancellation_requested().await {
                return ExecutionOutcome::Cancelled;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

fn fast_config() -> Arc<ServiceConfig> {
    Arc::new(ServiceConfig {
        num_internal_workers: 1,
        auto_start_workers: false,
        enable_background_tasks: false,
        worker_poll_interval: Duration::from_millis(50),
        timeout_check_interval: Duration::from_millis(200),
        ..ServiceConfig::default()
    })
}

#[tokio::test]
async fn sweeper_expires_hung_run_and_frees_worker() {
    let (pool, db_name) = create_test_db().await;
    let config = fast_config();
    let manager = WorkerManager::new(pool.clone(), Arc::clone(&config), Arc::new(HangExecutor));

    manager.start().await.unwrap();

    // ~120ms deadline; the executor never completes.
    let task = tasks::insert_task(
        &pool,
        &NewTask {
            problem_id: "stuck-run".to_string(),
            parameters: serde_json::json!({"backend_type": "internal", "timeout_minutes": 0.002}),
            priority: 0,
            backend_type: "internal".to_string(),
        },
    )
    .await
    .unwrap();

    // Wait for the claim, then let the deadline lapse.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let current = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
        if current.status == TaskStatus::Running {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task was never claimed"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    sweeper::sweep_once(&pool, &config).await;

    let expired = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(expired.status, TaskStatus::Timeout);
    assert!(expired.completed_at.is_some());
    assert_eq!(expired.error_details.as_ref().unwrap()["kind"], "timeout");

    let error_logs = task_logs::list_logs(&pool, task.id, Some(LogLevel::Error), 10)
        .await
        .unwrap();
    assert_eq!(error_logs.len(), 1);

    // The worker was released by the sweep; the hung executor observes the
    // terminal status and unwinds shortly after.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let worker = workers::get_worker(&pool, "worker-001-kind")
            .await
            .unwrap()
            .unwrap();
        if worker.status == WorkerStatus::Idle && worker.current_task_id.is_none() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "worker was never released after expiry"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Re-sweeping the same window adds nothing.
    sweeper::sweep_once(&pool, &config).await;
    let logs = task_logs::list_logs(&pool, task.id, None, 10).await.unwrap();
    assert_eq!(logs.len(), 1);

    manager.stop().await;
    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn sweeper_marks_silent_workers_offline() {
    let (pool, db_name) = create_test_db().await;
    let config = Arc::new(ServiceConfig {
        worker_heartbeat_timeout: Duration::from_secs(90),
        ..(*fast_config()).clone()
    });

    workers::upsert_worker(
        &pool,
        &WorkerSpec {
            worker_id: "worker-100-kind".to_string(),
            backend_type: "orchestrator".to_string(),
            max_parallel_tasks: 1,
            supported_problems: Vec::new(),
            metadata: serde_json::json!({}),
        },
    )
    .await
    .unwrap();

    // Backdate the heartbeat beyond the window.
    sqlx::query(
        "UPDATE workers SET last_heartbeat = NOW() - INTERVAL '5 minutes' \
         WHERE worker_id = 'worker-100-kind'",
    )
    .execute(&pool)
    .await
    .unwrap();

    sweeper::sweep_once(&pool, &config).await;

    let worker = workers::get_worker(&pool, "worker-100-kind")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(worker.status, WorkerStatus::Offline);

    pool.close().await;
    drop_test_db(&db_name).await;
}
