//! Integration tests for the orchestrator subprocess executor, driven by
//! fixture shell scripts that stand in for the real orchestrator binary.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use drover_core::executor::{ExecutionContext, ExecutionOutcome, Executor, OrchestratorExecutor};
use drover_db::models::Task;
use drover_db::queries::conversations;
use drover_db::queries::task_logs;
use drover_db::queries::tasks::{self, NewTask};
use drover_db::queries::workers::{self, WorkerSpec};
use drover_test_utils::{create_test_db, drop_test_db};

/// Write an executable script into `dir` and return its path.
fn write_script(dir: &std::path::Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path.to_str().unwrap().to_string()
}

/// Insert and claim a task so the executor sees a `running` row.
async fn claimed_task(pool: &sqlx::PgPool, problem_id: &str) -> Task {
    workers::upsert_worker(
        pool,
        &WorkerSpec {
            worker_id: "worker-001-kind".to_string(),
            backend_type: "internal".to_string(),
            max_parallel_tasks: 1,
            supported_problems: Vec::new(),
            metadata: serde_json::json!({}),
        },
    )
    .await
    .unwrap();

    tasks::insert_task(
        pool,
        &NewTask {
            problem_id: problem_id.to_string(),
            parameters: serde_json::json!({
                "backend_type": "internal",
                "max_steps": 5,
                "agent_config": {"model": "gpt-4o"}
            }),
            priority: 0,
            backend_type: "internal".to_string(),
        },
    )
    .await
    .unwrap();

    tasks::claim_next(pool, "worker-001-kind", "internal", &[], 30.0)
        .await
        .unwrap()
        .expect("claim should succeed")
}

fn context(pool: &sqlx::PgPool, task: Task) -> ExecutionContext {
    ExecutionContext {
        pool: pool.clone(),
        task,
        worker_id: "worker-001-kind".to_string(),
        cancel: CancellationToken::new(),
    }
}

#[tokio::test]
async fn successful_run_streams_logs_turns_and_result() {
    let (pool, db_name) = create_test_db().await;
    let tmp = tempfile::tempdir().unwrap();

    let script = write_script(
        tmp.path(),
        "fake_orchestrator.sh",
        "#!/bin/sh\n\
         echo '{\"type\":\"log\",\"level\":\"info\",\"message\":\"provisioning cluster\"}'\n\
         echo '{\"type\":\"conversation\",\"role\":\"user\",\"content\":\"diagnose the outage\"}'\n\
         echo '{\"type\":\"conversation\",\"role\":\"assistant\",\"content\":\"checking pods\",\"tool_calls\":[{\"name\":\"kubectl\"}]}'\n\
         echo '{\"type\":\"usage\",\"tokens_prompt\":900,\"tokens_completion\":210,\"cost_estimate\":0.004}'\n\
         echo '{\"type\":\"result\",\"result\":{\"score\":0.75,\"resolved\":true}}'\n",
    );

    let task = claimed_task(&pool, "pod-crashloop-001").await;
    let task_id = task.id;
    let executor = OrchestratorExecutor::with_binary(script, 30);

    let outcome = executor.execute(&context(&pool, task)).await;
    match outcome {
        ExecutionOutcome::Completed(result) => {
            assert_eq!(result["score"], 0.75);
            assert_eq!(result["resolved"], true);
        }
        other => panic!("expected Completed, got {other:?}"),
    }

    let logs = task_logs::list_logs(&pool, task_id, None, 100).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].message, "provisioning cluster");

    let convs = conversations::list_for_task(&pool, task_id).await.unwrap();
    assert_eq!(convs.len(), 1);
    assert_eq!(convs[0].model, "gpt-4o");
    assert_eq!(convs[0].success, Some(true));
    assert_eq!(convs[0].tokens_prompt, 900);
    assert_eq!(convs[0].tokens_completion, 210);
    let messages = convs[0].messages.as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1]["tool_calls"][0]["name"], "kubectl");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn run_without_result_fails_with_details() {
    let (pool, db_name) = create_test_db().await;
    let tmp = tempfile::tempdir().unwrap();

    let script = write_script(
        tmp.path(),
        "broken_orchestrator.sh",
        "#!/bin/sh\n\
         echo '{\"type\":\"error\",\"message\":\"kind cluster failed to boot\"}'\n\
         exit 3\n",
    );

    let task = claimed_task(&pool, "unbootable-002").await;
    let task_id = task.id;
    let executor = OrchestratorExecutor::with_binary(script, 30);

    let outcome = executor.execute(&context(&pool, task)).await;
    match outcome {
        ExecutionOutcome::Failed(details) => {
            assert_eq!(details["kind"], "execution_failure");
            assert!(
                details["message"]
                    .as_str()
                    .unwrap()
                    .contains("kind cluster failed to boot")
            );
        }
        other => panic!("expected Failed, got {other:?}"),
    }

    let convs = conversations::list_for_task(&pool, task_id).await.unwrap();
    assert_eq!(convs[0].success, Some(false));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn missing_binary_fails_cleanly() {
    let (pool, db_name) = create_test_db().await;

    let task = claimed_task(&pool, "no-binary-003").await;
    let executor = OrchestratorExecutor::with_binary("/nonexistent/orchestrator", 30);

    let outcome = executor.execute(&context(&pool, task)).await;
    match outcome {
        ExecutionOutcome::Failed(details) => {
            assert!(
                details["message"]
                    .as_str()
                    .unwrap()
                    .contains("failed to spawn orchestrator binary")
            );
        }
        other => panic!("expected Failed, got {other:?}"),
    }

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cancellation_stops_long_running_subprocess() {
    let (pool, db_name) = create_test_db().await;
    let tmp = tempfile::tempdir().unwrap();

    let script = write_script(
        tmp.path(),
        "sleepy_orchestrator.sh",
        "#!/bin/sh\n\
         echo '{\"type\":\"log\",\"level\":\"info\",\"message\":\"starting\"}'\n\
         sleep 3600\n",
    );

    let task = claimed_task(&pool, "long-haul-004").await;
    let task_id = task.id;
    let executor = Arc::new(OrchestratorExecutor::with_binary(script, 30));

    let ctx = context(&pool, task);
    let cancel = ctx.cancel.clone();

    let run = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.execute(&ctx).await })
    };

    // Let it get going, then ask it to stop.
    tokio::time::sleep(Duration::from_millis(500)).await;
    cancel.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(15), run)
        .await
        .expect("executor should unwind promptly after cancellation")
        .unwrap();
    assert_eq!(outcome, ExecutionOutcome::Cancelled);

    let convs = conversations::list_for_task(&pool, task_id).await.unwrap();
    assert_eq!(convs[0].success, Some(false));

    pool.close().await;
    drop_test_db(&db_name).await;
}
