//! Internal stub executor.
//!
//! Simulates a problem run without touching a cluster: walks `max_steps`
//! steps, appending a task log line and a conversation turn per step, then
//! reports a result. This is the executor behind `backend_type = internal`
//! and the one the integration tests drive.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use drover_db::models::LogLevel;
use drover_db::queries::conversations::{self, NewConversation};
use drover_db::queries::task_logs;

use super::{ExecutionContext, ExecutionOutcome, Executor, agent_model, error_details, max_steps};

/// Simulated token counts per step.
const TOKENS_PROMPT_PER_STEP: i64 = 128;
const TOKENS_COMPLETION_PER_STEP: i64 = 64;

/// A stub backend that "solves" every problem in `max_steps` steps.
#[derive(Debug, Clone)]
pub struct StubExecutor {
    /// Step budget when the task does not carry `max_steps`.
    default_max_steps: i64,
    /// Pause between steps; gives cancellation a window in tests.
    step_delay: Duration,
}

impl StubExecutor {
    pub fn new(default_max_steps: i64) -> Self {
        Self {
            default_max_steps,
            step_delay: Duration::from_millis(25),
        }
    }

    /// Override the per-step delay (tests use longer delays to observe a
    /// run in flight).
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }
}

#[async_trait]
impl Executor for StubExecutor {
    fn name(&self) -> &str {
        "stub"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> ExecutionOutcome {
        let task = &ctx.task;
        let steps = max_steps(task, self.default_max_steps).max(1);
        let model = agent_model(task).unwrap_or("stub-model").to_string();

        // One agent session per run. Cluster assignment is 1:1 with the
        // worker; the store just records the value.
        let conversation = match conversations::insert_conversation(
            &ctx.pool,
            &NewConversation {
                task_id: task.id,
                model: model.clone(),
                metadata: serde_json::json!({
                    "problem_id": task.problem_id,
                    "worker_id": ctx.worker_id,
                    "cluster_id": ctx.worker_id,
                }),
            },
        )
        .await
        {
            Ok(c) => c,
            Err(e) => {
                return ExecutionOutcome::Failed(error_details(
                    "execution_failure",
                    format!("failed to open conversation: {e}"),
                ));
            }
        };

        let seed = serde_json::json!({
            "role": "user",
            "content": format!("Investigate problem {}", task.problem_id),
            "timestamp": chrono::Utc::now(),
        });
        if let Err(e) =
            conversations::append_message(&ctx.pool, conversation.conversation_id, seed).await
        {
            warn!(task_id = %task.id, error = %e, "failed to record seed message");
        }

        for step in 1..=steps {
            if ctx.cancellation_requested().await {
                let _ = conversations::finish_conversation(
                    &ctx.pool,
                    conversation.conversation_id,
                    false,
                    TOKENS_PROMPT_PER_STEP * step,
                    TOKENS_COMPLETION_PER_STEP * step,
                    0.0,
                )
                .await;
                return ExecutionOutcome::Cancelled;
            }

            if let Err(e) = task_logs::append_log(
                &ctx.pool,
                task.id,
                LogLevel::Info,
                &format!("step {step}/{steps}: probing {}", task.problem_id),
                serde_json::json!({"step": step, "worker_id": ctx.worker_id}),
            )
            .await
            {
                return ExecutionOutcome::Failed(error_details(
                    "execution_failure",
                    format!("failed to append step log: {e}"),
                ));
            }

            let turn = serde_json::json!({
                "role": "assistant",
                "content": format!("step {step}: inspecting {}", task.problem_id),
                "timestamp": chrono::Utc::now(),
            });
            if let Err(e) =
                conversations::append_message(&ctx.pool, conversation.conversation_id, turn).await
            {
                warn!(task_id = %task.id, error = %e, "failed to record turn");
            }

            tokio::time::sleep(self.step_delay).await;
        }

        if let Err(e) = conversations::finish_conversation(
            &ctx.pool,
            conversation.conversation_id,
            true,
            TOKENS_PROMPT_PER_STEP * steps,
            TOKENS_COMPLETION_PER_STEP * steps,
            0.0,
        )
        .await
        {
            warn!(task_id = %task.id, error = %e, "failed to close conversation");
        }

        ExecutionOutcome::Completed(serde_json::json!({
            "score": 1.0,
            "steps_executed": steps,
            "model": model,
        }))
    }
}
