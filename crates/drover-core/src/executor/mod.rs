//! The `Executor` trait -- the adapter interface for problem-run backends.
//!
//! Each concrete executor (the internal stub, the orchestrator subprocess)
//! implements this trait. The trait is intentionally object-safe so a
//! worker loop can hold an `Arc<dyn Executor>` chosen at service start.

pub mod orchestrator;
pub mod stub;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use drover_db::models::{Task, TaskStatus};
use drover_db::queries::tasks;

pub use orchestrator::OrchestratorExecutor;
pub use stub::StubExecutor;

/// Everything an executor needs to run one claimed task.
#[derive(Clone)]
pub struct ExecutionContext {
    pub pool: PgPool,
    pub task: Task,
    pub worker_id: String,
    /// Cooperative stop signal from the worker manager (drain / shutdown).
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    /// Whether the run should stop: the manager asked this loop to stop, or
    /// the task row is no longer `running` (cancelled out from under us, or
    /// expired by the sweeper).
    ///
    /// Executors call this between steps; a store error here is treated as
    /// "keep going" since the deadline sweeper is the backstop.
    pub async fn cancellation_requested(&self) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        match tasks::get_task(&self.pool, self.task.id).await {
            Ok(Some(t)) => t.status != TaskStatus::Running,
            _ => false,
        }
    }
}

/// How a run ended. Executors never return errors to the worker loop;
/// anything that goes wrong becomes `Failed` with structured details.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// The run finished; the value becomes the task's `result`.
    Completed(serde_json::Value),
    /// The run failed; the value becomes the task's `error_details`.
    Failed(serde_json::Value),
    /// Cancellation was observed; the task row is already terminal
    /// (`cancelled`, or `timeout` via the sweeper).
    Cancelled,
}

/// Adapter interface for running a claimed task end to end.
///
/// Implementations write task logs and LLM conversations to the store as
/// side effects and must never block a shared event loop: subprocess waits
/// and other blocking work happen on their own tasks/threads.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Human-readable name (e.g. "stub", "orchestrator").
    fn name(&self) -> &str;

    /// Run the task to an outcome. Must observe
    /// [`ExecutionContext::cancellation_requested`] at convenient points.
    async fn execute(&self, ctx: &ExecutionContext) -> ExecutionOutcome;
}

// Compile-time assertion: Executor must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Executor) {}
};

/// Build a structured `error_details` map.
pub fn error_details(kind: &str, message: impl Into<String>) -> serde_json::Value {
    serde_json::json!({
        "kind": kind,
        "message": message.into(),
    })
}

/// Read `max_steps` from a task's parameters, falling back to the default.
pub(crate) fn max_steps(task: &Task, default: i64) -> i64 {
    task.parameters
        .get("max_steps")
        .and_then(|v| v.as_i64())
        .unwrap_or(default)
}

/// Read `agent_config.model` from a task's parameters.
pub(crate) fn agent_model(task: &Task) -> Option<&str> {
    task.parameters
        .get("agent_config")
        .and_then(|c| c.get("model"))
        .and_then(|m| m.as_str())
}
