//! Orchestrator subprocess executor.
//!
//! Spawns the external AIOpsLab orchestrator as a child process and parses
//! its JSONL stdout into task logs and conversation turns. The orchestrator
//! is a black box; the whole interface is the command line built in
//! [`OrchestratorExecutor::command`] and the line protocol parsed by
//! [`parse_event_line`].

use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use drover_db::models::LogLevel;
use drover_db::queries::conversations::{self, NewConversation};
use drover_db::queries::task_logs;

use super::{ExecutionContext, ExecutionOutcome, Executor, agent_model, error_details, max_steps};

/// How often a running subprocess is checked for cooperative cancellation.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Grace period between SIGTERM and SIGKILL when stopping the subprocess.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// One parsed line of orchestrator output.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    /// A log line to persist under the task.
    Log { level: LogLevel, message: String },
    /// One LLM conversation turn.
    Turn {
        role: String,
        content: String,
        tool_calls: Option<serde_json::Value>,
    },
    /// Token usage totals for the session so far.
    Usage {
        tokens_prompt: i64,
        tokens_completion: i64,
        cost_estimate: f64,
    },
    /// The final result map; the run succeeded.
    Result { value: serde_json::Value },
    /// A fatal error reported by the orchestrator.
    Error { message: String },
}

/// Parse a single JSONL line from the orchestrator into an event.
///
/// Returns `Ok(None)` for recognised-but-ignorable lines (unknown `type`);
/// `Err` for lines that are not valid JSON. Callers treat `Err` as a
/// warning and keep reading.
pub fn parse_event_line(line: &str) -> anyhow::Result<Option<OrchestratorEvent>> {
    let v: serde_json::Value = serde_json::from_str(line)?;
    let event_type = v.get("type").and_then(|t| t.as_str()).unwrap_or("");

    let event = match event_type {
        "log" => {
            let level = v
                .get("level")
                .and_then(|l| l.as_str())
                .and_then(|l| LogLevel::from_str(l).ok())
                .unwrap_or(LogLevel::Info);
            let message = v
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("")
                .to_string();
            Some(OrchestratorEvent::Log { level, message })
        }
        "conversation" => {
            let role = v
                .get("role")
                .and_then(|r| r.as_str())
                .unwrap_or("assistant")
                .to_string();
            let content = v
                .get("content")
                .and_then(|c| c.as_str())
                .unwrap_or("")
                .to_string();
            let tool_calls = v.get("tool_calls").cloned();
            Some(OrchestratorEvent::Turn {
                role,
                content,
                tool_calls,
            })
        }
        "usage" => Some(OrchestratorEvent::Usage {
            tokens_prompt: v
                .get("tokens_prompt")
                .and_then(|t| t.as_i64())
                .unwrap_or(0),
            tokens_completion: v
                .get("tokens_completion")
                .and_then(|t| t.as_i64())
                .unwrap_or(0),
            cost_estimate: v
                .get("cost_estimate")
                .and_then(|c| c.as_f64())
                .unwrap_or(0.0),
        }),
        "result" => Some(OrchestratorEvent::Result {
            value: v
                .get("result")
                .cloned()
                .unwrap_or(serde_json::Value::Null),
        }),
        "error" => {
            let message = v
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown orchestrator error")
                .to_string();
            Some(OrchestratorEvent::Error { message })
        }
        other => {
            debug!(event_type = other, "ignoring unrecognised orchestrator event type");
            None
        }
    };

    Ok(event)
}

/// Executor that runs problems through the external orchestrator binary.
#[derive(Debug, Clone)]
pub struct OrchestratorExecutor {
    /// Path to the orchestrator binary. Defaults to `aiopslab-orchestrator`
    /// (found via `$PATH`).
    binary_path: String,
    default_max_steps: i64,
}

impl OrchestratorExecutor {
    pub fn new(default_max_steps: i64) -> Self {
        Self {
            binary_path: "aiopslab-orchestrator".to_string(),
            default_max_steps,
        }
    }

    /// Create an executor with a custom binary path (tests point this at a
    /// fixture script).
    pub fn with_binary(path: impl Into<String>, default_max_steps: i64) -> Self {
        Self {
            binary_path: path.into(),
            default_max_steps,
        }
    }

    /// Build the subprocess invocation for a task.
    fn command(&self, ctx: &ExecutionContext) -> Command {
        let task = &ctx.task;
        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("run")
            .arg("--problem-id")
            .arg(&task.problem_id)
            .arg("--max-steps")
            .arg(max_steps(task, self.default_max_steps).to_string());
        if let Some(model) = agent_model(task) {
            cmd.arg("--model").arg(model);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());
        cmd
    }
}

/// Stop a child process: SIGTERM first, then SIGKILL after a grace period.
async fn stop_child(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid belongs to a child we spawned.
        let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if ret != 0 {
            warn!(pid, "SIGTERM failed, proceeding to SIGKILL");
        }
    }

    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(Ok(_status)) => {
            debug!("orchestrator exited after SIGTERM");
        }
        _ => {
            debug!("orchestrator did not exit after SIGTERM, sending SIGKILL");
            let _ = child.kill().await;
        }
    }
}

#[async_trait]
impl Executor for OrchestratorExecutor {
    fn name(&self) -> &str {
        "orchestrator"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> ExecutionOutcome {
        let task = &ctx.task;

        let mut child = match self.command(ctx).spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecutionOutcome::Failed(error_details(
                    "execution_failure",
                    format!(
                        "failed to spawn orchestrator binary at {:?}: {e}",
                        self.binary_path
                    ),
                ));
            }
        };

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill().await;
            return ExecutionOutcome::Failed(error_details(
                "execution_failure",
                "orchestrator stdout was not piped",
            ));
        };

        let conversation = match conversations::insert_conversation(
            &ctx.pool,
            &NewConversation {
                task_id: task.id,
                model: agent_model(task).unwrap_or("").to_string(),
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
                stop_child(&mut child).await;
                return ExecutionOutcome::Failed(error_details(
                    "execution_failure",
                    format!("failed to open conversation: {e}"),
                ));
            }
        };

        let mut lines = BufReader::new(stdout).lines();
        let mut cancel_poll = tokio::time::interval(CANCEL_POLL_INTERVAL);
        cancel_poll.tick().await; // first tick is immediate

        let mut result: Option<serde_json::Value> = None;
        let mut last_error: Option<String> = None;
        let mut tokens_prompt = 0i64;
        let mut tokens_completion = 0i64;
        let mut cost_estimate = 0.0f64;

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        let event = match parse_event_line(trimmed) {
                            Ok(Some(event)) => event,
                            Ok(None) => continue,
                            Err(e) => {
                                warn!(line = trimmed, error = %e, "skipping malformed orchestrator line");
                                continue;
                            }
                        };
                        match event {
                            OrchestratorEvent::Log { level, message } => {
                                if let Err(e) = task_logs::append_log(
                                    &ctx.pool,
                                    task.id,
                                    level,
                                    &message,
                                    serde_json::json!({"worker_id": ctx.worker_id}),
                                )
                                .await
                                {
                                    warn!(task_id = %task.id, error = %e, "failed to persist orchestrator log");
                                }
                            }
                            OrchestratorEvent::Turn { role, content, tool_calls } => {
                                let mut turn = serde_json::json!({
                                    "role": role,
                                    "content": content,
                                    "timestamp": chrono::Utc::now(),
                                });
                                if let Some(tool_calls) = tool_calls {
                                    turn["tool_calls"] = tool_calls;
                                }
                                if let Err(e) = conversations::append_message(
                                    &ctx.pool,
                                    conversation.conversation_id,
                                    turn,
                                )
                                .await
                                {
                                    warn!(task_id = %task.id, error = %e, "failed to persist conversation turn");
                                }
                            }
                            OrchestratorEvent::Usage { tokens_prompt: p, tokens_completion: c, cost_estimate: cost } => {
                                tokens_prompt = p;
                                tokens_completion = c;
                                cost_estimate = cost;
                            }
                            OrchestratorEvent::Result { value } => {
                                result = Some(value);
                            }
                            OrchestratorEvent::Error { message } => {
                                last_error = Some(message);
                            }
                        }
                    }
                    Ok(None) => break, // EOF: orchestrator closed stdout
                    Err(e) => {
                        warn!(task_id = %task.id, error = %e, "error reading orchestrator stdout");
                        break;
                    }
                },
                _ = cancel_poll.tick() => {
                    if ctx.cancellation_requested().await {
                        stop_child(&mut child).await;
                        let _ = conversations::finish_conversation(
                            &ctx.pool,
                            conversation.conversation_id,
                            false,
                            tokens_prompt,
                            tokens_completion,
                            cost_estimate,
                        )
                        .await;
                        return ExecutionOutcome::Cancelled;
                    }
                }
            }
        }

        let exit = child.wait().await;

        let outcome = match (result, exit) {
            (Some(value), _) => ExecutionOutcome::Completed(value),
            (None, Ok(status)) => ExecutionOutcome::Failed(error_details(
                "execution_failure",
                match last_error {
                    Some(msg) => format!("orchestrator failed: {msg}"),
                    None => format!("orchestrator produced no result (exit {status})"),
                },
            )),
            (None, Err(e)) => ExecutionOutcome::Failed(error_details(
                "execution_failure",
                format!("failed to wait for orchestrator: {e}"),
            )),
        };

        let succeeded = matches!(outcome, ExecutionOutcome::Completed(_));
        if let Err(e) = conversations::finish_conversation(
            &ctx.pool,
            conversation.conversation_id,
            succeeded,
            tokens_prompt,
            tokens_completion,
            cost_estimate,
        )
        .await
        {
            warn!(task_id = %task.id, error = %e, "failed to close conversation");
        }

        outcome
    }
}
