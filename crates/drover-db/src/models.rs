use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
///
/// `Completed`, `Failed`, `Timeout`, and `Cancelled` are terminal: once a
/// task reaches one of them, no operation may change its status again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is terminal (immutable).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Liveness status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Offline,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Offline => "offline",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkerStatus {
    type Err = WorkerStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "offline" => Ok(Self::Offline),
            other => Err(WorkerStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`WorkerStatus`] string.
#[derive(Debug, Clone)]
pub struct WorkerStatusParseError(pub String);

impl fmt::Display for WorkerStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid worker status: {:?}", self.0)
    }
}

impl std::error::Error for WorkerStatusParseError {}

// ---------------------------------------------------------------------------

/// Severity of a task log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for LogLevel {
    type Err = LogLevelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(LogLevelParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`LogLevel`] string.
#[derive(Debug, Clone)]
pub struct LogLevelParseError(pub String);

impl fmt::Display for LogLevelParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid log level: {:?}", self.0)
    }
}

impl std::error::Error for LogLevelParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task -- one AIOpsLab problem run queued for execution.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub problem_id: String,
    /// Submitted parameters; unknown keys preserved verbatim.
    pub parameters: serde_json::Value,
    pub priority: i32,
    /// Denormalized from `parameters.backend_type`; `internal` by default.
    pub backend_type: String,
    pub status: TaskStatus,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Deadline: `started_at` plus the task's `timeout_minutes`.
    pub timeout_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error_details: Option<serde_json::Value>,
}

/// An append-only log line recorded while a task runs.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskLog {
    pub id: i64,
    pub task_id: Uuid,
    /// Gap-free, strictly increasing per task.
    pub seq: i32,
    pub level: LogLevel,
    pub message: String,
    pub context: serde_json::Value,
    pub logged_at: DateTime<Utc>,
}

/// A worker -- an in-process claim loop or an external process polling the
/// HTTP worker endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Worker {
    /// Identifier matching `worker-NNN-kind`.
    pub worker_id: String,
    pub backend_type: String,
    pub max_parallel_tasks: i32,
    /// Substring patterns this worker accepts; empty means "accept any".
    pub supported_problems: Vec<String>,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub current_task_id: Option<Uuid>,
    pub tasks_completed: i64,
    pub tasks_failed: i64,
    pub metadata: serde_json::Value,
    pub registered_at: DateTime<Utc>,
}

/// One LLM agent session recorded during a task run.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LlmConversation {
    pub conversation_id: Uuid,
    pub task_id: Uuid,
    pub model: String,
    /// Ordered array of `{role, content, timestamp, tool_calls?}` objects.
    pub messages: serde_json::Value,
    pub tokens_prompt: i64,
    pub tokens_completion: i64,
    pub cost_estimate: f64,
    /// Carries `problem_id`, `worker_id`, `cluster_id`.
    pub metadata: serde_json::Value,
    /// Set when the session ends; `None` while in flight.
    pub success: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
