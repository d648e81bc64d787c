//! Task endpoints: submission, listing, inspection, cancellation, logs,
//! and queue-wide stats.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use uuid::Uuid;

use drover_db::models::{LogLevel, TaskStatus};
use drover_db::queries::{task_logs as log_db, tasks as task_db};

use crate::error::ApiError;
use crate::state::AppState;

const DEFAULT_PAGE_SIZE: i64 = 100;
const MAX_PAGE_SIZE: i64 = 500;

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub problem_id: String,
    pub parameters: Option<serde_json::Value>,
    pub priority: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    pub status: Option<String>,
    pub backend_type: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub level: Option<String>,
    pub limit: Option<i64>,
}

fn page_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `POST /api/v1/tasks` -- submit a task.
///
/// Defaults are applied for absent recognized keys (`backend_type`,
/// `max_steps`, `timeout_minutes`, `priority`); unknown parameter keys pass
/// through untouched. Refused with 503 while the service drains.
pub async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if state.is_draining() {
        return Err(ApiError::shutdown_in_progress());
    }

    if req.problem_id.trim().is_empty() {
        return Err(ApiError::validation("problem_id must be non-empty"));
    }

    let mut parameters = req.parameters.unwrap_or_else(|| serde_json::json!({}));
    let Some(params) = parameters.as_object_mut() else {
        return Err(ApiError::validation("parameters must be an object"));
    };

    // backend_type: default `internal`; anything else must be a string.
    let backend_type = match params.get("backend_type") {
        None => {
            params.insert(
                "backend_type".to_string(),
                serde_json::Value::String("internal".to_string()),
            );
            "internal".to_string()
        }
        Some(serde_json::Value::String(s)) if !s.is_empty() => s.clone(),
        Some(_) => {
            return Err(ApiError::validation(
                "parameters.backend_type must be a non-empty string",
            ));
        }
    };

    match params.get("max_steps") {
        None => {
            params.insert(
                "max_steps".to_string(),
                serde_json::Value::from(state.config.default_max_steps),
            );
        }
        Some(v) if v.as_i64().is_some_and(|n| n > 0) => {}
        Some(_) => {
            return Err(ApiError::validation(
                "parameters.max_steps must be a positive integer",
            ));
        }
    }

    match params.get("timeout_minutes") {
        None => {
            params.insert(
                "timeout_minutes".to_string(),
                serde_json::Value::from(state.config.default_timeout_minutes),
            );
        }
        Some(v) if v.as_f64().is_some_and(|n| n > 0.0) => {}
        Some(_) => {
            return Err(ApiError::validation(
                "parameters.timeout_minutes must be a positive number",
            ));
        }
    }

    // Priority: top-level field wins, then `parameters.priority`, then the
    // configured default.
    let priority = match req.priority {
        Some(p) => p,
        None => match params.get("priority") {
            Some(v) => v
                .as_i64()
                .and_then(|n| i32::try_from(n).ok())
                .ok_or_else(|| ApiError::validation("parameters.priority must be an integer"))?,
            None => state.config.default_priority,
        },
    };

    let task = task_db::insert_task(
        &state.pool,
        &task_db::NewTask {
            problem_id: req.problem_id,
            parameters,
            priority,
            backend_type,
        },
    )
    .await?;

    metrics::counter!("drover_tasks_submitted_total").increment(1);
    tracing::info!(task_id = %task.id, problem_id = %task.problem_id, "task submitted");

    Ok((StatusCode::CREATED, Json(task)))
}

/// `GET /api/v1/tasks` -- list tasks with optional filters.
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(|s| {
            s.parse::<TaskStatus>()
                .map_err(|e| ApiError::validation(e.to_string()))
        })
        .transpose()?;

    let tasks = task_db::list_tasks(
        &state.pool,
        status,
        query.backend_type.as_deref(),
        page_limit(query.limit),
        query.offset.unwrap_or(0).max(0),
    )
    .await?;

    Ok(Json(tasks))
}

/// `GET /api/v1/tasks/{id}`.
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let task = task_db::get_task(&state.pool, id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("task {id} not found")))?;

    Ok(Json(task))
}

/// `POST /api/v1/tasks/{id}/cancel`.
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let task = task_db::cancel_task(&state.pool, id).await?;
    tracing::info!(task_id = %id, "task cancelled");
    Ok(Json(task))
}

/// `GET /api/v1/tasks/{id}/logs?level=&limit=`.
pub async fn task_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    task_db::get_task(&state.pool, id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("task {id} not found")))?;

    let level = query
        .level
        .as_deref()
        .map(|l| {
            l.parse::<LogLevel>()
                .map_err(|e| ApiError::validation(e.to_string()))
        })
        .transpose()?;

    let logs = log_db::list_logs(&state.pool, id, level, page_limit(query.limit)).await?;
    Ok(Json(logs))
}

/// `GET /api/v1/tasks/stats`.
pub async fn task_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let stats = task_db::task_stats(&state.pool).await?;
    Ok(Json(stats))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
