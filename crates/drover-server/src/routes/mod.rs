//! Router assembly. Resource groups live under `/api/v1`; ops endpoints
//! (`/`, `/health`, `/queue/stats`, `/metrics`) sit at the server root.

pub mod conversations;
pub mod ops;
pub mod tasks;
pub mod workers;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        // Tasks
        .route("/tasks", post(tasks::create_task).get(tasks::list_tasks))
        .route("/tasks/stats", get(tasks::task_stats))
        .route("/tasks/{id}", get(tasks::get_task))
        .route("/tasks/{id}/cancel", post(tasks::cancel_task))
        .route("/tasks/{id}/logs", get(tasks::task_logs))
        // Workers
        .route(
            "/workers/register",
            post(workers::register),
        )
        .route("/workers", get(workers::list_workers))
        .route("/workers/internal/status", get(workers::internal_status))
        .route("/workers/internal/scale", post(workers::internal_scale))
        .route("/workers/internal/start", post(workers::internal_start))
        .route("/workers/internal/stop", post(workers::internal_stop))
        .route("/workers/{id}", get(workers::get_worker))
        .route("/workers/{id}/heartbeat", post(workers::heartbeat))
        .route("/workers/{id}/claim", post(workers::claim))
        .route(
            "/workers/{id}/tasks/{task_id}/complete",
            post(workers::complete_task),
        )
        .route(
            "/workers/{id}/tasks/{task_id}/fail",
            post(workers::fail_task),
        )
        .route("/workers/{id}/stats", get(workers::worker_stats))
        // Conversations
        .route(
            "/llm-conversations",
            get(conversations::list_conversations),
        )
        .route(
            "/llm-conversations/stats/summary",
            get(conversations::stats_summary),
        )
        .route(
            "/llm-conversations/task/{task_id}/conversations",
            get(conversations::list_for_task),
        )
        .route(
            "/llm-conversations/{id}",
            get(conversations::get_conversation),
        )
        .route(
            "/llm-conversations/{id}/messages",
            get(conversations::messages),
        );

    Router::new()
        .route("/", get(ops::index))
        .route("/health", get(ops::health))
        .route("/queue/stats", get(ops::queue_stats))
        .route("/metrics", get(ops::metrics))
        .nest("/api/v1", api)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------
