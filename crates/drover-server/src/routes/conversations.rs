//! LLM conversation endpoints: listing, per-task lookup, message filtering,
//! and the usage summary.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use serde::Deserialize;
use uuid::Uuid;

use drover_db::queries::conversations;

use crate::error::ApiError;
use crate::state::AppState;

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 200;

#[derive(Debug, Deserialize)]
pub struct ListConversationsQuery {
    pub model: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub role: Option<String>,
}

/// `GET /api/v1/llm-conversations`.
pub async fn list_conversations(
    State(state): State<AppState>,
    Query(query): Query<ListConversationsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let conversations = conversations::list_conversations(
        &state.pool,
        query.model.as_deref(),
        query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
        query.offset.unwrap_or(0).max(0),
    )
    .await?;

    Ok(Json(conversations))
}

/// `GET /api/v1/llm-conversations/{id}`.
pub async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let conversation = conversations::get_conversation(&state.pool, id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("conversation {id} not found")))?;

    Ok(Json(conversation))
}

/// `GET /api/v1/llm-conversations/{id}/messages?role=`.
///
/// Returns the ordered message array, optionally filtered to one role.
pub async fn messages(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<MessagesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let conversation = conversations::get_conversation(&state.pool, id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("conversation {id} not found")))?;

    let all = conversation
        .messages
        .as_array()
        .cloned()
        .unwrap_or_default();

    let filtered: Vec<serde_json::Value> = match &query.role {
        Some(role) => all
            .into_iter()
            .filter(|m| m.get("role").and_then(|r| r.as_str()) == Some(role.as_str()))
            .collect(),
        None => all,
    };

    Ok(Json(filtered))
}

/// `GET /api/v1/llm-conversations/task/{task_id}/conversations`.
pub async fn list_for_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let conversations = conversations::list_for_task(&state.pool, task_id).await?;
    Ok(Json(conversations))
}

/// `GET /api/v1/llm-conversations/stats/summary`.
pub async fn stats_summary(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let stats = conversations::conversation_stats(&state.pool).await?;
    Ok(Json(stats))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use uuid::Uuid;

    use drover_db::queries::conversations::{self, NewConversation};
    use drover_db::queries::tasks::{self, NewTask};
    use drover_test_utils::{create_test_db, drop_test_db};

    use crate::routes::test_support::{body_json, get, test_router};

    async fn seed_conversation(pool: &sqlx::PgPool) -> (Uuid, Uuid) {
        let task = tasks::insert_task(
            pool,
            &NewTask {
                problem_id: "seed-problem".to_string(),
                parameters: serde_json::json!({"backend_type": "internal"}),
                priority: 0,
                backend_type: "internal".to_string(),
            },
        )
        .await
        .expect("insert_task should succeed");

        let conversation = conversations::insert_conversation(
            pool,
            &NewConversation {
                task_id: task.id,
                model: "gpt-4o".to_string(),
                metadata: serde_json::json!({
                    "problem_id": "seed-problem",
                    "worker_id": "worker-001-kind",
                    "cluster_id": "worker-001-kind",
                }),
            },
        )
        .await
        .expect("insert_conversation should succeed");

        for (role, content) in [
            ("user", "investigate the failing service"),
            ("assistant", "checking pod status"),
            ("assistant", "found a crash loop"),
        ] {
            conversations::append_message(
                pool,
                conversation.conversation_id,
                serde_json::json!({"role": role, "content": content, "timestamp": chrono::Utc::now()}),
            )
            .await
            .expect("append_message should succeed");
        }

        (task.id, conversation.conversation_id)
    }

    #[tokio::test]
    async fn list_conversations_empty() {
        let (pool, db_name) = create_test_db().await;

        let resp = get(test_router(pool.clone()), "/api/v1/llm-conversations").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json, serde_json::json!([]));

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn conversation_detail_and_messages() {
        let (pool, db_name) = create_test_db().await;

        let (_task_id, conversation_id) = seed_conversation(&pool).await;

        let resp = get(
            test_router(pool.clone()),
            &format!("/api/v1/llm-conversations/{conversation_id}"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["model"], "gpt-4o");
        assert_eq!(json["messages"].as_array().unwrap().len(), 3);
        assert_eq!(json["metadata"]["cluster_id"], "worker-001-kind");

        // Role filter narrows to assistant turns, preserving order.
        let resp = get(
            test_router(pool.clone()),
            &format!("/api/v1/llm-conversations/{conversation_id}/messages?role=assistant"),
        )
        .await;
        let json = body_json(resp).await;
        let messages = json.as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["content"], "checking pod status");
        assert_eq!(messages[1]["content"], "found a crash loop");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn conversations_by_task() {
        let (pool, db_name) = create_test_db().await;

        let (task_id, conversation_id) = seed_conversation(&pool).await;

        let resp = get(
            test_router(pool.clone()),
            &format!("/api/v1/llm-conversations/task/{task_id}/conversations"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        let arr = json.as_array().unwrap();
        assert_eq!(arr.len(), 1);
        assert_eq!(
            arr[0]["conversation_id"].as_str().unwrap(),
            conversation_id.to_string()
        );

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn stats_summary_aggregates() {
        let (pool, db_name) = create_test_db().await;

        let (_task_id, conversation_id) = seed_conversation(&pool).await;
        conversations::finish_conversation(&pool, conversation_id, true, 1200, 300, 0.05)
            .await
            .expect("finish should succeed");

        let resp = get(
            test_router(pool.clone()),
            "/api/v1/llm-conversations/stats/summary",
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["total_conversations"], 1);
        assert_eq!(json["total_tokens_prompt"], 1200);
        assert_eq!(json["total_tokens_completion"], 300);
        assert_eq!(json["succeeded"], 1);
        assert_eq!(json["failed"], 0);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn conversation_not_found() {
        let (pool, db_name) = create_test_db().await;

        let missing = Uuid::new_v4();
        let resp = get(
            test_router(pool.clone()),
            &format!("/api/v1/llm-conversations/{missing}"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
