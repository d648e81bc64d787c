//! Database query functions for the `llm_conversations` table.
//!
//! A conversation is one agent session within a task. Messages live in a
//! JSONB array and are only ever appended, so their order is total within a
//! conversation.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::LlmConversation;

/// Parameters for opening a new conversation.
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub task_id: Uuid,
    pub model: String,
    /// Carries `problem_id`, `worker_id`, `cluster_id`.
    pub metadata: serde_json::Value,
}

/// Insert a new conversation row with an empty message array.
pub async fn insert_conversation(
    pool: &PgPool,
    new: &NewConversation,
) -> Result<LlmConversation, StoreError> {
    let conversation = sqlx::query_as::<_, LlmConversation>(
        "INSERT INTO llm_conversations (task_id, model, metadata) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(new.task_id)
    .bind(&new.model)
    .bind(&new.metadata)
    .fetch_one(pool)
    .await?;

    Ok(conversation)
}

/// Append one message object (`{role, content, timestamp, tool_calls?}`) to
/// a conversation's message array.
pub async fn append_message(
    pool: &PgPool,
    conversation_id: Uuid,
    message: serde_json::Value,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        "UPDATE llm_conversations \
         SET messages = messages || jsonb_build_array($2::jsonb), \
             updated_at = NOW() \
         WHERE conversation_id = $1",
    )
    .bind(conversation_id)
    .bind(&message)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::not_found(format!(
            "conversation {conversation_id} not found"
        )));
    }

    Ok(())
}

/// Close out a conversation: record the success flag, token totals, and
/// cost estimate.
pub async fn finish_conversation(
    pool: &PgPool,
    conversation_id: Uuid,
    success: bool,
    tokens_prompt: i64,
    tokens_completion: i64,
    cost_estimate: f64,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        "UPDATE llm_conversations \
         SET success = $2, tokens_prompt = $3, tokens_completion = $4, \
             cost_estimate = $5, updated_at = NOW() \
         WHERE conversation_id = $1",
    )
    .bind(conversation_id)
    .bind(success)
    .bind(tokens_prompt)
    .bind(tokens_completion)
    .bind(cost_estimate)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::not_found(format!(
            "conversation {conversation_id} not found"
        )));
    }

    Ok(())
}

/// Fetch a single conversation by ID.
pub async fn get_conversation(
    pool: &PgPool,
    conversation_id: Uuid,
) -> Result<Option<LlmConversation>, StoreError> {
    let conversation = sqlx::query_as::<_, LlmConversation>(
        "SELECT * FROM llm_conversations WHERE conversation_id = $1",
    )
    .bind(conversation_id)
    .fetch_optional(pool)
    .await?;

    Ok(conversation)
}

/// List conversations, newest first, optionally filtered by model.
pub async fn list_conversations(
    pool: &PgPool,
    model: Option<&str>,
    limit: i64,
    offset: i64,
) -> Result<Vec<LlmConversation>, StoreError> {
    let conversations = sqlx::query_as::<_, LlmConversation>(
        "SELECT * FROM llm_conversations \
         WHERE ($1::text IS NULL OR model = $1) \
         ORDER BY created_at DESC \
         LIMIT $2 OFFSET $3",
    )
    .bind(model)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    Ok(conversations)
}

/// List all conversations recorded for a task, oldest first.
pub async fn list_for_task(
    pool: &PgPool,
    task_id: Uuid,
) -> Result<Vec<LlmConversation>, StoreError> {
    let conversations = sqlx::query_as::<_, LlmConversation>(
        "SELECT * FROM llm_conversations \
         WHERE task_id = $1 \
         ORDER BY created_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await?;

    Ok(conversations)
}

/// Aggregates over all recorded conversations.
#[derive(Debug, Clone, Default, serde::Serialize, sqlx::FromRow)]
pub struct ConversationStats {
    pub total_conversations: i64,
    pub total_tokens_prompt: i64,
    pub total_tokens_completion: i64,
    pub total_cost_estimate: f64,
    pub succeeded: i64,
    pub failed: i64,
}

/// Summarize token usage, cost, and outcomes across all conversations.
pub async fn conversation_stats(pool: &PgPool) -> Result<ConversationStats, StoreError> {
    let stats = sqlx::query_as::<_, ConversationStats>(
        "SELECT COUNT(*) AS total_conversations, \
                COALESCE(SUM(tokens_prompt), 0)::bigint AS total_tokens_prompt, \
                COALESCE(SUM(tokens_completion), 0)::bigint AS total_tokens_completion, \
                COALESCE(SUM(cost_estimate), 0)::double precision AS total_cost_estimate, \
                COUNT(*) FILTER (WHERE success IS TRUE) AS succeeded, \
                COUNT(*) FILTER (WHERE success IS FALSE) AS failed \
         FROM llm_conversations",
    )
    .fetch_one(pool)
    .await?;

    Ok(stats)
}
