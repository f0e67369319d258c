use crate::{
    error::{Error, Result},
    models::conversation::{HistoryRecord, NewHistoryMessage},
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::DbConn;

/// Inserts one conversation message row. When an idempotency key is present,
/// a duplicate (business, customer, key) insert is silently ignored.
pub async fn insert_message(conn: &mut DbConn, msg: NewHistoryMessage) -> Result<u64> {
    let rows_affected = sqlx::query(
        r#"
        INSERT INTO bots.bot_customer_messages (
            business_id, business_name, agent_id, agent_name, service,
            thread_id, project_id, customer_id, idempotency_key,
            customer_message, assistant_response, business_response,
            created_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, now(), now())
        ON CONFLICT (business_id, customer_id, idempotency_key)
            WHERE idempotency_key IS NOT NULL
        DO NOTHING
        "#,
    )
    .bind(msg.business_id)
    .bind(&msg.business_name)
    .bind(msg.agent_id)
    .bind(&msg.agent_name)
    .bind(&msg.service)
    .bind(&msg.thread_id)
    .bind(&msg.project_id)
    .bind(&msg.customer_id)
    .bind(&msg.idempotency_key)
    .bind(&msg.customer_message)
    .bind(&msg.assistant_response)
    .bind(&msg.business_response)
    .execute(conn)
    .await
    .map_err(Error::Sqlx)?
    .rows_affected();

    Ok(rows_affected)
}

/// Upserts the per-(business, customer) summary row with the latest assistant
/// response. Tries the (business, agent, thread) unique key first, then falls
/// back to an insert keyed by (business, customer).
#[allow(clippy::too_many_arguments)]
pub async fn upsert_summary(
    conn: &mut DbConn,
    business_id: Uuid,
    business_name: &str,
    agent_id: Uuid,
    thread_id: Option<&str>,
    project_id: Option<&str>,
    customer_id: &str,
    assistant_response: &serde_json::Value,
) -> Result<()> {
    let updated: Option<(String,)> = sqlx::query_as(
        r#"
        UPDATE bots.bot_customers
        SET business_name = $1,
            project_id = $2,
            assistant_response = $3::jsonb,
            updated_at = now()
        WHERE business_id = $4 AND agent_id = $5 AND thread_id = $6
        RETURNING customer_id
        "#,
    )
    .bind(business_name)
    .bind(project_id)
    .bind(assistant_response)
    .bind(business_id)
    .bind(agent_id)
    .bind(thread_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(Error::Sqlx)?;

    if updated.is_some() {
        return Ok(());
    }

    sqlx::query(
        r#"
        INSERT INTO bots.bot_customers (
            business_id, business_name, agent_id, thread_id, project_id,
            customer_id, assistant_response, created_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7::jsonb, now(), now())
        ON CONFLICT (business_id, customer_id)
        DO UPDATE SET
            business_name = EXCLUDED.business_name,
            agent_id = EXCLUDED.agent_id,
            thread_id = EXCLUDED.thread_id,
            project_id = EXCLUDED.project_id,
            assistant_response = EXCLUDED.assistant_response,
            updated_at = now()
        "#,
    )
    .bind(business_id)
    .bind(business_name)
    .bind(agent_id)
    .bind(thread_id)
    .bind(project_id)
    .bind(customer_id)
    .bind(assistant_response)
    .execute(conn)
    .await
    .map_err(Error::Sqlx)?;

    Ok(())
}

/// Marks the conversation as read by the assistant.
pub async fn upsert_last_read(conn: &mut DbConn, business_id: Uuid, customer_id: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO bots.bot_customers (
            business_id, customer_id, last_read_at, created_at, updated_at
        ) VALUES ($1, $2, now(), now(), now())
        ON CONFLICT (business_id, customer_id)
        DO UPDATE
            SET last_read_at = now(),
                updated_at = now()
        "#,
    )
    .bind(business_id)
    .bind(customer_id)
    .execute(conn)
    .await
    .map_err(Error::Sqlx)?;

    Ok(())
}

/// Row shape for the manual-response override check.
#[derive(Debug, sqlx::FromRow)]
struct ManualResponseRow {
    manual_response: Option<bool>,
    manual_response_expires_at: Option<DateTime<Utc>>,
}

/// Returns whether a human-reply window is active for this (agent, customer).
/// An expired window is cleared as part of the check.
pub async fn is_manual_response(conn: &mut DbConn, agent_id: Uuid, customer_id: &str) -> Result<bool> {
    let row = sqlx::query_as::<_, ManualResponseRow>(
        r#"
        SELECT manual_response, manual_response_expires_at
        FROM bots.bot_customers
        WHERE agent_id = $1 AND customer_id = $2
        "#,
    )
    .bind(agent_id)
    .bind(customer_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(Error::Sqlx)?;

    let Some(row) = row else {
        return Ok(false);
    };
    if !row.manual_response.unwrap_or(false) {
        return Ok(false);
    }

    let Some(expires_at) = row.manual_response_expires_at else {
        // No expiry set: suppression stays active until a human clears it
        return Ok(true);
    };

    if Utc::now() > expires_at {
        sqlx::query(
            r#"
            UPDATE bots.bot_customers
                SET manual_response = FALSE,
                    manual_response_expires_at = NULL
            WHERE agent_id = $1 AND customer_id = $2
            "#,
        )
        .bind(agent_id)
        .bind(customer_id)
        .execute(conn)
        .await
        .map_err(Error::Sqlx)?;
        return Ok(false);
    }

    Ok(true)
}

/// Loads conversation history for a project-scoped thread, oldest first.
pub async fn get_project_messages(
    conn: &mut DbConn,
    business_id: Uuid,
    project_id: &str,
    customer_id: &str,
    limit: i64,
) -> Result<Vec<HistoryRecord>> {
    let rows = sqlx::query_as::<_, HistoryRecord>(
        r#"
        SELECT customer_message, assistant_response, business_response, created_at
        FROM bots.bot_customer_messages
        WHERE business_id = $1 AND project_id = $2 AND customer_id = $3
        ORDER BY created_at ASC
        LIMIT $4
        "#,
    )
    .bind(business_id)
    .bind(project_id)
    .bind(customer_id)
    .bind(limit)
    .fetch_all(conn)
    .await
    .map_err(Error::Sqlx)?;

    Ok(rows)
}

/// Loads conversation history for a plain (agent, thread) conversation,
/// oldest first.
pub async fn get_thread_messages(
    conn: &mut DbConn,
    business_id: Uuid,
    agent_id: Uuid,
    thread_id: &str,
    limit: i64,
) -> Result<Vec<HistoryRecord>> {
    let rows = sqlx::query_as::<_, HistoryRecord>(
        r#"
        SELECT customer_message, assistant_response, business_response, created_at
        FROM bots.bot_customer_messages
        WHERE business_id = $1 AND agent_id = $2 AND thread_id = $3 AND project_id IS NULL
        ORDER BY created_at ASC
        LIMIT $4
        "#,
    )
    .bind(business_id)
    .bind(agent_id)
    .bind(thread_id)
    .bind(limit)
    .fetch_all(conn)
    .await
    .map_err(Error::Sqlx)?;

    Ok(rows)
}

/// Resolves the assistant message a customer replied to, by message id.
pub async fn get_message_text_by_id(
    conn: &mut DbConn,
    customer_id: &str,
    message_id: &str,
) -> Result<Option<String>> {
    let row: Option<(Option<serde_json::Value>,)> = sqlx::query_as(
        r#"
        SELECT assistant_response
        FROM bots.bot_customer_messages
        WHERE customer_id = $1 AND idempotency_key = $2
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(customer_id)
    .bind(message_id)
    .fetch_optional(conn)
    .await
    .map_err(Error::Sqlx)?;

    Ok(row
        .and_then(|(value,)| value)
        .and_then(|v| v.get("content").and_then(|c| c.as_str()).map(|s| s.to_string())))
}
