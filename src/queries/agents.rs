use crate::{
    error::{Error, Result},
    models::agent::AgentConfigRow,
};
use uuid::Uuid;

use crate::DbConn;

/// Loads the agent configuration row for (business, agent).
pub async fn get_agent_config(
    conn: &mut DbConn,
    business_id: Uuid,
    agent_id: Uuid,
) -> Result<AgentConfigRow> {
    let row = sqlx::query_as::<_, AgentConfigRow>(
        r#"
        SELECT business_id, agent_id, agent_name, agent_role, agent_instructions,
               agent_tools, agent_channels, agent_active
        FROM bots.agent_configs
        WHERE business_id = $1 AND agent_id = $2
        "#,
    )
    .bind(business_id)
    .bind(agent_id)
    .fetch_optional(conn)
    .await
    .map_err(Error::Sqlx)?;

    row.ok_or_else(|| Error::NotFound(format!("agent {} not found for business {}", agent_id, business_id)))
}

/// Resolves the first active agent whose channels array contains the channel.
/// Used by non-WebSocket channel adapters that do not carry an agent id.
pub async fn find_active_agent_for_channel(
    conn: &mut DbConn,
    business_id: Uuid,
    channel: &str,
) -> Result<Option<(Uuid, String)>> {
    let row: Option<(Uuid, String)> = sqlx::query_as(
        r#"
        SELECT agent_id, agent_name
        FROM bots.agent_configs
        WHERE business_id = $1
            AND agent_active = TRUE
            AND agent_channels @> $2::jsonb
        LIMIT 1
        "#,
    )
    .bind(business_id)
    .bind(serde_json::json!([channel]))
    .fetch_optional(conn)
    .await
    .map_err(Error::Sqlx)?;

    Ok(row)
}

/// Loads a project's meta jsonb, if the project exists.
pub async fn get_project_meta(
    conn: &mut DbConn,
    business_id: Uuid,
    project_id: &str,
) -> Result<Option<serde_json::Value>> {
    let row: Option<(Option<serde_json::Value>,)> = sqlx::query_as(
        r#"
        SELECT meta
        FROM bots.projects
        WHERE business_id = $1 AND project_id = $2
        LIMIT 1
        "#,
    )
    .bind(business_id)
    .bind(project_id)
    .fetch_optional(conn)
    .await
    .map_err(Error::Sqlx)?;

    Ok(row.and_then(|(meta,)| meta))
}
