use crate::error::Result;
use crate::models::conversation::HistoryRecord;
use crate::queries;
use crate::DbPool;
use async_trait::async_trait;
use uuid::Uuid;

/// Most history rows fetched per conversation before the instance-side cap.
const HISTORY_FETCH_LIMIT: i64 = 500;

/// Conversation-history collaborator consumed by the agent instance.
#[async_trait]
pub trait Memory: Send + Sync {
    /// Prior turns for one conversation, oldest first.
    async fn history(
        &self,
        business_id: Uuid,
        agent_id: Uuid,
        thread_id: Option<&str>,
        project_id: Option<&str>,
        customer_id: &str,
    ) -> Result<Vec<HistoryRecord>>;
}

/// Postgres-backed history source.
pub struct DbMemory {
    pool: DbPool,
}

impl DbMemory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Memory for DbMemory {
    async fn history(
        &self,
        business_id: Uuid,
        agent_id: Uuid,
        thread_id: Option<&str>,
        project_id: Option<&str>,
        customer_id: &str,
    ) -> Result<Vec<HistoryRecord>> {
        let mut conn = self.pool.acquire().await?;

        let rows = match (project_id, thread_id) {
            (Some(project_id), _) => {
                queries::history::get_project_messages(
                    &mut conn,
                    business_id,
                    project_id,
                    customer_id,
                    HISTORY_FETCH_LIMIT,
                )
                .await?
            }
            (None, Some(thread_id)) => {
                queries::history::get_thread_messages(
                    &mut conn,
                    business_id,
                    agent_id,
                    thread_id,
                    HISTORY_FETCH_LIMIT,
                )
                .await?
            }
            (None, None) => Vec::new(),
        };

        Ok(rows.into_iter().filter(|r| !r.is_empty()).collect())
    }
}
