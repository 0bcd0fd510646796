use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use uuid::Uuid;

use vigil_server_domain::guardians::{
    GuardianLink, GuardianLinkRepository, GuardianLinkStatus,
};
use vigil_server_domain::shared_kernel::{GuardianLinkId, Result, UserId};

#[derive(Debug, FromRow)]
struct GuardianLinkRow {
    id: Uuid,
    traveler_user_id: Uuid,
    watcher_user_id: Uuid,
    priority_rank: i32,
    ring_timeout_secs: i32,
    max_retries: i32,
    retry_backoff_secs: i32,
    chat_enabled: bool,
    call_enabled: bool,
    status: String,
    created_at: DateTime<Utc>,
}

impl GuardianLinkRow {
    fn into_domain(self) -> Result<GuardianLink> {
        Ok(GuardianLink {
            id: GuardianLinkId(self.id),
            traveler_user_id: UserId(self.traveler_user_id),
            watcher_user_id: UserId(self.watcher_user_id),
            priority_rank: self.priority_rank as u32,
            ring_timeout_secs: self.ring_timeout_secs as u32,
            max_retries: self.max_retries as u32,
            retry_backoff_secs: self.retry_backoff_secs as u32,
            chat_enabled: self.chat_enabled,
            call_enabled: self.call_enabled,
            status: GuardianLinkStatus::parse(&self.status)?,
            created_at: self.created_at,
        })
    }
}

const SELECT_COLUMNS: &str = "id, traveler_user_id, watcher_user_id, priority_rank, \
     ring_timeout_secs, max_retries, retry_backoff_secs, chat_enabled, call_enabled, \
     status, created_at";

#[derive(Clone)]
pub struct PostgresGuardianLinkRepository {
    pool: PgPool,
}

impl PostgresGuardianLinkRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GuardianLinkRepository for PostgresGuardianLinkRepository {
    async fn insert(&self, link: &GuardianLink) -> Result<()> {
        link.validate()?;
        sqlx::query(
            r#"
            INSERT INTO guardian_links (
                id, traveler_user_id, watcher_user_id, priority_rank,
                ring_timeout_secs, max_retries, retry_backoff_secs,
                chat_enabled, call_enabled, status, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(link.id.0)
        .bind(link.traveler_user_id.0)
        .bind(link.watcher_user_id.0)
        .bind(link.priority_rank as i32)
        .bind(link.ring_timeout_secs as i32)
        .bind(link.max_retries as i32)
        .bind(link.retry_backoff_secs as i32)
        .bind(link.chat_enabled)
        .bind(link.call_enabled)
        .bind(link.status.as_str())
        .bind(link.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn active_for_traveler(&self, traveler_user_id: UserId) -> Result<Vec<GuardianLink>> {
        let rows = sqlx::query_as::<_, GuardianLinkRow>(&format!(
            r#"
            SELECT {}
            FROM guardian_links
            WHERE traveler_user_id = $1 AND status = 'active'
            ORDER BY priority_rank ASC, created_at ASC
            "#,
            SELECT_COLUMNS
        ))
        .bind(traveler_user_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(GuardianLinkRow::into_domain).collect()
    }

    async fn find(
        &self,
        traveler_user_id: UserId,
        watcher_user_id: UserId,
    ) -> Result<Option<GuardianLink>> {
        let row = sqlx::query_as::<_, GuardianLinkRow>(&format!(
            "SELECT {} FROM guardian_links WHERE traveler_user_id = $1 AND watcher_user_id = $2",
            SELECT_COLUMNS
        ))
        .bind(traveler_user_id.0)
        .bind(watcher_user_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(GuardianLinkRow::into_domain).transpose()
    }

    async fn revoke(&self, id: GuardianLinkId) -> Result<()> {
        sqlx::query("UPDATE guardian_links SET status = 'revoked' WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
