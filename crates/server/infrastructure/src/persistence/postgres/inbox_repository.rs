use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use uuid::Uuid;

use vigil_server_domain::ports::{InboxEvent, InboxOutcome, InboxRepository};
use vigil_server_domain::shared_kernel::Result;

#[derive(Debug, FromRow)]
struct InboxRow {
    id: Uuid,
    provider: String,
    provider_event_id: String,
    payload: serde_json::Value,
    received_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl From<InboxRow> for InboxEvent {
    fn from(row: InboxRow) -> Self {
        Self {
            id: row.id,
            provider: row.provider,
            provider_event_id: row.provider_event_id,
            payload: row.payload,
            received_at: row.received_at,
            processed_at: row.processed_at,
        }
    }
}

#[derive(Clone)]
pub struct PostgresInboxRepository {
    pool: PgPool,
}

impl PostgresInboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InboxRepository for PostgresInboxRepository {
    async fn record(
        &self,
        provider: &str,
        provider_event_id: &str,
        payload: &serde_json::Value,
    ) -> Result<InboxOutcome> {
        // The unique constraint is the dedupe: zero rows inserted means a
        // concurrent or earlier delivery won.
        let result = sqlx::query(
            r#"
            INSERT INTO inbox_events (id, provider, provider_event_id, payload, received_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (provider, provider_event_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(provider)
        .bind(provider_event_id)
        .bind(payload)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(InboxOutcome::Duplicate)
        } else {
            Ok(InboxOutcome::Fresh)
        }
    }

    async fn mark_processed(&self, provider: &str, provider_event_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE inbox_events
            SET processed_at = $3
            WHERE provider = $1 AND provider_event_id = $2 AND processed_at IS NULL
            "#,
        )
        .bind(provider)
        .bind(provider_event_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_unprocessed(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<InboxEvent>> {
        let rows = sqlx::query_as::<_, InboxRow>(
            r#"
            SELECT id, provider, provider_event_id, payload, received_at, processed_at
            FROM inbox_events
            WHERE processed_at IS NULL AND received_at < $1
            ORDER BY received_at ASC
            LIMIT $2
            "#,
        )
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(InboxEvent::from).collect())
    }
}
