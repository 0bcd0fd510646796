use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use uuid::Uuid;

use vigil_server_domain::events::OutboxDraft;
use vigil_server_domain::ports::{OutboxMessage, OutboxRepository, OutboxStatus};
use vigil_server_domain::shared_kernel::{Channel, DomainError, Result};

#[derive(Debug, FromRow)]
struct OutboxRow {
    id: Uuid,
    idempotency_key: String,
    channel: String,
    payload: serde_json::Value,
    status: String,
    provider_message_id: Option<String>,
    attempts: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl OutboxRow {
    fn into_domain(self) -> Result<OutboxMessage> {
        Ok(OutboxMessage {
            id: self.id,
            idempotency_key: self.idempotency_key,
            channel: Channel::parse(&self.channel)?,
            payload: self.payload,
            status: OutboxStatus::parse(&self.status)?,
            provider_message_id: self.provider_message_id,
            attempts: self.attempts as u32,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const SELECT_COLUMNS: &str = "id, idempotency_key, channel, payload, status, \
     provider_message_id, attempts, last_error, created_at, updated_at";

#[derive(Clone)]
pub struct PostgresOutboxRepository {
    pool: PgPool,
}

impl PostgresOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxRepository for PostgresOutboxRepository {
    async fn insert_pending(&self, draft: &OutboxDraft) -> Result<OutboxMessage> {
        let inserted = sqlx::query_as::<_, OutboxRow>(&format!(
            r#"
            INSERT INTO outbox_messages
                (id, idempotency_key, channel, payload, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'pending', $5, $5)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING {}
            "#,
            SELECT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&draft.idempotency_key)
        .bind(draft.channel.as_str())
        .bind(&draft.payload)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(row) => row.into_domain(),
            // First write won earlier; return the stored row unchanged.
            None => self
                .find_by_key(&draft.idempotency_key)
                .await?
                .ok_or_else(|| DomainError::InfrastructureError {
                    message: format!(
                        "Outbox row vanished for key {}",
                        draft.idempotency_key
                    ),
                }),
        }
    }

    async fn find_by_key(&self, idempotency_key: &str) -> Result<Option<OutboxMessage>> {
        let row = sqlx::query_as::<_, OutboxRow>(&format!(
            "SELECT {} FROM outbox_messages WHERE idempotency_key = $1",
            SELECT_COLUMNS
        ))
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(OutboxRow::into_domain).transpose()
    }

    async fn mark_sent(&self, id: Uuid, provider_message_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'sent',
                provider_message_id = $2,
                attempts = attempts + 1,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(provider_message_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'failed',
                last_error = $2,
                attempts = attempts + 1,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_undelivered(&self, limit: i64) -> Result<Vec<OutboxMessage>> {
        let rows = sqlx::query_as::<_, OutboxRow>(&format!(
            r#"
            SELECT {}
            FROM outbox_messages
            WHERE status <> 'sent'
            ORDER BY created_at ASC
            LIMIT $1
            "#,
            SELECT_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(OutboxRow::into_domain).collect()
    }
}
