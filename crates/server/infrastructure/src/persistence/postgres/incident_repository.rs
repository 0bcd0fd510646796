//! Incident repository with the advisory incident lock.
//!
//! Terminal transitions run in one transaction that also cancels the
//! incident's scheduled actions and enqueues the side-effect outbox rows,
//! so invariant "terminal incident has zero scheduled actions" holds at
//! every commit point.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use uuid::Uuid;

use vigil_server_domain::events::OutboxDraft;
use vigil_server_domain::incidents::{
    AckChannel, Incident, IncidentRepository, IncidentStatus, TerminalOutcome, TerminalTransition,
};
use vigil_server_domain::shared_kernel::{DomainError, IncidentId, Result, UserId};

/// How long a caller waits on the advisory lock before reporting
/// contention.
const LOCK_RETRY_WINDOW: Duration = Duration::from_secs(2);
const LOCK_RETRY_STEP: Duration = Duration::from_millis(50);

#[derive(Debug, FromRow)]
struct IncidentRow {
    id: Uuid,
    traveler_user_id: Uuid,
    status: String,
    created_at: DateTime<Utc>,
    acknowledged_at: Option<DateTime<Utc>>,
    acknowledged_by_user_id: Option<Uuid>,
    ack_channel: Option<String>,
    canceled_at: Option<DateTime<Utc>>,
}

impl IncidentRow {
    fn into_domain(self) -> Result<Incident> {
        Ok(Incident {
            id: IncidentId(self.id),
            traveler_user_id: UserId(self.traveler_user_id),
            status: IncidentStatus::parse(&self.status)?,
            created_at: self.created_at,
            acknowledged_at: self.acknowledged_at,
            acknowledged_by_user_id: self.acknowledged_by_user_id.map(UserId),
            ack_channel: self
                .ack_channel
                .as_deref()
                .map(AckChannel::parse)
                .transpose()?,
            canceled_at: self.canceled_at,
        })
    }
}

const SELECT_COLUMNS: &str = "id, traveler_user_id, status, created_at, acknowledged_at, \
     acknowledged_by_user_id, ack_channel, canceled_at";

/// Advisory-lock key derived from the incident id. Collisions only cost
/// extra serialization, never correctness.
fn advisory_key(id: IncidentId) -> i64 {
    let bytes = id.0.as_bytes();
    let mut first = [0u8; 8];
    first.copy_from_slice(&bytes[..8]);
    i64::from_le_bytes(first)
}

#[derive(Clone)]
pub struct PostgresIncidentRepository {
    pool: PgPool,
}

impl PostgresIncidentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IncidentRepository for PostgresIncidentRepository {
    async fn insert(&self, incident: &Incident) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO incidents (id, traveler_user_id, status, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(incident.id.0)
        .bind(incident.traveler_user_id.0)
        .bind(incident.status.as_str())
        .bind(incident.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: IncidentId) -> Result<Option<Incident>> {
        let row = sqlx::query_as::<_, IncidentRow>(&format!(
            "SELECT {} FROM incidents WHERE id = $1",
            SELECT_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(IncidentRow::into_domain).transpose()
    }

    async fn find_open_for_traveler(&self, traveler_user_id: UserId) -> Result<Option<Incident>> {
        let row = sqlx::query_as::<_, IncidentRow>(&format!(
            "SELECT {} FROM incidents WHERE traveler_user_id = $1 AND status = 'open'",
            SELECT_COLUMNS
        ))
        .bind(traveler_user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(IncidentRow::into_domain).transpose()
    }

    async fn transition_terminal(
        &self,
        id: IncidentId,
        transition: TerminalTransition,
        side_effects: Vec<OutboxDraft>,
    ) -> Result<TerminalOutcome> {
        let key = advisory_key(id);
        let deadline = Instant::now() + LOCK_RETRY_WINDOW;

        loop {
            let mut tx = self.pool.begin().await?;

            let (locked,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_xact_lock($1)")
                .bind(key)
                .fetch_one(&mut *tx)
                .await?;

            if !locked {
                tx.rollback().await.ok();
                if Instant::now() >= deadline {
                    return Err(DomainError::Contention { incident_id: id });
                }
                tokio::time::sleep(LOCK_RETRY_STEP).await;
                continue;
            }

            let row = sqlx::query_as::<_, IncidentRow>(&format!(
                "SELECT {} FROM incidents WHERE id = $1 FOR UPDATE",
                SELECT_COLUMNS
            ))
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(row) = row else {
                tx.rollback().await.ok();
                return Err(DomainError::IncidentNotFound { incident_id: id });
            };
            let incident = row.into_domain()?;

            if !incident.is_open() {
                tx.rollback().await.ok();
                return Ok(TerminalOutcome::AlreadyTerminal { incident });
            }

            let now = Utc::now();
            match &transition {
                TerminalTransition::Acknowledge { by, via } => {
                    sqlx::query(
                        r#"
                        UPDATE incidents
                        SET status = 'acknowledged',
                            acknowledged_at = $2,
                            acknowledged_by_user_id = $3,
                            ack_channel = $4
                        WHERE id = $1
                        "#,
                    )
                    .bind(id.0)
                    .bind(now)
                    .bind(by.0)
                    .bind(via.as_str())
                    .execute(&mut *tx)
                    .await?;
                }
                TerminalTransition::Cancel { .. } => {
                    sqlx::query(
                        "UPDATE incidents SET status = 'canceled', canceled_at = $2 WHERE id = $1",
                    )
                    .bind(id.0)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                }
            }

            sqlx::query(
                r#"
                UPDATE scheduled_actions
                SET state = 'canceled'
                WHERE incident_id = $1 AND state = 'scheduled'
                "#,
            )
            .bind(id.0)
            .execute(&mut *tx)
            .await?;

            for draft in &side_effects {
                sqlx::query(
                    r#"
                    INSERT INTO outbox_messages
                        (id, idempotency_key, channel, payload, status, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, 'pending', $5, $5)
                    ON CONFLICT (idempotency_key) DO NOTHING
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(&draft.idempotency_key)
                .bind(draft.channel.as_str())
                .bind(&draft.payload)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }

            let hangup_rows: Vec<(String,)> = sqlx::query_as(
                r#"
                SELECT ca.provider_call_id
                FROM call_attempts ca
                JOIN alerts a ON a.id = ca.alert_id
                WHERE a.incident_id = $1
                  AND ca.result IN ('pending', 'ringing', 'answered_human')
                  AND ca.provider_call_id IS NOT NULL
                "#,
            )
            .bind(id.0)
            .fetch_all(&mut *tx)
            .await?;

            tx.commit().await?;

            let mut updated = incident;
            updated.apply_terminal(&transition, now);

            return Ok(TerminalOutcome::Applied {
                incident: updated,
                hangup_provider_call_ids: hangup_rows.into_iter().map(|(id,)| id).collect(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_key_is_stable_per_incident() {
        let id = IncidentId::new();
        assert_eq!(advisory_key(id), advisory_key(id));
        assert_ne!(advisory_key(id), advisory_key(IncidentId::new()));
    }
}
