use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use uuid::Uuid;

use vigil_server_domain::ports::{
    ActionState, ScheduledAction, ScheduledActionRepository,
};
use vigil_server_domain::shared_kernel::{ActionId, IncidentId, Result};

#[derive(Debug, FromRow)]
struct ActionRow {
    id: Uuid,
    incident_id: Option<Uuid>,
    action_type: String,
    run_at: DateTime<Utc>,
    state: String,
    payload: serde_json::Value,
    attempts: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
}

impl ActionRow {
    fn into_domain(self) -> Result<ScheduledAction> {
        Ok(ScheduledAction {
            id: ActionId(self.id),
            incident_id: self.incident_id.map(IncidentId),
            action_type: self.action_type,
            run_at: self.run_at,
            state: ActionState::parse(&self.state)?,
            payload: self.payload,
            attempts: self.attempts as u32,
            last_error: self.last_error,
            created_at: self.created_at,
        })
    }
}

#[derive(Clone)]
pub struct PostgresScheduledActionRepository {
    pool: PgPool,
}

impl PostgresScheduledActionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduledActionRepository for PostgresScheduledActionRepository {
    async fn schedule(&self, action: &ScheduledAction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_actions
                (id, incident_id, action_type, run_at, state, payload, attempts, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(action.id.0)
        .bind(action.incident_id.map(|incident| incident.0))
        .bind(&action.action_type)
        .bind(action.run_at)
        .bind(action.state.as_str())
        .bind(&action.payload)
        .bind(action.attempts as i32)
        .bind(action.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduledAction>> {
        // SKIP LOCKED keeps competing pollers from double-claiming without
        // blocking each other.
        let rows = sqlx::query_as::<_, ActionRow>(
            r#"
            WITH due AS (
                SELECT id
                FROM scheduled_actions
                WHERE state = 'scheduled' AND run_at <= $1
                ORDER BY run_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE scheduled_actions sa
            SET state = 'running'
            FROM due
            WHERE sa.id = due.id
            RETURNING sa.id, sa.incident_id, sa.action_type, sa.run_at, sa.state,
                      sa.payload, sa.attempts, sa.last_error, sa.created_at
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ActionRow::into_domain).collect()
    }

    async fn mark_done(&self, id: ActionId) -> Result<()> {
        sqlx::query(
            "UPDATE scheduled_actions SET state = 'done', attempts = attempts + 1 WHERE id = $1",
        )
        .bind(id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reschedule(&self, id: ActionId, run_at: DateTime<Utc>, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_actions
            SET state = 'scheduled',
                run_at = $2,
                attempts = attempts + 1,
                last_error = $3
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(run_at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: ActionId, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_actions
            SET state = 'failed',
                attempts = attempts + 1,
                last_error = $2
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel_for_incident(&self, incident_id: IncidentId) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_actions
            SET state = 'canceled'
            WHERE incident_id = $1 AND state = 'scheduled'
            "#,
        )
        .bind(incident_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn recover_running(&self) -> Result<u64> {
        let result =
            sqlx::query("UPDATE scheduled_actions SET state = 'scheduled' WHERE state = 'running'")
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn count_scheduled(&self, incident_id: IncidentId) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM scheduled_actions WHERE incident_id = $1 AND state = 'scheduled'",
        )
        .bind(incident_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn find_scheduled_by_type(&self, action_type: &str) -> Result<Vec<ScheduledAction>> {
        let rows = sqlx::query_as::<_, ActionRow>(
            r#"
            SELECT id, incident_id, action_type, run_at, state, payload,
                   attempts, last_error, created_at
            FROM scheduled_actions
            WHERE action_type = $1 AND state = 'scheduled'
            ORDER BY run_at ASC
            "#,
        )
        .bind(action_type)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ActionRow::into_domain).collect()
    }
}
