use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use uuid::Uuid;

use vigil_server_domain::alerts::{
    Alert, AlertRepository, AlertStatus, CallAttempt, CallAttemptRepository, CallResult,
};
use vigil_server_domain::shared_kernel::{
    AlertId, CallAttemptId, Channel, DomainError, IncidentId, Result, UserId,
};

#[derive(Debug, FromRow)]
struct AlertRow {
    id: Uuid,
    incident_id: Uuid,
    audience_user_id: Uuid,
    channel: String,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    chat_message_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl AlertRow {
    fn into_domain(self) -> Result<Alert> {
        Ok(Alert {
            id: AlertId(self.id),
            incident_id: IncidentId(self.incident_id),
            audience_user_id: UserId(self.audience_user_id),
            channel: Channel::parse(&self.channel)?,
            status: AlertStatus::parse(&self.status)?,
            attempts: self.attempts as u32,
            last_error: self.last_error,
            chat_message_id: self.chat_message_id,
            created_at: self.created_at,
        })
    }
}

const ALERT_COLUMNS: &str = "id, incident_id, audience_user_id, channel, status, attempts, \
     last_error, chat_message_id, created_at";

#[derive(Clone)]
pub struct PostgresAlertRepository {
    pool: PgPool,
}

impl PostgresAlertRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AlertRepository for PostgresAlertRepository {
    async fn insert(&self, alert: &Alert) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO alerts
                (id, incident_id, audience_user_id, channel, status, attempts, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (incident_id, audience_user_id, channel) DO NOTHING
            "#,
        )
        .bind(alert.id.0)
        .bind(alert.incident_id.0)
        .bind(alert.audience_user_id.0)
        .bind(alert.channel.as_str())
        .bind(alert.status.as_str())
        .bind(alert.attempts as i32)
        .bind(alert.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::Validation {
                field: "alert".to_string(),
                reason: "Alert already exists for (incident, audience, channel)".to_string(),
            });
        }
        Ok(())
    }

    async fn find_by_id(&self, id: AlertId) -> Result<Option<Alert>> {
        let row = sqlx::query_as::<_, AlertRow>(&format!(
            "SELECT {} FROM alerts WHERE id = $1",
            ALERT_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(AlertRow::into_domain).transpose()
    }

    async fn find(
        &self,
        incident_id: IncidentId,
        audience_user_id: UserId,
        channel: Channel,
    ) -> Result<Option<Alert>> {
        let row = sqlx::query_as::<_, AlertRow>(&format!(
            r#"
            SELECT {}
            FROM alerts
            WHERE incident_id = $1 AND audience_user_id = $2 AND channel = $3
            "#,
            ALERT_COLUMNS
        ))
        .bind(incident_id.0)
        .bind(audience_user_id.0)
        .bind(channel.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(AlertRow::into_domain).transpose()
    }

    async fn find_for_incident(&self, incident_id: IncidentId) -> Result<Vec<Alert>> {
        let rows = sqlx::query_as::<_, AlertRow>(&format!(
            "SELECT {} FROM alerts WHERE incident_id = $1 ORDER BY created_at ASC",
            ALERT_COLUMNS
        ))
        .bind(incident_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AlertRow::into_domain).collect()
    }

    async fn update_status(
        &self,
        id: AlertId,
        status: AlertStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE alerts SET status = $2, last_error = COALESCE($3, last_error) WHERE id = $1")
            .bind(id.0)
            .bind(status.as_str())
            .bind(last_error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_chat_message_id(&self, id: AlertId, message_id: &str) -> Result<()> {
        sqlx::query("UPDATE alerts SET chat_message_id = $2 WHERE id = $1")
            .bind(id.0)
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn increment_attempts(&self, id: AlertId) -> Result<u32> {
        let (attempts,): (i32,) =
            sqlx::query_as("UPDATE alerts SET attempts = attempts + 1 WHERE id = $1 RETURNING attempts")
                .bind(id.0)
                .fetch_one(&self.pool)
                .await?;
        Ok(attempts as u32)
    }
}

#[derive(Debug, FromRow)]
struct CallAttemptRow {
    id: Uuid,
    alert_id: Uuid,
    provider_call_id: Option<String>,
    attempt_no: i32,
    result: String,
    dtmf_received: Option<String>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    error_code: Option<String>,
}

impl CallAttemptRow {
    fn into_domain(self) -> Result<CallAttempt> {
        Ok(CallAttempt {
            id: CallAttemptId(self.id),
            alert_id: AlertId(self.alert_id),
            provider_call_id: self.provider_call_id,
            attempt_no: self.attempt_no as u32,
            result: CallResult::parse(&self.result)?,
            dtmf_received: self.dtmf_received,
            started_at: self.started_at,
            ended_at: self.ended_at,
            error_code: self.error_code,
        })
    }
}

const ATTEMPT_COLUMNS: &str = "id, alert_id, provider_call_id, attempt_no, result, \
     dtmf_received, started_at, ended_at, error_code";

#[derive(Clone)]
pub struct PostgresCallAttemptRepository {
    pool: PgPool,
}

impl PostgresCallAttemptRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CallAttemptRepository for PostgresCallAttemptRepository {
    async fn insert(&self, attempt: &CallAttempt) -> Result<()> {
        // The partial unique index on (alert_id) WHERE result='pending'
        // enforces at most one live attempt per alert.
        let result = sqlx::query(
            r#"
            INSERT INTO call_attempts
                (id, alert_id, provider_call_id, attempt_no, result, started_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(attempt.id.0)
        .bind(attempt.alert_id.0)
        .bind(&attempt.provider_call_id)
        .bind(attempt.attempt_no as i32)
        .bind(attempt.result.as_str())
        .bind(attempt.started_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::Validation {
                field: "call_attempt".to_string(),
                reason: "Alert already has a pending attempt".to_string(),
            });
        }
        Ok(())
    }

    async fn find_by_id(&self, id: CallAttemptId) -> Result<Option<CallAttempt>> {
        let row = sqlx::query_as::<_, CallAttemptRow>(&format!(
            "SELECT {} FROM call_attempts WHERE id = $1",
            ATTEMPT_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(CallAttemptRow::into_domain).transpose()
    }

    async fn find_by_provider_call_id(
        &self,
        provider_call_id: &str,
    ) -> Result<Option<CallAttempt>> {
        let row = sqlx::query_as::<_, CallAttemptRow>(&format!(
            "SELECT {} FROM call_attempts WHERE provider_call_id = $1",
            ATTEMPT_COLUMNS
        ))
        .bind(provider_call_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(CallAttemptRow::into_domain).transpose()
    }

    async fn latest_for_alert(&self, alert_id: AlertId) -> Result<Option<CallAttempt>> {
        let row = sqlx::query_as::<_, CallAttemptRow>(&format!(
            "SELECT {} FROM call_attempts WHERE alert_id = $1 ORDER BY attempt_no DESC LIMIT 1",
            ATTEMPT_COLUMNS
        ))
        .bind(alert_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(CallAttemptRow::into_domain).transpose()
    }

    async fn record_placed(&self, id: CallAttemptId, provider_call_id: &str) -> Result<()> {
        sqlx::query("UPDATE call_attempts SET provider_call_id = $2 WHERE id = $1")
            .bind(id.0)
            .bind(provider_call_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_result(
        &self,
        id: CallAttemptId,
        result: CallResult,
        dtmf: Option<&str>,
        error_code: Option<&str>,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE call_attempts
            SET result = $2,
                dtmf_received = COALESCE($3, dtmf_received),
                error_code = COALESCE($4, error_code),
                ended_at = COALESCE($5, ended_at)
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(result.as_str())
        .bind(dtmf)
        .bind(error_code)
        .bind(ended_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn total_ring_secs(&self, alert_id: AlertId) -> Result<u32> {
        let (total,): (Option<f64>,) = sqlx::query_as(
            r#"
            SELECT SUM(EXTRACT(EPOCH FROM (ended_at - started_at)))::float8
            FROM call_attempts
            WHERE alert_id = $1 AND ended_at IS NOT NULL
            "#,
        )
        .bind(alert_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(total.unwrap_or(0.0).max(0.0) as u32)
    }
}
