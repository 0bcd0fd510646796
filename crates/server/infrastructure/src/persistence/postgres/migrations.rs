//! Schema migrations, versioned linearly and applied at startup or through
//! the admin surface.

use async_trait::async_trait;
use sqlx::postgres::PgPool;

use vigil_server_domain::ports::{MigrationControl, MigrationStatus};
use vigil_server_domain::shared_kernel::Result;

/// (name, statement) pairs; names are recorded in `vigil_schema_migrations`
/// so the admin surface can report what has been applied.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_users",
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id              UUID PRIMARY KEY,
            chat_user_id    TEXT NOT NULL UNIQUE,
            phone_e164      TEXT,
            display_name    TEXT NOT NULL,
            language        TEXT NOT NULL DEFAULT 'ru-RU',
            created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "0002_guardian_links",
        r#"
        CREATE TABLE IF NOT EXISTS guardian_links (
            id                  UUID PRIMARY KEY,
            traveler_user_id    UUID NOT NULL REFERENCES users(id),
            watcher_user_id     UUID NOT NULL REFERENCES users(id),
            priority_rank       INT NOT NULL CHECK (priority_rank >= 1),
            ring_timeout_secs   INT NOT NULL,
            max_retries         INT NOT NULL,
            retry_backoff_secs  INT NOT NULL,
            chat_enabled        BOOLEAN NOT NULL DEFAULT TRUE,
            call_enabled        BOOLEAN NOT NULL DEFAULT TRUE,
            status              TEXT NOT NULL DEFAULT 'active',
            created_at          TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            CONSTRAINT uq_guardian_link UNIQUE (traveler_user_id, watcher_user_id)
        )
        "#,
    ),
    (
        "0003_incidents",
        r#"
        CREATE TABLE IF NOT EXISTS incidents (
            id                      UUID PRIMARY KEY,
            traveler_user_id        UUID NOT NULL REFERENCES users(id),
            status                  TEXT NOT NULL DEFAULT 'open',
            created_at              TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            acknowledged_at         TIMESTAMPTZ,
            acknowledged_by_user_id UUID REFERENCES users(id),
            ack_channel             TEXT,
            canceled_at             TIMESTAMPTZ
        )
        "#,
    ),
    (
        "0004_incidents_open_idx",
        r#"
        CREATE INDEX IF NOT EXISTS idx_incidents_open
        ON incidents(traveler_user_id)
        WHERE status = 'open'
        "#,
    ),
    (
        "0005_alerts",
        r#"
        CREATE TABLE IF NOT EXISTS alerts (
            id                UUID PRIMARY KEY,
            incident_id       UUID NOT NULL REFERENCES incidents(id),
            audience_user_id  UUID NOT NULL REFERENCES users(id),
            channel           TEXT NOT NULL,
            status            TEXT NOT NULL DEFAULT 'pending',
            attempts          INT NOT NULL DEFAULT 0,
            last_error        TEXT,
            chat_message_id   TEXT,
            created_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            CONSTRAINT uq_alert UNIQUE (incident_id, audience_user_id, channel)
        )
        "#,
    ),
    (
        "0006_call_attempts",
        r#"
        CREATE TABLE IF NOT EXISTS call_attempts (
            id                UUID PRIMARY KEY,
            alert_id          UUID NOT NULL REFERENCES alerts(id),
            provider_call_id  TEXT,
            attempt_no        INT NOT NULL,
            result            TEXT NOT NULL DEFAULT 'pending',
            dtmf_received     TEXT,
            started_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            ended_at          TIMESTAMPTZ,
            error_code        TEXT
        )
        "#,
    ),
    (
        "0007_call_attempts_pending_idx",
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS uq_call_attempts_pending
        ON call_attempts(alert_id)
        WHERE result = 'pending'
        "#,
    ),
    (
        "0008_call_attempts_provider_idx",
        r#"
        CREATE INDEX IF NOT EXISTS idx_call_attempts_provider
        ON call_attempts(provider_call_id)
        WHERE provider_call_id IS NOT NULL
        "#,
    ),
    (
        "0009_inbox_events",
        r#"
        CREATE TABLE IF NOT EXISTS inbox_events (
            id                 UUID PRIMARY KEY,
            provider           TEXT NOT NULL,
            provider_event_id  TEXT NOT NULL,
            payload            JSONB NOT NULL,
            received_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            processed_at       TIMESTAMPTZ,
            CONSTRAINT uq_inbox_event UNIQUE (provider, provider_event_id)
        )
        "#,
    ),
    (
        "0010_inbox_unprocessed_idx",
        r#"
        CREATE INDEX IF NOT EXISTS idx_inbox_unprocessed
        ON inbox_events(received_at)
        WHERE processed_at IS NULL
        "#,
    ),
    (
        "0011_outbox_messages",
        r#"
        CREATE TABLE IF NOT EXISTS outbox_messages (
            id                  UUID PRIMARY KEY,
            idempotency_key     TEXT NOT NULL UNIQUE,
            channel             TEXT NOT NULL,
            payload             JSONB NOT NULL,
            status              TEXT NOT NULL DEFAULT 'pending',
            provider_message_id TEXT,
            attempts            INT NOT NULL DEFAULT 0,
            last_error          TEXT,
            created_at          TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at          TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "0012_outbox_undelivered_idx",
        r#"
        CREATE INDEX IF NOT EXISTS idx_outbox_undelivered
        ON outbox_messages(created_at)
        WHERE status <> 'sent'
        "#,
    ),
    (
        "0013_scheduled_actions",
        r#"
        CREATE TABLE IF NOT EXISTS scheduled_actions (
            id           UUID PRIMARY KEY,
            incident_id  UUID REFERENCES incidents(id),
            action_type  TEXT NOT NULL,
            run_at       TIMESTAMPTZ NOT NULL,
            state        TEXT NOT NULL DEFAULT 'scheduled',
            payload      JSONB NOT NULL DEFAULT '{}',
            attempts     INT NOT NULL DEFAULT 0,
            last_error   TEXT,
            created_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "0014_scheduled_actions_due_idx",
        r#"
        CREATE INDEX IF NOT EXISTS idx_scheduled_actions_due
        ON scheduled_actions(run_at)
        WHERE state = 'scheduled'
        "#,
    ),
    (
        "0015_scheduled_actions_incident_idx",
        r#"
        CREATE INDEX IF NOT EXISTS idx_scheduled_actions_incident
        ON scheduled_actions(incident_id, state)
        "#,
    ),
];

pub struct PostgresMigrator {
    pool: PgPool,
}

impl PostgresMigrator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply all pending migrations. Statements are idempotent, so a crash
    /// between a statement and its bookkeeping row heals on the next run.
    pub async fn run_migrations(&self) -> Result<Vec<String>> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vigil_schema_migrations (
                name       TEXT PRIMARY KEY,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let mut applied = Vec::new();
        for (name, statement) in MIGRATIONS {
            let known: Option<(String,)> =
                sqlx::query_as("SELECT name FROM vigil_schema_migrations WHERE name = $1")
                    .bind(name)
                    .fetch_optional(&self.pool)
                    .await?;
            if known.is_some() {
                continue;
            }

            sqlx::query(statement).execute(&self.pool).await?;
            sqlx::query(
                "INSERT INTO vigil_schema_migrations (name) VALUES ($1) ON CONFLICT DO NOTHING",
            )
            .bind(name)
            .execute(&self.pool)
            .await?;
            applied.push(name.to_string());
        }

        Ok(applied)
    }
}

#[async_trait]
impl MigrationControl for PostgresMigrator {
    async fn apply(&self) -> Result<Vec<String>> {
        self.run_migrations().await
    }

    async fn status(&self) -> Result<MigrationStatus> {
        let table: Option<(String,)> = sqlx::query_as(
            "SELECT table_name::text FROM information_schema.tables WHERE table_name = 'vigil_schema_migrations'",
        )
        .fetch_optional(&self.pool)
        .await?;

        let applied: Vec<String> = if table.is_some() {
            sqlx::query_as::<_, (String,)>(
                "SELECT name FROM vigil_schema_migrations ORDER BY applied_at",
            )
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|(name,)| name)
            .collect()
        } else {
            Vec::new()
        };

        let pending = MIGRATIONS
            .iter()
            .map(|(name, _)| name.to_string())
            .filter(|name| !applied.contains(name))
            .collect();

        Ok(MigrationStatus { applied, pending })
    }
}
