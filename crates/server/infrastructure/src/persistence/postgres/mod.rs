//! PostgreSQL persistence adapters.
//!
//! One repository per entity, all speaking runtime SQL over a shared
//! [`PgPool`]. Multi-row domain transitions run inside a single
//! transaction; the incident repository additionally serializes handlers
//! with a transaction-scoped advisory lock.

mod alert_repository;
mod guardian_link_repository;
mod health;
mod inbox_repository;
mod incident_repository;
mod leader;
mod migrations;
mod outbox_repository;
mod scheduled_action_repository;
mod user_repository;

pub use alert_repository::{PostgresAlertRepository, PostgresCallAttemptRepository};
pub use guardian_link_repository::PostgresGuardianLinkRepository;
pub use health::PostgresStoreHealth;
pub use inbox_repository::PostgresInboxRepository;
pub use incident_repository::PostgresIncidentRepository;
pub use leader::SchedulerLeaderLock;
pub use migrations::PostgresMigrator;
pub use outbox_repository::PostgresOutboxRepository;
pub use scheduled_action_repository::PostgresScheduledActionRepository;
pub use user_repository::PostgresUserRepository;

use sqlx::postgres::{PgPool, PgPoolOptions};

use vigil_server_domain::shared_kernel::{DomainError, Result};

use crate::config::DatabaseConfig;

/// Open the shared connection pool.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.connection_timeout)
        .connect(&config.url)
        .await
        .map_err(|e| DomainError::InfrastructureError {
            message: format!("Failed to connect to database: {}", e),
        })
}
