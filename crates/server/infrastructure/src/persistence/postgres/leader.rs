//! Scheduler leadership via a session-level advisory lock.
//!
//! The runner only starts after acquiring the lock; a replica that loses
//! the race stays passive and re-tries, so a crashed leader is replaced as
//! soon as its connection dies and the lock frees.

use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, Postgres};
use tracing::info;

use vigil_server_domain::shared_kernel::Result;

/// Well-known key; one leader per database.
const SCHEDULER_LEADER_KEY: i64 = 0x7669_6769_6c01;

/// Holds the leadership lock for as long as the value (and its pinned
/// connection) lives.
pub struct SchedulerLeaderLock {
    _conn: PoolConnection<Postgres>,
}

impl SchedulerLeaderLock {
    /// Try to become the scheduler leader. Returns `None` when another
    /// process already holds the lock.
    pub async fn try_acquire(pool: &PgPool) -> Result<Option<Self>> {
        let mut conn = pool.acquire().await.map_err(|e| {
            vigil_server_domain::shared_kernel::DomainError::InfrastructureError {
                message: format!("Failed to acquire connection for leader lock: {}", e),
            }
        })?;

        let (locked,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
            .bind(SCHEDULER_LEADER_KEY)
            .fetch_one(&mut *conn)
            .await?;

        if locked {
            info!("Scheduler leadership acquired");
            Ok(Some(Self { _conn: conn }))
        } else {
            Ok(None)
        }
    }
}
