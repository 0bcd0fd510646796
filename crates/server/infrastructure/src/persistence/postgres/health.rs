use async_trait::async_trait;
use sqlx::postgres::PgPool;

use vigil_server_domain::ports::StoreHealth;
use vigil_server_domain::shared_kernel::Result;

#[derive(Clone)]
pub struct PostgresStoreHealth {
    pool: PgPool,
}

impl PostgresStoreHealth {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StoreHealth for PostgresStoreHealth {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
