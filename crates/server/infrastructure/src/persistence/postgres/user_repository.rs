use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use uuid::Uuid;

use vigil_server_domain::shared_kernel::{Result, UserId};
use vigil_server_domain::users::{User, UserRepository};

#[derive(Debug, FromRow)]
struct UserRow {
    id: Uuid,
    chat_user_id: String,
    phone_e164: Option<String>,
    display_name: String,
    language: String,
    created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: UserId(row.id),
            chat_user_id: row.chat_user_id,
            phone_e164: row.phone_e164,
            display_name: row.display_name,
            language: row.language,
            created_at: row.created_at,
        }
    }
}

const SELECT_COLUMNS: &str =
    "id, chat_user_id, phone_e164, display_name, language, created_at";

#[derive(Clone)]
pub struct PostgresUserRepository {
    pool: PgPool,
}

impl PostgresUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PostgresUserRepository {
    async fn insert(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, chat_user_id, phone_e164, display_name, language, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(user.id.0)
        .bind(&user.chat_user_id)
        .bind(&user.phone_e164)
        .bind(&user.display_name)
        .bind(&user.language)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {} FROM users WHERE id = $1",
            SELECT_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(User::from))
    }

    async fn find_by_chat_user_id(&self, chat_user_id: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {} FROM users WHERE chat_user_id = $1",
            SELECT_COLUMNS
        ))
        .bind(chat_user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(User::from))
    }

    async fn find_or_create(&self, chat_user_id: &str, display_name: &str) -> Result<User> {
        let user = User::new(chat_user_id, display_name);
        // Conflict-free insert: a concurrent create wins and is returned.
        let row = sqlx::query_as::<_, UserRow>(&format!(
            r#"
            INSERT INTO users (id, chat_user_id, phone_e164, display_name, language, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (chat_user_id) DO UPDATE SET chat_user_id = EXCLUDED.chat_user_id
            RETURNING {}
            "#,
            SELECT_COLUMNS
        ))
        .bind(user.id.0)
        .bind(&user.chat_user_id)
        .bind(&user.phone_e164)
        .bind(&user.display_name)
        .bind(&user.language)
        .bind(user.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(User::from(row))
    }

    async fn set_phone(&self, id: UserId, phone_e164: &str) -> Result<()> {
        sqlx::query("UPDATE users SET phone_e164 = $1 WHERE id = $2")
            .bind(phone_e164)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
