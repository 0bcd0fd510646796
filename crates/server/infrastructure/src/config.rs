//! Environment-driven configuration.

use std::env;
use std::time::Duration;

use vigil_server_domain::guardians::CascadeDefaults;
use vigil_server_domain::shared_kernel::{DomainError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Development,
    Test,
    Staging,
    Production,
}

impl AppEnv {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "development" => Ok(AppEnv::Development),
            "test" => Ok(AppEnv::Test),
            "staging" => Ok(AppEnv::Staging),
            "production" => Ok(AppEnv::Production),
            other => Err(DomainError::Validation {
                field: "APP_ENV".to_string(),
                reason: format!("Unknown environment: {}", other),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AppEnv::Development => "development",
            AppEnv::Test => "test",
            AppEnv::Staging => "staging",
            AppEnv::Production => "production",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connection_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app_env: AppEnv,
    pub http_port: u16,
    pub public_base_url: String,
    pub database: DatabaseConfig,
    pub chat_bot_token: String,
    pub chat_webhook_secret: String,
    pub voice_api_key: String,
    pub voice_connection_id: String,
    pub voice_webhook_secret: String,
    pub admin_key: String,
    pub feature_panic: bool,
    pub scheduler_enabled: bool,
    pub scheduler_poll_interval: Duration,
    pub feature_allow_only_whitelist: bool,
    pub allowed_e164_numbers: Vec<String>,
    pub cascade_defaults: CascadeDefaults,
    pub call_max_duration_secs: u32,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let cascade_defaults = CascadeDefaults {
            ring_timeout_secs: env_u32("DEFAULT_RING_TIMEOUT_SEC", 25),
            max_retries: env_u32("DEFAULT_MAX_RETRIES", 2),
            retry_backoff_secs: env_u32("DEFAULT_RETRY_BACKOFF_SEC", 60),
            reminder_interval_secs: env_u32("DEFAULT_REMINDER_INTERVAL_SEC", 120),
            max_total_ring_secs: env_u32("INCIDENT_MAX_TOTAL_RING_SEC", 180),
        };

        Ok(Self {
            app_env: AppEnv::parse(&env_or("APP_ENV", "development"))?,
            http_port: env_u32("HTTP_PORT", 8000) as u16,
            public_base_url: env_or("PUBLIC_BASE_URL", "http://localhost:8000"),
            database: DatabaseConfig {
                url: required("DATABASE_URL")?,
                max_connections: env_u32("DB_MAX_CONNECTIONS", 10),
                connection_timeout: Duration::from_secs(u64::from(env_u32(
                    "DB_CONNECTION_TIMEOUT_SECS",
                    30,
                ))),
            },
            chat_bot_token: required("CHAT_BOT_TOKEN")?,
            chat_webhook_secret: required("CHAT_WEBHOOK_SECRET")?,
            voice_api_key: required("VOICE_API_KEY")?,
            voice_connection_id: required("VOICE_CONNECTION_ID")?,
            voice_webhook_secret: required("VOICE_WEBHOOK_SECRET")?,
            admin_key: required("ADMIN_KEY")?,
            feature_panic: env_bool("FEATURE_PANIC", true),
            scheduler_enabled: env_bool("SCHEDULER_ENABLED", true),
            scheduler_poll_interval: Duration::from_millis(u64::from(env_u32(
                "SCHEDULER_POLL_INTERVAL_MS",
                1_000,
            ))),
            feature_allow_only_whitelist: env_bool("FEATURE_ALLOW_ONLY_WHITELIST", false),
            allowed_e164_numbers: env_csv("ALLOWED_E164_NUMBERS"),
            cascade_defaults,
            call_max_duration_secs: env_u32("CALL_MAX_DURATION_SEC", 90),
        })
    }
}

fn required(key: &str) -> Result<String> {
    env::var(key).map_err(|_| DomainError::Validation {
        field: key.to_string(),
        reason: "Required environment variable is missing".to_string(),
    })
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| matches!(v.as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

fn env_csv(key: &str) -> Vec<String> {
    env::var(key)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_env_parses_known_values() {
        assert_eq!(AppEnv::parse("staging").unwrap(), AppEnv::Staging);
        assert!(AppEnv::parse("qa").is_err());
    }
}
