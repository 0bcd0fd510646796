//! Users: travelers and the watchers that guard them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::shared_kernel::{DomainError, Result, UserId};

/// Default locale for user-facing text and TTS prompts.
pub const DEFAULT_LANGUAGE: &str = "ru-RU";

/// A person known to the system, identified by their chat-provider user id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    /// Chat-provider user id, unique per provider.
    pub chat_user_id: String,
    /// Phone in E.164, normalized before storage.
    pub phone_e164: Option<String>,
    pub display_name: String,
    pub language: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(chat_user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: UserId::new(),
            chat_user_id: chat_user_id.into(),
            phone_e164: None,
            display_name: display_name.into(),
            language: DEFAULT_LANGUAGE.to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn with_phone(mut self, phone_e164: impl Into<String>) -> Self {
        self.phone_e164 = Some(phone_e164.into());
        self
    }
}

/// Normalize a loosely formatted phone number into E.164.
///
/// Strips separators, folds the "00" international dialing prefix into
/// "+", requires a country code, caps at 15 digits. Rejection is an
/// edge-level validation error, never a mid-cascade failure.
pub fn normalize_e164(raw: &str) -> Result<String> {
    let mut digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    // "00" is the dialing-pad spelling of "+"; no country code starts
    // with 0, so this never eats real digits.
    if let Some(rest) = digits.strip_prefix("00") {
        digits = rest.to_string();
    }

    if digits.is_empty() {
        return Err(DomainError::Validation {
            field: "phone".to_string(),
            reason: "Phone number contains no digits".to_string(),
        });
    }

    if digits.len() < 8 || digits.len() > 15 {
        return Err(DomainError::Validation {
            field: "phone".to_string(),
            reason: format!("Expected 8..=15 digits, got {}", digits.len()),
        });
    }

    Ok(format!("+{}", digits))
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn insert(&self, user: &User) -> Result<()>;

    async fn find_by_id(&self, id: UserId) -> Result<Option<User>>;

    async fn find_by_chat_user_id(&self, chat_user_id: &str) -> Result<Option<User>>;

    /// Find a user by chat id, creating a minimal record when unknown.
    async fn find_or_create(&self, chat_user_id: &str, display_name: &str) -> Result<User>;

    async fn set_phone(&self, id: UserId, phone_e164: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_loose_formats() {
        assert_eq!(normalize_e164("+34 600 123 456").unwrap(), "+34600123456");
        assert_eq!(normalize_e164("8 (916) 123-45-67").unwrap(), "+89161234567");
        assert_eq!(normalize_e164("+15005550006").unwrap(), "+15005550006");
    }

    #[test]
    fn folds_international_dialing_prefix() {
        assert_eq!(normalize_e164("0034 600 123 456").unwrap(), "+34600123456");
        assert_eq!(normalize_e164("00 7 916 123 45 67").unwrap(), "+79161234567");
        // Too short once the prefix is gone.
        assert!(normalize_e164("0012345").is_err());
    }

    #[test]
    fn rejects_out_of_range_lengths() {
        assert!(normalize_e164("12345").is_err());
        assert!(normalize_e164("+123456789012345678").is_err());
        assert!(normalize_e164("call me").is_err());
    }

    #[test]
    fn new_user_defaults_to_russian() {
        let user = User::new("42", "Мария");
        assert_eq!(user.language, DEFAULT_LANGUAGE);
        assert!(user.phone_e164.is_none());
    }
}
