//! Shared kernel: ids, errors and value types used across bounded contexts.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! entity_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

entity_id!(UserId);
entity_id!(GuardianLinkId);
entity_id!(IncidentId);
entity_id!(AlertId);
entity_id!(CallAttemptId);
entity_id!(ActionId);

/// Outbound channel a message or alert travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Chat,
    Voice,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Chat => "chat",
            Channel::Voice => "voice",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "chat" => Ok(Channel::Chat),
            "voice" => Ok(Channel::Voice),
            other => Err(DomainError::Validation {
                field: "channel".to_string(),
                reason: format!("Unknown channel: {}", other),
            }),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain errors
#[derive(thiserror::Error, Debug)]
pub enum DomainError {
    #[error("User not found: {user_id}")]
    UserNotFound { user_id: UserId },

    #[error("Incident not found: {incident_id}")]
    IncidentNotFound { incident_id: IncidentId },

    #[error("Alert not found: {alert_id}")]
    AlertNotFound { alert_id: AlertId },

    #[error("Call attempt not found: {attempt_id}")]
    CallAttemptNotFound { attempt_id: CallAttemptId },

    #[error("Invalid incident transition from {from} to {to} for incident {incident_id}")]
    InvalidStateTransition {
        incident_id: IncidentId,
        from: String,
        to: String,
    },

    #[error("Validation failed for {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("Unauthorized: {reason}")]
    Unauthorized { reason: String },

    #[error("Incident {incident_id} is locked by a concurrent handler")]
    Contention { incident_id: IncidentId },

    #[error("Transient error from provider {provider}: {message}")]
    ProviderTransient { provider: String, message: String },

    #[error("Permanent error from provider {provider}: {message}")]
    ProviderPermanent { provider: String, message: String },

    #[error("No handler registered for action type: {action_type}")]
    UnknownActionType { action_type: String },

    #[error("Infrastructure error: {message}")]
    InfrastructureError { message: String },
}

impl DomainError {
    /// Whether a retry of the same operation can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DomainError::Contention { .. }
                | DomainError::ProviderTransient { .. }
                | DomainError::InfrastructureError { .. }
        )
    }
}

impl From<sqlx::Error> for DomainError {
    fn from(error: sqlx::Error) -> Self {
        Self::InfrastructureError {
            message: format!("Database error: {}", error),
        }
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(error: serde_json::Error) -> Self {
        Self::InfrastructureError {
            message: format!("Serialization error: {}", error),
        }
    }
}

pub type Result<T> = std::result::Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_round_trips_through_str() {
        assert_eq!(Channel::parse("chat").unwrap(), Channel::Chat);
        assert_eq!(Channel::parse("voice").unwrap(), Channel::Voice);
        assert!(Channel::parse("sms").is_err());
    }

    #[test]
    fn retryable_classification() {
        let transient = DomainError::ProviderTransient {
            provider: "telegram".to_string(),
            message: "429".to_string(),
        };
        assert!(transient.is_retryable());

        let permanent = DomainError::ProviderPermanent {
            provider: "telegram".to_string(),
            message: "chat not found".to_string(),
        };
        assert!(!permanent.is_retryable());

        let contention = DomainError::Contention {
            incident_id: IncidentId::new(),
        };
        assert!(contention.is_retryable());
    }
}
