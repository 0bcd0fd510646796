//! Inbound provider events parsed into a closed set of tagged commands,
//! plus the compact callback-data codec carried by chat inline buttons.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::shared_kernel::{DomainError, IncidentId, Result};

/// Upper bound chat providers place on callback-data payloads.
pub const CALLBACK_DATA_MAX_BYTES: usize = 64;

const CALLBACK_VERSION: &str = "v1";

/// Answering-machine-detection verdict from the voice provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmdKind {
    Human,
    Machine,
}

/// Every webhook payload the core reacts to, as one tagged variant each.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundCommand {
    ChatAck {
        incident_id: IncidentId,
        chat_user_id: String,
        callback_id: String,
    },
    ChatCancel {
        incident_id: IncidentId,
        chat_user_id: String,
        callback_id: String,
    },
    VoiceInitiated {
        provider_call_id: String,
    },
    VoiceAnswered {
        provider_call_id: String,
    },
    VoiceDigit {
        provider_call_id: String,
        digit: char,
    },
    VoiceHangup {
        provider_call_id: String,
        cause: String,
    },
    VoiceAmd {
        provider_call_id: String,
        kind: AmdKind,
    },
}

/// Action encoded into a chat inline button.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Ack,
    Cancel,
}

impl CallbackAction {
    fn as_str(&self) -> &'static str {
        match self {
            CallbackAction::Ack => "ack",
            CallbackAction::Cancel => "cancel",
        }
    }
}

/// Encode `(action, incident)` as `v1|ack|{uuid}`, bounded to 64 bytes.
pub fn encode_callback(action: CallbackAction, incident_id: IncidentId) -> String {
    let data = format!("{}|{}|{}", CALLBACK_VERSION, action.as_str(), incident_id);
    debug_assert!(data.len() <= CALLBACK_DATA_MAX_BYTES);
    data
}

/// Parse callback data back into its action and incident id.
pub fn parse_callback(data: &str) -> Result<(CallbackAction, IncidentId)> {
    if data.len() > CALLBACK_DATA_MAX_BYTES {
        return Err(DomainError::Validation {
            field: "callback_data".to_string(),
            reason: format!("Payload exceeds {} bytes", CALLBACK_DATA_MAX_BYTES),
        });
    }

    let mut parts = data.splitn(3, '|');
    let version = parts.next().unwrap_or_default();
    let action = parts.next().unwrap_or_default();
    let incident = parts.next().unwrap_or_default();

    if version != CALLBACK_VERSION {
        return Err(DomainError::Validation {
            field: "callback_data".to_string(),
            reason: format!("Unsupported version: {}", version),
        });
    }

    let action = match action {
        "ack" => CallbackAction::Ack,
        "cancel" => CallbackAction::Cancel,
        other => {
            return Err(DomainError::Validation {
                field: "callback_data".to_string(),
                reason: format!("Unknown action: {}", other),
            })
        }
    };

    let incident_id = Uuid::parse_str(incident)
        .map(IncidentId)
        .map_err(|e| DomainError::Validation {
            field: "callback_data".to_string(),
            reason: format!("Invalid incident id: {}", e),
        })?;

    Ok((action, incident_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_round_trip() {
        let incident = IncidentId::new();

        for action in [CallbackAction::Ack, CallbackAction::Cancel] {
            let data = encode_callback(action, incident);
            assert!(data.len() <= CALLBACK_DATA_MAX_BYTES);
            let (parsed_action, parsed_incident) = parse_callback(&data).unwrap();
            assert_eq!(parsed_action, action);
            assert_eq!(parsed_incident, incident);
        }
    }

    #[test]
    fn rejects_foreign_payloads() {
        assert!(parse_callback("v2|ack|whatever").is_err());
        assert!(parse_callback("v1|boost|123").is_err());
        assert!(parse_callback("v1|ack|not-a-uuid").is_err());
        assert!(parse_callback("").is_err());

        let oversized = format!("v1|ack|{}", "f".repeat(80));
        assert!(parse_callback(&oversized).is_err());
    }
}
