//! Outbox drafts: the serialized intent handed to the outbox dispatcher,
//! either directly or transactionally alongside an incident transition.

use serde::{Deserialize, Serialize};

use crate::ports::{InlineButton, PlaceCallRequest};
use crate::shared_kernel::{AlertId, CallAttemptId, Channel, Result};

/// What the chat provider should do when the outbox row is delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChatDelivery {
    Send {
        chat_id: String,
        text: String,
        #[serde(default)]
        buttons: Vec<InlineButton>,
        /// Alert whose `chat_message_id` the send populates, when any.
        #[serde(default)]
        alert_id: Option<AlertId>,
    },
    Edit {
        chat_id: String,
        message_id: String,
        text: String,
        #[serde(default)]
        buttons: Vec<InlineButton>,
    },
}

/// Voice delivery: the call placement plus the attempt it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceDelivery {
    pub attempt_id: CallAttemptId,
    pub request: PlaceCallRequest,
}

/// An outbox row before insertion: key, channel and serialized payload.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxDraft {
    pub idempotency_key: String,
    pub channel: Channel,
    pub payload: serde_json::Value,
}

impl OutboxDraft {
    pub fn chat(idempotency_key: String, delivery: &ChatDelivery) -> Result<Self> {
        Ok(Self {
            idempotency_key,
            channel: Channel::Chat,
            payload: serde_json::to_value(delivery)?,
        })
    }

    pub fn voice(idempotency_key: String, delivery: &VoiceDelivery) -> Result<Self> {
        Ok(Self {
            idempotency_key,
            channel: Channel::Voice,
            payload: serde_json::to_value(delivery)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_delivery_round_trips_as_json() {
        let delivery = ChatDelivery::Send {
            chat_id: "100200".to_string(),
            text: "🚨".to_string(),
            buttons: vec![InlineButton {
                label: "✅ Ясно".to_string(),
                callback_data: "v1|ack|x".to_string(),
            }],
            alert_id: None,
        };

        let draft = OutboxDraft::chat("chat:i:a:alert".to_string(), &delivery).unwrap();
        assert_eq!(draft.channel, Channel::Chat);

        let parsed: ChatDelivery = serde_json::from_value(draft.payload).unwrap();
        assert_eq!(parsed, delivery);
    }
}
