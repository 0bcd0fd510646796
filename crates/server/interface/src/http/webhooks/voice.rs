//! Voice provider webhook.
//!
//! Verifies the HMAC body signature, records the event in the inbox and
//! maps the provider's call lifecycle onto the closed inbound command set.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info};

use vigil_server_domain::commands::{AmdKind, InboundCommand};
use vigil_server_domain::shared_kernel::Result;

use crate::auth::verify_voice_signature;
use crate::http::AppState;

const SIGNATURE_HEADER: &str = "x-webhook-signature";
const TIMESTAMP_HEADER: &str = "x-webhook-timestamp";

#[derive(Debug, Deserialize)]
pub struct VoiceEvent {
    pub data: VoiceEventData,
}

#[derive(Debug, Deserialize)]
pub struct VoiceEventData {
    pub event_type: String,
    pub id: String,
    #[serde(default)]
    pub payload: VoiceEventPayload,
}

#[derive(Debug, Default, Deserialize)]
pub struct VoiceEventPayload {
    #[serde(default)]
    pub call_control_id: Option<String>,
    #[serde(default)]
    pub digit: Option<String>,
    #[serde(default)]
    pub hangup_cause: Option<String>,
    /// Answering-machine-detection verdict: "human" or "machine".
    #[serde(default)]
    pub result: Option<String>,
}

pub async fn handle(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let timestamp = headers
        .get(TIMESTAMP_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if !verify_voice_signature(&state.voice_webhook_secret, timestamp, &body, signature) {
        state
            .metrics
            .webhook_rejected
            .with_label_values(&["voice", "auth"])
            .inc();
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" })));
    }

    let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&body) else {
        state
            .metrics
            .webhook_rejected
            .with_label_values(&["voice", "malformed"])
            .inc();
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "malformed payload" })));
    };
    let Ok(event) = serde_json::from_value::<VoiceEvent>(payload.clone()) else {
        state
            .metrics
            .webhook_rejected
            .with_label_values(&["voice", "malformed"])
            .inc();
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "malformed payload" })));
    };

    info!(
        event_id = %event.data.id,
        event_type = %event.data.event_type,
        "Voice webhook received"
    );

    let event_id = event.data.id.clone();
    let inner_state = state.clone();
    let result = state
        .inbox
        .process("voice", &event_id, &payload, || {
            process_event(inner_state, event)
        })
        .await;

    if let Err(e) = result {
        error!(event_id = %event_id, error = %e, "Voice event processing failed");
    }

    (StatusCode::OK, Json(json!({})))
}

/// Domain handling for one fresh event. Shared with the inbox sweep.
pub(crate) async fn process_event(state: Arc<AppState>, event: VoiceEvent) -> Result<()> {
    let Some(command) = command_from_event(&event) else {
        debug!(event_type = %event.data.event_type, "Voice event type ignored");
        return Ok(());
    };
    state.dispatcher.dispatch(command).await
}

fn command_from_event(event: &VoiceEvent) -> Option<InboundCommand> {
    let call_id = event.data.payload.call_control_id.clone()?;

    match event.data.event_type.as_str() {
        "call.initiated" => Some(InboundCommand::VoiceInitiated {
            provider_call_id: call_id,
        }),
        "call.answered" => Some(InboundCommand::VoiceAnswered {
            provider_call_id: call_id,
        }),
        "call.dtmf.received" => {
            let digit = event
                .data
                .payload
                .digit
                .as_deref()
                .and_then(|d| d.chars().next())?;
            Some(InboundCommand::VoiceDigit {
                provider_call_id: call_id,
                digit,
            })
        }
        "call.hangup" => Some(InboundCommand::VoiceHangup {
            provider_call_id: call_id,
            cause: event
                .data
                .payload
                .hangup_cause
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
        }),
        "call.machine.detection.ended" => {
            let kind = match event.data.payload.result.as_deref() {
                Some("human") => AmdKind::Human,
                Some("machine") => AmdKind::Machine,
                _ => return None,
            };
            Some(InboundCommand::VoiceAmd {
                provider_call_id: call_id,
                kind,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: &str, payload: serde_json::Value) -> VoiceEvent {
        serde_json::from_value(json!({
            "data": {
                "event_type": event_type,
                "id": "evt_1",
                "payload": payload,
            }
        }))
        .unwrap()
    }

    #[test]
    fn maps_lifecycle_events_to_commands() {
        let cmd = command_from_event(&event(
            "call.dtmf.received",
            json!({ "call_control_id": "cc_1", "digit": "1" }),
        ));
        assert_eq!(
            cmd,
            Some(InboundCommand::VoiceDigit {
                provider_call_id: "cc_1".to_string(),
                digit: '1',
            })
        );

        let cmd = command_from_event(&event(
            "call.hangup",
            json!({ "call_control_id": "cc_1", "hangup_cause": "no_answer" }),
        ));
        assert_eq!(
            cmd,
            Some(InboundCommand::VoiceHangup {
                provider_call_id: "cc_1".to_string(),
                cause: "no_answer".to_string(),
            })
        );
    }

    #[test]
    fn unknown_event_types_are_ignored() {
        assert!(command_from_event(&event(
            "call.recording.saved",
            json!({ "call_control_id": "cc_1" })
        ))
        .is_none());
    }

    #[test]
    fn events_without_call_id_are_ignored() {
        assert!(command_from_event(&event("call.answered", json!({}))).is_none());
    }
}
