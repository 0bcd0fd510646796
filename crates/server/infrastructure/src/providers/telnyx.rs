//! Telnyx-style call-control adapter for the voice port.
//!
//! The domain hands over an ordered instruction list; this adapter renders
//! it into the provider's action vocabulary (speak / gather / hangup) and
//! submits the call in one request.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use vigil_server_domain::ports::{CallInstruction, PlaceCallRequest, VoicePort};
use vigil_server_domain::shared_kernel::{DomainError, Result};

#[derive(Debug, Deserialize)]
struct CreateCallResponse {
    data: CreateCallData,
}

#[derive(Debug, Deserialize)]
struct CreateCallData {
    call_control_id: String,
}

pub struct TelnyxVoicePort {
    http: reqwest::Client,
    api_key: String,
    connection_id: String,
    base_url: String,
}

impl TelnyxVoicePort {
    pub fn new(
        http: reqwest::Client,
        api_key: impl Into<String>,
        connection_id: impl Into<String>,
    ) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            connection_id: connection_id.into(),
            base_url: "https://api.telnyx.com/v2".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| DomainError::ProviderTransient {
                provider: "telnyx".to_string(),
                message: format!("{} failed: {}", path, e),
            })?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(DomainError::ProviderTransient {
                provider: "telnyx".to_string(),
                message: format!("{} returned {}", path, status),
            });
        }
        if status.is_client_error() {
            let detail = response.text().await.unwrap_or_default();
            return Err(DomainError::ProviderPermanent {
                provider: "telnyx".to_string(),
                message: format!("{} returned {}: {}", path, status, detail),
            });
        }

        Ok(response)
    }
}

/// Render one domain instruction into the provider's action shape.
pub fn render_instruction(instruction: &CallInstruction) -> serde_json::Value {
    match instruction {
        CallInstruction::Speak { language, text } => json!({
            "type": "speak",
            "payload": text,
            "payload_type": "text",
            "language": language,
            "voice": "female",
        }),
        CallInstruction::GatherDtmf {
            max_digits,
            timeout_secs,
            finish_on_key,
        } => {
            let mut action = json!({
                "type": "gather",
                "input": ["dtmf"],
                "max_digits": max_digits,
                "timeout_ms": timeout_secs * 1_000,
            });
            if let Some(key) = finish_on_key {
                action["terminating_digit"] = json!(key.to_string());
            }
            action
        }
        CallInstruction::Hangup => json!({ "type": "hangup" }),
    }
}

#[async_trait]
impl VoicePort for TelnyxVoicePort {
    async fn place_call(&self, request: &PlaceCallRequest) -> Result<String> {
        let actions: Vec<serde_json::Value> =
            request.instructions.iter().map(render_instruction).collect();

        let body = json!({
            "to": request.to_e164,
            "from": self.connection_id,
            "connection_id": self.connection_id,
            "webhook_url": request.result_webhook_url,
            "timeout_secs": request.ring_timeout_secs,
            "time_limit_secs": request.max_duration_secs,
            "answering_machine_detection": "detect",
            "actions": actions,
        });

        let response = self.post("/calls", body).await?;
        let parsed: CreateCallResponse =
            response
                .json()
                .await
                .map_err(|e| DomainError::ProviderTransient {
                    provider: "telnyx".to_string(),
                    message: format!("create call body unreadable: {}", e),
                })?;

        debug!(
            call_control_id = %parsed.data.call_control_id,
            to = %request.to_e164,
            "Call placed"
        );
        Ok(parsed.data.call_control_id)
    }

    async fn hangup(&self, provider_call_id: &str) -> Result<()> {
        self.post(
            &format!("/calls/{}/actions/hangup", provider_call_id),
            json!({}),
        )
        .await?;
        debug!(provider_call_id, "Hangup requested");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speak_renders_language_and_text() {
        let action = render_instruction(&CallInstruction::Speak {
            language: "ru-RU".to_string(),
            text: "Тревога!".to_string(),
        });
        assert_eq!(action["type"], "speak");
        assert_eq!(action["language"], "ru-RU");
        assert_eq!(action["payload"], "Тревога!");
    }

    #[test]
    fn gather_converts_timeout_to_millis() {
        let action = render_instruction(&CallInstruction::GatherDtmf {
            max_digits: 1,
            timeout_secs: 10,
            finish_on_key: None,
        });
        assert_eq!(action["type"], "gather");
        assert_eq!(action["max_digits"], 1);
        assert_eq!(action["timeout_ms"], 10_000);
        assert!(action.get("terminating_digit").is_none());
    }

    #[test]
    fn gather_with_finish_key() {
        let action = render_instruction(&CallInstruction::GatherDtmf {
            max_digits: 1,
            timeout_secs: 5,
            finish_on_key: Some('#'),
        });
        assert_eq!(action["terminating_digit"], "#");
    }
}
