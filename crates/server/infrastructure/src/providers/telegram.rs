//! Telegram Bot API adapter for the chat port.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use vigil_server_domain::ports::{ChatPort, InlineButton};
use vigil_server_domain::shared_kernel::{DomainError, Result};

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<ReplyMarkup>,
}

#[derive(Debug, Serialize)]
struct EditMessageRequest<'a> {
    chat_id: &'a str,
    message_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<ReplyMarkup>,
}

#[derive(Debug, Serialize)]
struct AnswerCallbackRequest<'a> {
    callback_query_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    show_alert: bool,
}

#[derive(Debug, Serialize)]
struct ReplyMarkup {
    inline_keyboard: Vec<Vec<InlineKeyboardButton>>,
}

#[derive(Debug, Serialize)]
struct InlineKeyboardButton {
    text: String,
    callback_data: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    description: Option<String>,
}

pub struct TelegramChatPort {
    http: reqwest::Client,
    bot_token: String,
    base_url: String,
}

impl TelegramChatPort {
    pub fn new(http: reqwest::Client, bot_token: impl Into<String>) -> Self {
        Self {
            http,
            bot_token: bot_token.into(),
            base_url: "https://api.telegram.org".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn call<T: Serialize>(&self, method: &str, payload: &T) -> Result<ApiResponse> {
        let url = format!("{}/bot{}/{}", self.base_url, self.bot_token, method);

        let response = self
            .http
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| DomainError::ProviderTransient {
                provider: "telegram".to_string(),
                message: format!("{} failed: {}", method, e),
            })?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(DomainError::ProviderTransient {
                provider: "telegram".to_string(),
                message: format!("{} returned {}", method, status),
            });
        }

        let body: ApiResponse =
            response
                .json()
                .await
                .map_err(|e| DomainError::ProviderTransient {
                    provider: "telegram".to_string(),
                    message: format!("{} body unreadable: {}", method, e),
                })?;

        if !body.ok {
            return Err(DomainError::ProviderPermanent {
                provider: "telegram".to_string(),
                message: body
                    .description
                    .unwrap_or_else(|| format!("{} rejected", method)),
            });
        }

        Ok(body)
    }

    fn markup(buttons: &[InlineButton]) -> Option<ReplyMarkup> {
        if buttons.is_empty() {
            return None;
        }
        Some(ReplyMarkup {
            inline_keyboard: buttons
                .iter()
                .map(|b| {
                    vec![InlineKeyboardButton {
                        text: b.label.clone(),
                        callback_data: b.callback_data.clone(),
                    }]
                })
                .collect(),
        })
    }

    fn parse_message_id(result: Option<&serde_json::Value>) -> Result<String> {
        result
            .and_then(|r| r.get("message_id"))
            .and_then(|id| id.as_i64())
            .map(|id| id.to_string())
            .ok_or_else(|| DomainError::ProviderPermanent {
                provider: "telegram".to_string(),
                message: "sendMessage result missing message_id".to_string(),
            })
    }
}

#[async_trait]
impl ChatPort for TelegramChatPort {
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        buttons: &[InlineButton],
    ) -> Result<String> {
        let response = self
            .call(
                "sendMessage",
                &SendMessageRequest {
                    chat_id,
                    text,
                    reply_markup: Self::markup(buttons),
                },
            )
            .await?;

        let message_id = Self::parse_message_id(response.result.as_ref())?;
        debug!(chat_id, message_id, "Telegram message sent");
        Ok(message_id)
    }

    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<()> {
        self.call(
            "answerCallbackQuery",
            &AnswerCallbackRequest {
                callback_query_id: callback_id,
                text: (!text.is_empty()).then_some(text),
                show_alert: false,
            },
        )
        .await?;
        Ok(())
    }

    async fn edit_message(
        &self,
        chat_id: &str,
        message_id: &str,
        text: &str,
        buttons: &[InlineButton],
    ) -> Result<()> {
        let message_id = message_id
            .parse::<i64>()
            .map_err(|_| DomainError::Validation {
                field: "message_id".to_string(),
                reason: format!("Not a Telegram message id: {}", message_id),
            })?;

        self.call(
            "editMessageText",
            &EditMessageRequest {
                chat_id,
                message_id,
                text,
                reply_markup: Self::markup(buttons),
            },
        )
        .await?;
        Ok(())
    }
}
