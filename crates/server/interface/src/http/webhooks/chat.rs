//! Chat provider webhook.
//!
//! Authenticates the shared-secret header, records the update in the inbox
//! and dispatches callbacks and commands. Domain failures are logged and
//! answered 200 so the provider does not build a redelivery storm;
//! non-2xx is reserved for authentication and malformed payloads.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use vigil_server_domain::commands::{parse_callback, CallbackAction, InboundCommand};
use vigil_server_domain::events::{ChatDelivery, OutboxDraft};
use vigil_server_domain::shared_kernel::Result;
use vigil_server_domain::ui_strings;
use vigil_server_domain::users::normalize_e164;

use crate::auth::secret_token_matches;
use crate::http::AppState;

const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

#[derive(Debug, Deserialize)]
pub struct ChatUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<ChatMessage>,
    #[serde(default)]
    pub callback_query: Option<ChatCallbackQuery>,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub message_id: i64,
    pub from: Option<ChatUser>,
    pub chat: ChatRoom,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub contact: Option<ChatContact>,
}

#[derive(Debug, Deserialize)]
pub struct ChatContact {
    pub phone_number: String,
    pub first_name: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatUser {
    pub id: i64,
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
}

impl ChatUser {
    fn display_name(&self) -> String {
        match &self.last_name {
            Some(last) => format!("{} {}", self.first_name, last),
            None => self.first_name.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatRoom {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct ChatCallbackQuery {
    pub id: String,
    pub from: ChatUser,
    #[serde(default)]
    pub data: Option<String>,
}

pub async fn handle(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let provided = headers
        .get(SECRET_HEADER)
        .and_then(|value| value.to_str().ok());
    if !secret_token_matches(provided, &state.chat_webhook_secret) {
        state
            .metrics
            .webhook_rejected
            .with_label_values(&["telegram", "auth"])
            .inc();
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" })));
    }

    let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&body) else {
        state
            .metrics
            .webhook_rejected
            .with_label_values(&["telegram", "malformed"])
            .inc();
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "malformed payload" })));
    };
    let Ok(update) = serde_json::from_value::<ChatUpdate>(payload.clone()) else {
        state
            .metrics
            .webhook_rejected
            .with_label_values(&["telegram", "malformed"])
            .inc();
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "malformed payload" })));
    };

    info!(update_id = update.update_id, "Chat webhook received");

    let event_id = update.update_id.to_string();
    let inner_state = state.clone();
    let result = state
        .inbox
        .process("telegram", &event_id, &payload, || {
            process_update(inner_state, update)
        })
        .await;

    if let Err(e) = result {
        // Domain errors are not the provider's problem; the inbox sweep
        // retries anything that never reached processed_at.
        error!(update_id = %event_id, error = %e, "Chat update processing failed");
    }

    (StatusCode::OK, Json(json!({})))
}

/// Domain handling for one fresh update. Shared with the inbox sweep.
pub(crate) async fn process_update(state: Arc<AppState>, update: ChatUpdate) -> Result<()> {
    if let Some(callback) = update.callback_query {
        return process_callback(state, callback).await;
    }

    if let Some(message) = update.message {
        return process_message(state, message).await;
    }

    Ok(())
}

async fn process_callback(state: Arc<AppState>, callback: ChatCallbackQuery) -> Result<()> {
    let Some(data) = callback.data.as_deref() else {
        return Ok(());
    };

    let (action, incident_id) = match parse_callback(data) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(data, error = %e, "Unparseable callback data ignored");
            return Ok(());
        }
    };

    let chat_user_id = callback.from.id.to_string();
    // Make sure the presser exists so the ack can be attributed.
    state
        .users
        .find_or_create(&chat_user_id, &callback.from.display_name())
        .await?;

    let command = match action {
        CallbackAction::Ack => InboundCommand::ChatAck {
            incident_id,
            chat_user_id,
            callback_id: callback.id,
        },
        CallbackAction::Cancel => InboundCommand::ChatCancel {
            incident_id,
            chat_user_id,
            callback_id: callback.id,
        },
    };

    state.dispatcher.dispatch(command).await
}

async fn process_message(state: Arc<AppState>, message: ChatMessage) -> Result<()> {
    let Some(from) = &message.from else {
        return Ok(());
    };

    // A shared contact sets the sender's phone, normalized before storage.
    if let Some(contact) = &message.contact {
        let user = state
            .users
            .find_or_create(&from.id.to_string(), &from.display_name())
            .await?;
        match normalize_e164(&contact.phone_number) {
            Ok(phone) => state.users.set_phone(user.id, &phone).await?,
            Err(e) => warn!(user_id = %user.id, error = %e, "Rejected shared phone number"),
        }
        return Ok(());
    }

    let Some(text) = message.text.as_deref().map(str::trim) else {
        return Ok(());
    };
    let chat_id = message.chat.id.to_string();

    match text {
        "/panic" => {
            let (incident, created) = state
                .dispatcher
                .trigger_panic_from_chat(&from.id.to_string(), &from.display_name())
                .await?;
            info!(
                incident_id = %incident.id,
                created,
                "Panic triggered from chat"
            );
            Ok(())
        }
        "/ping" => reply(&state, &chat_id, "pong").await,
        "/start" => reply(&state, &chat_id, &ui_strings::start_greeting()).await,
        _ => Ok(()),
    }
}

/// Direct keyed reply outside any incident; the key hashes the content so
/// a redelivered update cannot double-send.
async fn reply(state: &Arc<AppState>, chat_id: &str, text: &str) -> Result<()> {
    let digest = hex::encode(Sha256::digest(text.as_bytes()));
    let draft = OutboxDraft::chat(
        format!("telegram:{}:{}", chat_id, digest),
        &ChatDelivery::Send {
            chat_id: chat_id.to_string(),
            text: text.to_string(),
            buttons: vec![],
            alert_id: None,
        },
    )?;
    state.outbox.send(draft).await?;
    Ok(())
}
