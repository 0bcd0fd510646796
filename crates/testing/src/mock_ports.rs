//! Recording mock implementations of the provider ports.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use vigil_server_domain::ports::{ChatPort, InlineButton, PlaceCallRequest, VoicePort};
use vigil_server_domain::shared_kernel::{DomainError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct SentChatMessage {
    pub chat_id: String,
    pub text: String,
    pub buttons: Vec<InlineButton>,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentChatEdit {
    pub chat_id: String,
    pub message_id: String,
    pub text: String,
}

/// Chat port that records every verb and can be told to fail sends.
#[derive(Default)]
pub struct MockChatPort {
    pub sent: Mutex<Vec<SentChatMessage>>,
    pub edits: Mutex<Vec<SentChatEdit>>,
    pub answered_callbacks: Mutex<Vec<String>>,
    fail_sends: AtomicBool,
    counter: AtomicU64,
}

impl MockChatPort {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl ChatPort for MockChatPort {
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        buttons: &[InlineButton],
    ) -> Result<String> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(DomainError::ProviderTransient {
                provider: "mock-chat".to_string(),
                message: "simulated outage".to_string(),
            });
        }
        let message_id = format!("m{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1);
        self.sent.lock().push(SentChatMessage {
            chat_id: chat_id.to_string(),
            text: text.to_string(),
            buttons: buttons.to_vec(),
            message_id: message_id.clone(),
        });
        Ok(message_id)
    }

    async fn answer_callback(&self, callback_id: &str, _text: &str) -> Result<()> {
        self.answered_callbacks.lock().push(callback_id.to_string());
        Ok(())
    }

    async fn edit_message(
        &self,
        chat_id: &str,
        message_id: &str,
        text: &str,
        _buttons: &[InlineButton],
    ) -> Result<()> {
        self.edits.lock().push(SentChatEdit {
            chat_id: chat_id.to_string(),
            message_id: message_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlacedCall {
    pub provider_call_id: String,
    pub request: PlaceCallRequest,
}

/// Voice port that records placements and hangups.
#[derive(Default)]
pub struct MockVoicePort {
    pub placed: Mutex<Vec<PlacedCall>>,
    pub hangups: Mutex<Vec<String>>,
    fail_calls: AtomicBool,
    counter: AtomicU64,
}

impl MockVoicePort {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_calls(&self, fail: bool) {
        self.fail_calls.store(fail, Ordering::SeqCst);
    }

    pub fn placed_count(&self) -> usize {
        self.placed.lock().len()
    }
}

#[async_trait]
impl VoicePort for MockVoicePort {
    async fn place_call(&self, request: &PlaceCallRequest) -> Result<String> {
        if self.fail_calls.load(Ordering::SeqCst) {
            return Err(DomainError::ProviderTransient {
                provider: "mock-voice".to_string(),
                message: "simulated outage".to_string(),
            });
        }
        let provider_call_id = format!("call{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1);
        self.placed.lock().push(PlacedCall {
            provider_call_id: provider_call_id.clone(),
            request: request.clone(),
        });
        Ok(provider_call_id)
    }

    async fn hangup(&self, provider_call_id: &str) -> Result<()> {
        self.hangups.lock().push(provider_call_id.to_string());
        Ok(())
    }
}
