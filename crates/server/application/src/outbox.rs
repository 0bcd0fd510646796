//! Outbox dispatcher: record intent to send, invoke the provider, record
//! the outcome idempotently.
//!
//! Every outbound provider action goes through here. A retried step derives
//! the same idempotency key and collapses onto the stored row, so at most
//! one real provider call is issued per key regardless of retry count.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use vigil_server_domain::alerts::{AlertRepository, AlertStatus, CallAttemptRepository};
use vigil_server_domain::events::{ChatDelivery, OutboxDraft, VoiceDelivery};
use vigil_server_domain::incidents::IncidentRepository;
use vigil_server_domain::ports::{ChatPort, OutboxMessage, OutboxRepository, OutboxStatus, VoicePort};
use vigil_server_domain::shared_kernel::{AlertId, Channel, DomainError, Result};

use crate::telemetry::Metrics;

/// Result of a dispatch: the stored provider message id and whether the row
/// had already been delivered by an earlier call.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub provider_message_id: Option<String>,
    pub already_sent: bool,
}

pub struct OutboxDispatcher {
    outbox: Arc<dyn OutboxRepository>,
    chat: Arc<dyn ChatPort>,
    voice: Arc<dyn VoicePort>,
    alerts: Arc<dyn AlertRepository>,
    calls: Arc<dyn CallAttemptRepository>,
    incidents: Arc<dyn IncidentRepository>,
    metrics: Arc<Metrics>,
    chat_deadline: Duration,
    voice_deadline: Duration,
    /// Rows past this many delivery attempts are left for operators.
    max_delivery_attempts: u32,
}

impl OutboxDispatcher {
    pub fn new(
        outbox: Arc<dyn OutboxRepository>,
        chat: Arc<dyn ChatPort>,
        voice: Arc<dyn VoicePort>,
        alerts: Arc<dyn AlertRepository>,
        calls: Arc<dyn CallAttemptRepository>,
        incidents: Arc<dyn IncidentRepository>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            outbox,
            chat,
            voice,
            alerts,
            calls,
            incidents,
            metrics,
            chat_deadline: Duration::from_secs(10),
            voice_deadline: Duration::from_secs(5),
            max_delivery_attempts: 8,
        }
    }

    /// Record the draft and deliver it. On a key conflict the stored row
    /// wins: the second payload is ignored and the stored outcome returned.
    pub async fn send(&self, draft: OutboxDraft) -> Result<Dispatch> {
        let message = self.outbox.insert_pending(&draft).await?;
        self.deliver(&message).await
    }

    /// Deliver a stored row if it has not been sent yet.
    pub async fn deliver(&self, message: &OutboxMessage) -> Result<Dispatch> {
        if message.status == OutboxStatus::Sent {
            return Ok(Dispatch {
                provider_message_id: message.provider_message_id.clone(),
                already_sent: true,
            });
        }

        match self.invoke(message).await {
            Ok(provider_message_id) => {
                self.outbox
                    .mark_sent(message.id, &provider_message_id)
                    .await?;
                Ok(Dispatch {
                    provider_message_id: Some(provider_message_id),
                    already_sent: false,
                })
            }
            Err(e) => {
                self.metrics
                    .outbox_send_failures
                    .with_label_values(&[message.channel.as_str()])
                    .inc();
                self.outbox.mark_failed(message.id, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    /// Deliver the row stored under a key, if any. Used to flush drafts that
    /// were enqueued transactionally by an incident transition.
    pub async fn deliver_key(&self, idempotency_key: &str) -> Result<Option<Dispatch>> {
        match self.outbox.find_by_key(idempotency_key).await? {
            Some(message) => self.deliver(&message).await.map(Some),
            None => Ok(None),
        }
    }

    /// Retry undelivered rows. Failures are logged and left for the next
    /// sweep; rows past the attempt ceiling are skipped.
    pub async fn flush_undelivered(&self, limit: i64) -> Result<usize> {
        let rows = self.outbox.find_undelivered(limit).await?;
        let mut delivered = 0;
        for row in rows {
            if row.attempts >= self.max_delivery_attempts {
                continue;
            }
            match self.deliver(&row).await {
                Ok(_) => delivered += 1,
                Err(e) => {
                    debug!(
                        idempotency_key = %row.idempotency_key,
                        error = %e,
                        "Outbox delivery failed, will retry"
                    );
                }
            }
        }
        Ok(delivered)
    }

    async fn invoke(&self, message: &OutboxMessage) -> Result<String> {
        match message.channel {
            Channel::Chat => {
                let delivery: ChatDelivery = serde_json::from_value(message.payload.clone())?;
                self.invoke_chat(delivery).await
            }
            Channel::Voice => {
                let delivery: VoiceDelivery = serde_json::from_value(message.payload.clone())?;
                self.invoke_voice(delivery).await
            }
        }
    }

    async fn invoke_chat(&self, delivery: ChatDelivery) -> Result<String> {
        match delivery {
            ChatDelivery::Send {
                chat_id,
                text,
                buttons,
                alert_id,
            } => {
                if let Some(alert_id) = alert_id {
                    self.ensure_incident_open(alert_id).await?;
                }
                let message_id = tokio::time::timeout(
                    self.chat_deadline,
                    self.chat.send_message(&chat_id, &text, &buttons),
                )
                .await
                .map_err(|_| deadline_exceeded("chat"))??;

                if let Some(alert_id) = alert_id {
                    self.alerts
                        .set_chat_message_id(alert_id, &message_id)
                        .await?;
                    self.alerts
                        .update_status(alert_id, AlertStatus::Sent, None)
                        .await?;
                }
                Ok(message_id)
            }
            ChatDelivery::Edit {
                chat_id,
                message_id,
                text,
                buttons,
            } => {
                tokio::time::timeout(
                    self.chat_deadline,
                    self.chat.edit_message(&chat_id, &message_id, &text, &buttons),
                )
                .await
                .map_err(|_| deadline_exceeded("chat"))??;
                Ok(message_id)
            }
        }
    }

    async fn invoke_voice(&self, delivery: VoiceDelivery) -> Result<String> {
        if let Some(attempt) = self.calls.find_by_id(delivery.attempt_id).await? {
            self.ensure_incident_open(attempt.alert_id).await?;
        }

        let provider_call_id = tokio::time::timeout(
            self.voice_deadline,
            self.voice.place_call(&delivery.request),
        )
        .await
        .map_err(|_| deadline_exceeded("voice"))??;

        self.calls
            .record_placed(delivery.attempt_id, &provider_call_id)
            .await?;
        if let Some(attempt) = self.calls.find_by_id(delivery.attempt_id).await? {
            if let Err(e) = self
                .alerts
                .update_status(attempt.alert_id, AlertStatus::Sent, None)
                .await
            {
                warn!(alert_id = %attempt.alert_id, error = %e, "Failed to mark voice alert sent");
            }
        }
        self.metrics.calls_placed.inc();
        Ok(provider_call_id)
    }

    /// Incident-bound deliveries are suppressed once the incident is
    /// terminal: a late retry must not alert or call anyone.
    async fn ensure_incident_open(&self, alert_id: AlertId) -> Result<()> {
        let Some(alert) = self.alerts.find_by_id(alert_id).await? else {
            return Ok(());
        };
        let Some(incident) = self.incidents.find_by_id(alert.incident_id).await? else {
            return Ok(());
        };
        if incident.is_open() {
            Ok(())
        } else {
            Err(DomainError::ProviderPermanent {
                provider: "outbox".to_string(),
                message: format!("incident {} terminal, delivery suppressed", incident.id),
            })
        }
    }
}

fn deadline_exceeded(provider: &str) -> DomainError {
    DomainError::ProviderTransient {
        provider: provider.to_string(),
        message: "deadline exceeded".to_string(),
    }
}
