//! The cascade engine: who is contacted next, when, and how.
//!
//! Seeding fans chat alerts and first call attempts out to the guardian
//! list; scheduled actions drive voice retries and chat reminders until the
//! incident leaves `open`. Every handler re-checks the incident state at
//! entry, so an action firing after a terminal transition is a no-op.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use vigil_server_domain::alerts::{
    Alert, AlertRepository, AlertStatus, CallAttempt, CallAttemptRepository, CallResult,
};
use vigil_server_domain::cascade::{self, keys, NextCallStep, SEED_JITTER_MAX_MS};
use vigil_server_domain::commands::{encode_callback, CallbackAction};
use vigil_server_domain::events::{ChatDelivery, OutboxDraft, VoiceDelivery};
use vigil_server_domain::guardians::{CascadeDefaults, GuardianLink, GuardianLinkRepository};
use vigil_server_domain::incidents::{Incident, IncidentRepository};
use vigil_server_domain::ports::{
    action_types, CallInstruction, InlineButton, PlaceCallRequest, ScheduledAction,
    ScheduledActionRepository,
};
use vigil_server_domain::shared_kernel::{
    AlertId, Channel, DomainError, IncidentId, Result, UserId,
};
use vigil_server_domain::ui_strings;
use vigil_server_domain::users::{User, UserRepository};

use crate::outbox::OutboxDispatcher;

/// Engine settings sourced from configuration.
#[derive(Debug, Clone)]
pub struct CascadeConfig {
    pub defaults: CascadeDefaults,
    /// Base URL the voice provider posts call events back to.
    pub public_base_url: String,
    /// When set, calls are only placed to numbers on the allowlist.
    pub whitelist_only: bool,
    pub allowed_numbers: Vec<String>,
    /// Hard ceiling on a single call's duration.
    pub call_max_duration_secs: u32,
}

impl CascadeConfig {
    fn number_allowed(&self, phone_e164: &str) -> bool {
        !self.whitelist_only || self.allowed_numbers.iter().any(|n| n == phone_e164)
    }

    fn voice_webhook_url(&self) -> String {
        format!("{}/webhook/voice", self.public_base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CallAttemptPayload {
    alert_id: AlertId,
    attempt_no: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReminderPayload {
    round: u32,
}

pub struct CascadeEngine {
    incidents: Arc<dyn IncidentRepository>,
    users: Arc<dyn UserRepository>,
    guardians: Arc<dyn GuardianLinkRepository>,
    alerts: Arc<dyn AlertRepository>,
    calls: Arc<dyn CallAttemptRepository>,
    actions: Arc<dyn ScheduledActionRepository>,
    outbox: Arc<OutboxDispatcher>,
    config: CascadeConfig,
}

impl CascadeEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        incidents: Arc<dyn IncidentRepository>,
        users: Arc<dyn UserRepository>,
        guardians: Arc<dyn GuardianLinkRepository>,
        alerts: Arc<dyn AlertRepository>,
        calls: Arc<dyn CallAttemptRepository>,
        actions: Arc<dyn ScheduledActionRepository>,
        outbox: Arc<OutboxDispatcher>,
        config: CascadeConfig,
    ) -> Self {
        Self {
            incidents,
            users,
            guardians,
            alerts,
            calls,
            actions,
            outbox,
            config,
        }
    }

    /// Seed the cascade for a freshly opened incident: confirmation to the
    /// traveler, chat alerts with the responsibility button, first call
    /// attempts with a small jitter, and the reminder cycle.
    pub async fn seed(&self, incident: &Incident) -> Result<()> {
        if !incident.is_open() {
            return Ok(());
        }

        let traveler = self.require_user(incident.traveler_user_id).await?;
        let links = self
            .guardians
            .active_for_traveler(incident.traveler_user_id)
            .await?;

        self.send_chat(
            keys::chat_traveler_opened(incident.id),
            ChatDelivery::Send {
                chat_id: traveler.chat_user_id.clone(),
                text: ui_strings::traveler_opened(&traveler.display_name),
                buttons: vec![InlineButton {
                    label: ui_strings::CANCEL_BUTTON_LABEL.to_string(),
                    callback_data: encode_callback(CallbackAction::Cancel, incident.id),
                }],
                alert_id: None,
            },
        )
        .await;

        if links.is_empty() {
            warn!(incident_id = %incident.id, "No active guardians, cascade cannot run");
            self.notify_traveler_unreachable(incident).await;
            return Ok(());
        }

        let mut seeded = 0usize;
        for link in &links {
            let Some(watcher) = self.users.find_by_id(link.watcher_user_id).await? else {
                warn!(
                    incident_id = %incident.id,
                    watcher_id = %link.watcher_user_id,
                    "Guardian link points at a missing user"
                );
                continue;
            };

            if link.chat_enabled {
                self.seed_chat_alert(incident, &traveler, &watcher).await?;
                seeded += 1;
            }

            if link.call_enabled {
                if self.seed_voice_alert(incident, link, &watcher).await? {
                    seeded += 1;
                }
            }
        }

        if seeded == 0 {
            self.notify_traveler_unreachable(incident).await;
            return Ok(());
        }

        self.actions
            .schedule(&ScheduledAction::new(
                incident.id,
                action_types::PANIC_REMINDER,
                Utc::now() + Duration::seconds(i64::from(self.config.defaults.reminder_interval_secs)),
                serde_json::to_value(ReminderPayload { round: 1 })?,
            ))
            .await?;

        info!(
            incident_id = %incident.id,
            guardian_count = links.len(),
            "Cascade seeded"
        );
        Ok(())
    }

    async fn seed_chat_alert(
        &self,
        incident: &Incident,
        traveler: &User,
        watcher: &User,
    ) -> Result<()> {
        let alert = self
            .find_or_create_alert(incident.id, watcher.id, Channel::Chat)
            .await?;

        self.send_chat(
            keys::chat_alert(incident.id, watcher.id),
            ChatDelivery::Send {
                chat_id: watcher.chat_user_id.clone(),
                text: ui_strings::panic_alert(&traveler.display_name),
                buttons: vec![InlineButton {
                    label: ui_strings::ACK_BUTTON_LABEL.to_string(),
                    callback_data: encode_callback(CallbackAction::Ack, incident.id),
                }],
                alert_id: Some(alert.id),
            },
        )
        .await;

        Ok(())
    }

    /// Returns whether a call attempt was actually scheduled.
    async fn seed_voice_alert(
        &self,
        incident: &Incident,
        link: &GuardianLink,
        watcher: &User,
    ) -> Result<bool> {
        let Some(phone) = watcher.phone_e164.as_deref() else {
            debug!(
                incident_id = %incident.id,
                watcher_id = %watcher.id,
                "Guardian has no phone, skipping voice channel"
            );
            return Ok(false);
        };

        if !self.config.number_allowed(phone) {
            warn!(
                incident_id = %incident.id,
                watcher_id = %watcher.id,
                "Number not on the allowlist, skipping voice channel"
            );
            return Ok(false);
        }

        let alert = self
            .find_or_create_alert(incident.id, watcher.id, Channel::Voice)
            .await?;

        let jitter_ms = rand::thread_rng().gen_range(0..SEED_JITTER_MAX_MS) as i64;
        self.actions
            .schedule(&ScheduledAction::new(
                incident.id,
                action_types::CALL_ATTEMPT,
                Utc::now() + Duration::milliseconds(jitter_ms),
                serde_json::to_value(CallAttemptPayload {
                    alert_id: alert.id,
                    attempt_no: 1,
                })?,
            ))
            .await?;

        Ok(true)
    }

    /// Place one call attempt. Fired by the durable scheduler.
    pub async fn run_call_attempt(
        &self,
        incident_id: IncidentId,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let payload: CallAttemptPayload = serde_json::from_value(payload.clone())?;

        let Some(incident) = self.incidents.find_by_id(incident_id).await? else {
            return Ok(());
        };
        if !incident.is_open() {
            debug!(incident_id = %incident_id, "Incident terminal, skipping call attempt");
            return Ok(());
        }

        let Some(alert) = self.alerts.find_by_id(payload.alert_id).await? else {
            return Ok(());
        };
        if alert.is_halted() {
            return Ok(());
        }

        // A redelivered action for an attempt that already ran is a no-op.
        if let Some(latest) = self.calls.latest_for_alert(alert.id).await? {
            if latest.attempt_no >= payload.attempt_no {
                debug!(
                    alert_id = %alert.id,
                    attempt_no = payload.attempt_no,
                    "Attempt already recorded, skipping"
                );
                return Ok(());
            }
        }

        let traveler = self.require_user(incident.traveler_user_id).await?;
        let watcher = self.require_user(alert.audience_user_id).await?;
        let Some(link) = self
            .guardians
            .find(incident.traveler_user_id, alert.audience_user_id)
            .await?
        else {
            self.halt_alert(&alert, "guardian link revoked").await?;
            return Ok(());
        };
        if !link.is_active() || !link.call_enabled {
            self.halt_alert(&alert, "guardian link revoked").await?;
            return Ok(());
        }

        let Some(phone) = watcher.phone_e164.clone() else {
            self.halt_alert(&alert, "guardian has no phone").await?;
            return Ok(());
        };

        let attempt = CallAttempt::new(alert.id, payload.attempt_no);
        match self.calls.insert(&attempt).await {
            Ok(()) => {}
            // A live attempt exists; the provider events will drive it.
            Err(DomainError::Validation { .. }) => return Ok(()),
            Err(e) => return Err(e),
        }
        self.alerts.increment_attempts(alert.id).await?;

        let request = PlaceCallRequest {
            to_e164: phone,
            instructions: vec![
                CallInstruction::Speak {
                    language: traveler.language.clone(),
                    text: ui_strings::tts_panic_prompt(&traveler.display_name),
                },
                CallInstruction::GatherDtmf {
                    max_digits: 1,
                    timeout_secs: 10,
                    finish_on_key: None,
                },
                CallInstruction::Hangup,
            ],
            result_webhook_url: self.config.voice_webhook_url(),
            ring_timeout_secs: link.ring_timeout_secs,
            max_duration_secs: self.config.call_max_duration_secs,
        };

        let draft = OutboxDraft::voice(
            keys::voice_attempt(incident.id, watcher.id, payload.attempt_no),
            &VoiceDelivery {
                attempt_id: attempt.id,
                request,
            },
        )?;

        if let Err(e) = self.outbox.send(draft).await {
            // The outbox row stays behind; the retry sweep re-places it
            // under the same key.
            warn!(
                incident_id = %incident.id,
                attempt_id = %attempt.id,
                error = %e,
                "Call placement failed, left in outbox"
            );
        }

        info!(
            incident_id = %incident.id,
            watcher_id = %watcher.id,
            attempt_no = payload.attempt_no,
            "Call attempt placed"
        );
        Ok(())
    }

    /// React to a call attempt reaching a terminal result: retry with the
    /// guardian's backoff (measured from the attempt's end) or halt.
    pub async fn on_call_result(&self, attempt: &CallAttempt) -> Result<()> {
        if !attempt.result.is_terminal() || attempt.result == CallResult::Acknowledged {
            return Ok(());
        }

        let Some(alert) = self.alerts.find_by_id(attempt.alert_id).await? else {
            return Ok(());
        };
        let Some(incident) = self.incidents.find_by_id(alert.incident_id).await? else {
            return Ok(());
        };
        if !incident.is_open() {
            return Ok(());
        }

        let Some(link) = self
            .guardians
            .find(incident.traveler_user_id, alert.audience_user_id)
            .await?
        else {
            self.halt_alert(&alert, "guardian link revoked").await?;
            return Ok(());
        };
        if !link.is_active() {
            self.halt_alert(&alert, "guardian link revoked").await?;
            return Ok(());
        }

        let total_ring = self.calls.total_ring_secs(alert.id).await?;
        let ended_at = attempt.ended_at.unwrap_or_else(Utc::now);

        match cascade::next_call_step(
            &link,
            attempt.attempt_no,
            attempt.result,
            ended_at,
            total_ring,
            self.config.defaults.max_total_ring_secs,
        ) {
            NextCallStep::Retry { attempt_no, run_at } => {
                self.actions
                    .schedule(&ScheduledAction::new(
                        incident.id,
                        action_types::CALL_ATTEMPT,
                        run_at,
                        serde_json::to_value(CallAttemptPayload {
                            alert_id: alert.id,
                            attempt_no,
                        })?,
                    ))
                    .await?;
                info!(
                    incident_id = %incident.id,
                    alert_id = %alert.id,
                    attempt_no,
                    run_at = %run_at,
                    "Call retry scheduled"
                );
            }
            NextCallStep::Halt => {
                self.halt_alert(&alert, attempt.result.as_str()).await?;
                self.check_voice_exhausted(&incident).await?;
            }
        }

        Ok(())
    }

    /// Re-ping chat guardians who have not acknowledged, then schedule the
    /// next round. The edit rewrites the original alert in place.
    pub async fn run_reminder(
        &self,
        incident_id: IncidentId,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let payload: ReminderPayload = serde_json::from_value(payload.clone())?;

        let Some(incident) = self.incidents.find_by_id(incident_id).await? else {
            return Ok(());
        };
        if !incident.is_open() {
            debug!(incident_id = %incident_id, "Incident terminal, skipping reminder");
            return Ok(());
        }

        let traveler = self.require_user(incident.traveler_user_id).await?;
        let alerts = self.alerts.find_for_incident(incident.id).await?;

        for alert in alerts {
            if alert.channel != Channel::Chat {
                continue;
            }
            let Some(message_id) = alert.chat_message_id.clone() else {
                continue;
            };
            let Some(watcher) = self.users.find_by_id(alert.audience_user_id).await? else {
                continue;
            };

            self.send_chat(
                keys::chat_reminder(incident.id, watcher.id, payload.round),
                ChatDelivery::Edit {
                    chat_id: watcher.chat_user_id,
                    message_id,
                    text: ui_strings::reminder_alert(&traveler.display_name, payload.round),
                    buttons: vec![InlineButton {
                        label: ui_strings::ACK_BUTTON_LABEL.to_string(),
                        callback_data: encode_callback(CallbackAction::Ack, incident.id),
                    }],
                },
            )
            .await;
            self.alerts.increment_attempts(alert.id).await?;
        }

        self.actions
            .schedule(&ScheduledAction::new(
                incident.id,
                action_types::PANIC_REMINDER,
                Utc::now() + Duration::seconds(i64::from(self.config.defaults.reminder_interval_secs)),
                serde_json::to_value(ReminderPayload {
                    round: payload.round + 1,
                })?,
            ))
            .await?;

        Ok(())
    }

    async fn find_or_create_alert(
        &self,
        incident_id: IncidentId,
        audience: UserId,
        channel: Channel,
    ) -> Result<Alert> {
        if let Some(alert) = self.alerts.find(incident_id, audience, channel).await? {
            return Ok(alert);
        }
        let alert = Alert::new(incident_id, audience, channel);
        match self.alerts.insert(&alert).await {
            Ok(()) => Ok(alert),
            // Lost a race with a concurrent seeding; the stored row wins.
            Err(DomainError::Validation { .. }) => self
                .alerts
                .find(incident_id, audience, channel)
                .await?
                .ok_or(DomainError::AlertNotFound { alert_id: alert.id }),
            Err(e) => Err(e),
        }
    }

    async fn halt_alert(&self, alert: &Alert, reason: &str) -> Result<()> {
        self.alerts
            .update_status(alert.id, AlertStatus::Halted, Some(reason))
            .await?;
        info!(alert_id = %alert.id, reason, "Voice alert halted");
        Ok(())
    }

    /// Once every voice alert has halted without an acknowledgment, tell
    /// the traveler nobody could be reached. The incident stays open.
    async fn check_voice_exhausted(&self, incident: &Incident) -> Result<()> {
        let alerts = self.alerts.find_for_incident(incident.id).await?;
        let voice: Vec<&Alert> = alerts
            .iter()
            .filter(|a| a.channel == Channel::Voice)
            .collect();

        if voice.is_empty() || !voice.iter().all(|a| a.is_halted()) {
            return Ok(());
        }

        self.notify_traveler_unreachable(incident).await;
        Ok(())
    }

    async fn notify_traveler_unreachable(&self, incident: &Incident) {
        let Ok(Some(traveler)) = self.users.find_by_id(incident.traveler_user_id).await else {
            return;
        };
        self.send_chat(
            keys::chat_traveler_unreachable(incident.id),
            ChatDelivery::Send {
                chat_id: traveler.chat_user_id,
                text: ui_strings::traveler_unreachable(),
                buttons: vec![],
                alert_id: None,
            },
        )
        .await;
    }

    /// Enqueue and deliver a chat draft; failures stay in the outbox for
    /// the retry sweep.
    async fn send_chat(&self, idempotency_key: String, delivery: ChatDelivery) {
        let draft = match OutboxDraft::chat(idempotency_key, &delivery) {
            Ok(draft) => draft,
            Err(e) => {
                warn!(error = %e, "Failed to serialize chat draft");
                return;
            }
        };
        let key = draft.idempotency_key.clone();
        if let Err(e) = self.outbox.send(draft).await {
            warn!(idempotency_key = %key, error = %e, "Chat delivery failed, left in outbox");
        }
    }

    async fn require_user(&self, user_id: UserId) -> Result<User> {
        self.users
            .find_by_id(user_id)
            .await?
            .ok_or(DomainError::UserNotFound { user_id })
    }
}

// ---------------------------------------------------------------------------
// Scheduler handlers
// ---------------------------------------------------------------------------

/// `call_attempt` handler.
pub struct CallAttemptHandler {
    engine: Arc<CascadeEngine>,
}

impl CallAttemptHandler {
    pub fn new(engine: Arc<CascadeEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait::async_trait]
impl vigil_server_domain::ports::ActionHandler for CallAttemptHandler {
    async fn handle(
        &self,
        incident_id: Option<IncidentId>,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let Some(incident_id) = incident_id else {
            return Ok(());
        };
        self.engine.run_call_attempt(incident_id, payload).await
    }
}

/// `panic_reminder` handler.
pub struct ReminderHandler {
    engine: Arc<CascadeEngine>,
}

impl ReminderHandler {
    pub fn new(engine: Arc<CascadeEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait::async_trait]
impl vigil_server_domain::ports::ActionHandler for ReminderHandler {
    async fn handle(
        &self,
        incident_id: Option<IncidentId>,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let Some(incident_id) = incident_id else {
            return Ok(());
        };
        self.engine.run_reminder(incident_id, payload).await
    }
}
