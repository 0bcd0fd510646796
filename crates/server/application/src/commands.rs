//! Inbound command dispatch: one handler per command variant, converging
//! the chat and voice event streams onto the incident state machine.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use vigil_server_domain::alerts::{
    result_from_hangup_cause, AlertRepository, CallAttempt, CallAttemptRepository, CallResult,
};
use vigil_server_domain::commands::{AmdKind, InboundCommand};
use vigil_server_domain::incidents::{AckChannel, Incident, IncidentRepository};
use vigil_server_domain::ports::{action_types, ChatPort, ScheduledAction,
    ScheduledActionRepository,
};
use vigil_server_domain::shared_kernel::{DomainError, IncidentId, Result, UserId};
use vigil_server_domain::users::UserRepository;

use crate::cascade::CascadeEngine;
use crate::panic::PanicService;

/// Payload of an `ack_reconcile` action: re-run a terminal transition that
/// lost the advisory lock at webhook time.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReconcilePayload {
    pub transition: ReconcileTransition,
    pub by_user_id: UserId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileTransition {
    AckChatButton,
    AckDtmf,
    Cancel,
}

pub struct CommandDispatcher {
    panic: Arc<PanicService>,
    cascade: Arc<CascadeEngine>,
    users: Arc<dyn UserRepository>,
    alerts: Arc<dyn AlertRepository>,
    calls: Arc<dyn CallAttemptRepository>,
    actions: Arc<dyn ScheduledActionRepository>,
    chat: Arc<dyn ChatPort>,
}

impl CommandDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        panic: Arc<PanicService>,
        cascade: Arc<CascadeEngine>,
        users: Arc<dyn UserRepository>,
        alerts: Arc<dyn AlertRepository>,
        calls: Arc<dyn CallAttemptRepository>,
        actions: Arc<dyn ScheduledActionRepository>,
        chat: Arc<dyn ChatPort>,
    ) -> Self {
        Self {
            panic,
            cascade,
            users,
            alerts,
            calls,
            actions,
            chat,
        }
    }

    /// Open an incident for a traveler and seed its cascade. The entry
    /// point shared by the chat path and the admin trigger.
    pub async fn trigger_panic(&self, traveler_user_id: UserId) -> Result<(Incident, bool)> {
        let (incident, created) = self.panic.open_incident(traveler_user_id).await?;
        if created {
            self.cascade.seed(&incident).await?;
        }
        Ok((incident, created))
    }

    /// Chat-path panic trigger, keyed by the provider's user id.
    pub async fn trigger_panic_from_chat(
        &self,
        chat_user_id: &str,
        display_name: &str,
    ) -> Result<(Incident, bool)> {
        let user = self.users.find_or_create(chat_user_id, display_name).await?;
        self.trigger_panic(user.id).await
    }

    pub async fn dispatch(&self, command: InboundCommand) -> Result<()> {
        match command {
            InboundCommand::ChatAck {
                incident_id,
                chat_user_id,
                callback_id,
            } => {
                self.answer_callback(&callback_id).await;
                self.handle_chat_ack(incident_id, &chat_user_id).await
            }
            InboundCommand::ChatCancel {
                incident_id,
                chat_user_id,
                callback_id,
            } => {
                self.answer_callback(&callback_id).await;
                self.handle_chat_cancel(incident_id, &chat_user_id).await
            }
            InboundCommand::VoiceInitiated { provider_call_id } => {
                self.handle_voice_progress(&provider_call_id, CallResult::Ringing)
                    .await
            }
            InboundCommand::VoiceAnswered { provider_call_id } => {
                self.handle_voice_progress(&provider_call_id, CallResult::AnsweredHuman)
                    .await
            }
            InboundCommand::VoiceAmd {
                provider_call_id,
                kind,
            } => match kind {
                AmdKind::Machine => {
                    self.handle_voice_progress(&provider_call_id, CallResult::AnsweredMachine)
                        .await
                }
                AmdKind::Human => Ok(()),
            },
            InboundCommand::VoiceDigit {
                provider_call_id,
                digit,
            } => self.handle_voice_digit(&provider_call_id, digit).await,
            InboundCommand::VoiceHangup {
                provider_call_id,
                cause,
            } => self.handle_voice_hangup(&provider_call_id, &cause).await,
        }
    }

    async fn handle_chat_ack(&self, incident_id: IncidentId, chat_user_id: &str) -> Result<()> {
        let Some(user) = self.users.find_by_chat_user_id(chat_user_id).await? else {
            warn!(chat_user_id, "Ack from unknown chat user ignored");
            return Ok(());
        };

        match self
            .panic
            .acknowledge(incident_id, user.id, AckChannel::ChatButton)
            .await
        {
            Ok(_) => Ok(()),
            Err(DomainError::Contention { .. }) => {
                self.schedule_reconcile(incident_id, ReconcileTransition::AckChatButton, user.id)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_chat_cancel(&self, incident_id: IncidentId, chat_user_id: &str) -> Result<()> {
        let Some(user) = self.users.find_by_chat_user_id(chat_user_id).await? else {
            warn!(chat_user_id, "Cancel from unknown chat user ignored");
            return Ok(());
        };

        match self.panic.cancel(incident_id, user.id, false).await {
            Ok(_) => Ok(()),
            Err(DomainError::Unauthorized { reason }) => {
                warn!(
                    incident_id = %incident_id,
                    user_id = %user.id,
                    reason,
                    "Cancel rejected"
                );
                Ok(())
            }
            Err(DomainError::Contention { .. }) => {
                self.schedule_reconcile(incident_id, ReconcileTransition::Cancel, user.id)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// Non-terminal call progress (ringing, answered, machine detected).
    async fn handle_voice_progress(
        &self,
        provider_call_id: &str,
        result: CallResult,
    ) -> Result<()> {
        let attempt = self.require_attempt(provider_call_id).await?;
        if attempt.result.is_terminal() {
            return Ok(());
        }
        self.calls
            .record_result(attempt.id, result, None, None, None)
            .await
    }

    async fn handle_voice_digit(&self, provider_call_id: &str, digit: char) -> Result<()> {
        let attempt = self.require_attempt(provider_call_id).await?;
        if attempt.result == CallResult::Acknowledged {
            return Ok(());
        }

        let digit_str = digit.to_string();

        if digit != '1' {
            debug!(provider_call_id, digit = %digit_str, "Ignoring non-ack digit");
            return self
                .calls
                .record_result(attempt.id, attempt.result, Some(&digit_str), None, None)
                .await;
        }

        self.calls
            .record_result(
                attempt.id,
                CallResult::Acknowledged,
                Some(&digit_str),
                None,
                Some(Utc::now()),
            )
            .await?;

        let Some(alert) = self.alerts.find_by_id(attempt.alert_id).await? else {
            return Ok(());
        };

        info!(
            incident_id = %alert.incident_id,
            guardian_id = %alert.audience_user_id,
            "DTMF acknowledgment received"
        );

        match self
            .panic
            .acknowledge(alert.incident_id, alert.audience_user_id, AckChannel::Dtmf)
            .await
        {
            Ok(_) => Ok(()),
            Err(DomainError::Contention { .. }) => {
                self.schedule_reconcile(
                    alert.incident_id,
                    ReconcileTransition::AckDtmf,
                    alert.audience_user_id,
                )
                .await
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_voice_hangup(&self, provider_call_id: &str, cause: &str) -> Result<()> {
        let attempt = self.require_attempt(provider_call_id).await?;
        if attempt.result == CallResult::Acknowledged {
            return Ok(());
        }

        // Keep the answered verdicts; everything else derives from the
        // hangup cause (answered-human without a digit retries like any
        // other miss).
        let final_result = match attempt.result {
            CallResult::AnsweredHuman => CallResult::AnsweredHuman,
            CallResult::AnsweredMachine => CallResult::AnsweredMachine,
            _ => result_from_hangup_cause(cause),
        };
        let final_result = if final_result.is_terminal() {
            final_result
        } else {
            CallResult::NoAnswer
        };

        self.calls
            .record_result(
                attempt.id,
                final_result,
                None,
                Some(cause),
                Some(Utc::now()),
            )
            .await?;

        let updated = CallAttempt {
            result: final_result,
            ended_at: Some(Utc::now()),
            ..attempt
        };
        self.cascade.on_call_result(&updated).await
    }

    async fn require_attempt(&self, provider_call_id: &str) -> Result<CallAttempt> {
        self.calls
            .find_by_provider_call_id(provider_call_id)
            .await?
            .ok_or_else(|| DomainError::InfrastructureError {
                // Retryable: the placement may not have committed yet; the
                // inbox sweep re-delivers this event.
                message: format!("No call attempt recorded for call {}", provider_call_id),
            })
    }

    async fn schedule_reconcile(
        &self,
        incident_id: IncidentId,
        transition: ReconcileTransition,
        by_user_id: UserId,
    ) -> Result<()> {
        info!(incident_id = %incident_id, "Lock contention, scheduling reconcile");
        self.actions
            .schedule(&ScheduledAction::new(
                incident_id,
                action_types::ACK_RECONCILE,
                Utc::now() + Duration::seconds(2),
                serde_json::to_value(ReconcilePayload {
                    transition,
                    by_user_id,
                })?,
            ))
            .await
    }

    async fn answer_callback(&self, callback_id: &str) {
        if let Err(e) = self.chat.answer_callback(callback_id, "✅").await {
            debug!(callback_id, error = %e, "answer_callback failed");
        }
    }
}

/// `ack_reconcile` handler: replays a terminal transition that hit lock
/// contention at webhook time. Idempotent like the original transition.
pub struct AckReconcileHandler {
    panic: Arc<PanicService>,
    incidents: Arc<dyn IncidentRepository>,
}

impl AckReconcileHandler {
    pub fn new(panic: Arc<PanicService>, incidents: Arc<dyn IncidentRepository>) -> Self {
        Self { panic, incidents }
    }
}

#[async_trait::async_trait]
impl vigil_server_domain::ports::ActionHandler for AckReconcileHandler {
    async fn handle(
        &self,
        incident_id: Option<IncidentId>,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let Some(incident_id) = incident_id else {
            return Ok(());
        };
        let payload: ReconcilePayload = serde_json::from_value(payload.clone())?;

        let Some(incident) = self.incidents.find_by_id(incident_id).await? else {
            return Ok(());
        };
        if !incident.is_open() {
            return Ok(());
        }

        match payload.transition {
            ReconcileTransition::AckChatButton => {
                self.panic
                    .acknowledge(incident_id, payload.by_user_id, AckChannel::ChatButton)
                    .await?;
            }
            ReconcileTransition::AckDtmf => {
                self.panic
                    .acknowledge(incident_id, payload.by_user_id, AckChannel::Dtmf)
                    .await?;
            }
            ReconcileTransition::Cancel => {
                self.panic
                    .cancel(incident_id, payload.by_user_id, false)
                    .await?;
            }
        }
        Ok(())
    }
}
