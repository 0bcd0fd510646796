//! Panic incident use cases: open, acknowledge, cancel.
//!
//! Terminal transitions run atomically under the store gateway's advisory
//! incident lock; provider calls happen strictly outside of it, made safe
//! to retry by the outbox.

use std::sync::Arc;

use tracing::{info, warn};

use vigil_server_domain::alerts::AlertRepository;
use vigil_server_domain::cascade::keys;
use vigil_server_domain::events::{ChatDelivery, OutboxDraft};
use vigil_server_domain::incidents::{
    AckChannel, Incident, IncidentRepository, TerminalOutcome, TerminalTransition,
};
use vigil_server_domain::ports::VoicePort;
use vigil_server_domain::shared_kernel::{Channel, DomainError, IncidentId, Result, UserId};
use vigil_server_domain::ui_strings;
use vigil_server_domain::users::UserRepository;

use crate::outbox::OutboxDispatcher;
use crate::telemetry::Metrics;

pub struct PanicService {
    incidents: Arc<dyn IncidentRepository>,
    users: Arc<dyn UserRepository>,
    alerts: Arc<dyn AlertRepository>,
    voice: Arc<dyn VoicePort>,
    outbox: Arc<OutboxDispatcher>,
    metrics: Arc<Metrics>,
}

impl PanicService {
    pub fn new(
        incidents: Arc<dyn IncidentRepository>,
        users: Arc<dyn UserRepository>,
        alerts: Arc<dyn AlertRepository>,
        voice: Arc<dyn VoicePort>,
        outbox: Arc<OutboxDispatcher>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            incidents,
            users,
            alerts,
            voice,
            outbox,
            metrics,
        }
    }

    /// Open an incident for a traveler. A traveler with an open incident
    /// gets it back unchanged, so a double panic press never forks the
    /// cascade. Returns whether a new incident was created.
    pub async fn open_incident(&self, traveler_user_id: UserId) -> Result<(Incident, bool)> {
        if let Some(existing) = self
            .incidents
            .find_open_for_traveler(traveler_user_id)
            .await?
        {
            info!(
                incident_id = %existing.id,
                traveler_id = %traveler_user_id,
                "Traveler already has an open incident"
            );
            return Ok((existing, false));
        }

        let incident = Incident::new(traveler_user_id);
        self.incidents.insert(&incident).await?;
        self.metrics.panic_incidents_started.inc();

        info!(
            incident_id = %incident.id,
            traveler_id = %traveler_user_id,
            "Opened panic incident"
        );
        Ok((incident, true))
    }

    /// A guardian takes responsibility, via chat button or DTMF "1".
    ///
    /// Idempotent: once terminal, the recorded decision is returned and no
    /// new side effects are produced.
    pub async fn acknowledge(
        &self,
        incident_id: IncidentId,
        by_user_id: UserId,
        via: AckChannel,
    ) -> Result<TerminalOutcome> {
        let incident = self.load(incident_id).await?;
        let drafts = self.ack_side_effects(&incident, by_user_id).await?;

        let outcome = self
            .incidents
            .transition_terminal(
                incident_id,
                TerminalTransition::Acknowledge {
                    by: by_user_id,
                    via,
                },
                drafts.clone(),
            )
            .await?;

        if outcome.applied() {
            self.metrics.panic_acknowledged.inc();
            info!(
                incident_id = %incident_id,
                acknowledged_by = %by_user_id,
                via = via.as_str(),
                "Panic acknowledged"
            );
            self.finish_terminal(&outcome, &drafts).await;
        } else {
            info!(
                incident_id = %incident_id,
                "Acknowledge on terminal incident is a no-op"
            );
        }

        Ok(outcome)
    }

    /// The traveler (or an admin) stands the incident down.
    pub async fn cancel(
        &self,
        incident_id: IncidentId,
        by_user_id: UserId,
        is_admin: bool,
    ) -> Result<TerminalOutcome> {
        let incident = self.load(incident_id).await?;

        if incident.traveler_user_id != by_user_id && !is_admin {
            return Err(DomainError::Unauthorized {
                reason: "Only the traveler or an admin may cancel an incident".to_string(),
            });
        }

        let drafts = self.cancel_side_effects(&incident).await?;

        let outcome = self
            .incidents
            .transition_terminal(
                incident_id,
                TerminalTransition::Cancel { by: by_user_id },
                drafts.clone(),
            )
            .await?;

        if outcome.applied() {
            self.metrics.panic_canceled.inc();
            info!(
                incident_id = %incident_id,
                canceled_by = %by_user_id,
                "Panic canceled"
            );
            self.finish_terminal(&outcome, &drafts).await;
        }

        Ok(outcome)
    }

    async fn load(&self, incident_id: IncidentId) -> Result<Incident> {
        self.incidents
            .find_by_id(incident_id)
            .await?
            .ok_or(DomainError::IncidentNotFound { incident_id })
    }

    /// Hang up still-live calls and flush the transactionally enqueued
    /// drafts. Both are post-commit and best-effort: a hangup that fails
    /// times out naturally, a draft that fails stays in the outbox for the
    /// retry sweep.
    async fn finish_terminal(&self, outcome: &TerminalOutcome, drafts: &[OutboxDraft]) {
        if let TerminalOutcome::Applied {
            hangup_provider_call_ids,
            ..
        } = outcome
        {
            for call_id in hangup_provider_call_ids {
                if let Err(e) = self.voice.hangup(call_id).await {
                    warn!(provider_call_id = %call_id, error = %e, "Hangup failed, call will time out");
                }
            }
        }

        for draft in drafts {
            if let Err(e) = self.outbox.deliver_key(&draft.idempotency_key).await {
                warn!(
                    idempotency_key = %draft.idempotency_key,
                    error = %e,
                    "Terminal notification failed, left for retry"
                );
            }
        }
    }

    /// Notifications for an acknowledgment: tell the traveler, rewrite
    /// every guardian's alert message as handled.
    async fn ack_side_effects(
        &self,
        incident: &Incident,
        by_user_id: UserId,
    ) -> Result<Vec<OutboxDraft>> {
        let guardian_name = match self.users.find_by_id(by_user_id).await? {
            Some(user) => user.display_name,
            None => "Кто-то".to_string(),
        };

        let mut drafts = Vec::new();

        if let Some(traveler) = self.users.find_by_id(incident.traveler_user_id).await? {
            drafts.push(OutboxDraft::chat(
                keys::chat_traveler_ack(incident.id),
                &ChatDelivery::Send {
                    chat_id: traveler.chat_user_id,
                    text: ui_strings::traveler_acknowledged(&guardian_name),
                    buttons: vec![],
                    alert_id: None,
                },
            )?);
        }

        drafts.extend(
            self.guardian_edit_drafts(incident, |audience| {
                keys::chat_handled(incident.id, audience)
            })
            .await?
            .into_iter()
            .map(|(key, chat_id, message_id)| {
                OutboxDraft::chat(
                    key,
                    &ChatDelivery::Edit {
                        chat_id,
                        message_id,
                        text: ui_strings::handled_alert(&guardian_name),
                        buttons: vec![],
                    },
                )
            })
            .collect::<Result<Vec<_>>>()?,
        );

        Ok(drafts)
    }

    async fn cancel_side_effects(&self, incident: &Incident) -> Result<Vec<OutboxDraft>> {
        let traveler = self.users.find_by_id(incident.traveler_user_id).await?;
        let traveler_name = traveler
            .as_ref()
            .map(|u| u.display_name.clone())
            .unwrap_or_else(|| "Путешественник".to_string());

        let mut drafts = Vec::new();

        if let Some(traveler) = traveler {
            drafts.push(OutboxDraft::chat(
                keys::chat_traveler_cancel(incident.id),
                &ChatDelivery::Send {
                    chat_id: traveler.chat_user_id,
                    text: ui_strings::traveler_canceled(),
                    buttons: vec![],
                    alert_id: None,
                },
            )?);
        }

        drafts.extend(
            self.guardian_edit_drafts(incident, |audience| {
                keys::chat_canceled(incident.id, audience)
            })
            .await?
            .into_iter()
            .map(|(key, chat_id, message_id)| {
                OutboxDraft::chat(
                    key,
                    &ChatDelivery::Edit {
                        chat_id,
                        message_id,
                        text: ui_strings::canceled_alert(&traveler_name),
                        buttons: vec![],
                    },
                )
            })
            .collect::<Result<Vec<_>>>()?,
        );

        Ok(drafts)
    }

    /// (key, chat_id, message_id) for every chat alert that reached its
    /// guardian. Alerts that never got a message id have nothing to edit.
    async fn guardian_edit_drafts<F>(
        &self,
        incident: &Incident,
        key_for: F,
    ) -> Result<Vec<(String, String, String)>>
    where
        F: Fn(UserId) -> String,
    {
        let alerts = self.alerts.find_for_incident(incident.id).await?;
        let mut out = Vec::new();

        for alert in alerts {
            if alert.channel != Channel::Chat {
                continue;
            }
            let Some(message_id) = alert.chat_message_id.clone() else {
                continue;
            };
            let Some(audience) = self.users.find_by_id(alert.audience_user_id).await? else {
                continue;
            };
            out.push((
                key_for(alert.audience_user_id),
                audience.chat_user_id,
                message_id,
            ));
        }

        Ok(out)
    }
}
