//! In-memory implementation of every repository port.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use vigil_server_domain::alerts::{
    Alert, AlertRepository, AlertStatus, CallAttempt, CallAttemptRepository, CallResult,
};
use vigil_server_domain::events::OutboxDraft;
use vigil_server_domain::guardians::{order_contact_plan, GuardianLink, GuardianLinkRepository};
use vigil_server_domain::incidents::{
    Incident, IncidentRepository, TerminalOutcome, TerminalTransition,
};
use vigil_server_domain::ports::{
    ActionState, InboxEvent, InboxOutcome, InboxRepository, OutboxMessage, OutboxRepository,
    OutboxStatus, ScheduledAction, ScheduledActionRepository, StoreHealth,
};
use vigil_server_domain::shared_kernel::{
    ActionId, AlertId, CallAttemptId, Channel, DomainError, GuardianLinkId, IncidentId, Result,
    UserId,
};
use vigil_server_domain::users::{User, UserRepository};

#[derive(Default)]
struct State {
    users: HashMap<UserId, User>,
    links: Vec<GuardianLink>,
    incidents: HashMap<IncidentId, Incident>,
    alerts: HashMap<AlertId, Alert>,
    attempts: HashMap<CallAttemptId, CallAttempt>,
    inbox: Vec<InboxEvent>,
    outbox: Vec<OutboxMessage>,
    actions: HashMap<ActionId, ScheduledAction>,
}

/// Shared in-memory store. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All outbox rows, in insertion order.
    pub fn outbox_rows(&self) -> Vec<OutboxMessage> {
        self.inner.lock().outbox.clone()
    }

    /// All scheduled actions, any state.
    pub fn action_rows(&self) -> Vec<ScheduledAction> {
        self.inner.lock().actions.values().cloned().collect()
    }

    pub fn alert_rows(&self) -> Vec<Alert> {
        self.inner.lock().alerts.values().cloned().collect()
    }

    pub fn attempt_rows(&self) -> Vec<CallAttempt> {
        self.inner.lock().attempts.values().cloned().collect()
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn insert(&self, user: &User) -> Result<()> {
        let mut state = self.inner.lock();
        if state
            .users
            .values()
            .any(|u| u.chat_user_id == user.chat_user_id)
        {
            return Err(DomainError::Validation {
                field: "chat_user_id".to_string(),
                reason: format!("User already exists: {}", user.chat_user_id),
            });
        }
        state.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.inner.lock().users.get(&id).cloned())
    }

    async fn find_by_chat_user_id(&self, chat_user_id: &str) -> Result<Option<User>> {
        Ok(self
            .inner
            .lock()
            .users
            .values()
            .find(|u| u.chat_user_id == chat_user_id)
            .cloned())
    }

    async fn find_or_create(&self, chat_user_id: &str, display_name: &str) -> Result<User> {
        let mut state = self.inner.lock();
        if let Some(user) = state
            .users
            .values()
            .find(|u| u.chat_user_id == chat_user_id)
        {
            return Ok(user.clone());
        }
        let user = User::new(chat_user_id, display_name);
        state.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn set_phone(&self, id: UserId, phone_e164: &str) -> Result<()> {
        let mut state = self.inner.lock();
        let user = state
            .users
            .get_mut(&id)
            .ok_or(DomainError::UserNotFound { user_id: id })?;
        user.phone_e164 = Some(phone_e164.to_string());
        Ok(())
    }
}

#[async_trait]
impl GuardianLinkRepository for MemoryStore {
    async fn insert(&self, link: &GuardianLink) -> Result<()> {
        link.validate()?;
        let mut state = self.inner.lock();
        if state.links.iter().any(|l| {
            l.traveler_user_id == link.traveler_user_id
                && l.watcher_user_id == link.watcher_user_id
        }) {
            return Err(DomainError::Validation {
                field: "guardian_link".to_string(),
                reason: "Link already exists".to_string(),
            });
        }
        state.links.push(link.clone());
        Ok(())
    }

    async fn active_for_traveler(&self, traveler_user_id: UserId) -> Result<Vec<GuardianLink>> {
        let links: Vec<GuardianLink> = self
            .inner
            .lock()
            .links
            .iter()
            .filter(|l| l.traveler_user_id == traveler_user_id && l.is_active())
            .cloned()
            .collect();
        Ok(order_contact_plan(links))
    }

    async fn find(
        &self,
        traveler_user_id: UserId,
        watcher_user_id: UserId,
    ) -> Result<Option<GuardianLink>> {
        Ok(self
            .inner
            .lock()
            .links
            .iter()
            .find(|l| {
                l.traveler_user_id == traveler_user_id && l.watcher_user_id == watcher_user_id
            })
            .cloned())
    }

    async fn revoke(&self, id: GuardianLinkId) -> Result<()> {
        let mut state = self.inner.lock();
        if let Some(link) = state.links.iter_mut().find(|l| l.id == id) {
            link.status = vigil_server_domain::guardians::GuardianLinkStatus::Revoked;
        }
        Ok(())
    }
}

#[async_trait]
impl IncidentRepository for MemoryStore {
    async fn insert(&self, incident: &Incident) -> Result<()> {
        self.inner
            .lock()
            .incidents
            .insert(incident.id, incident.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: IncidentId) -> Result<Option<Incident>> {
        Ok(self.inner.lock().incidents.get(&id).cloned())
    }

    async fn find_open_for_traveler(&self, traveler_user_id: UserId) -> Result<Option<Incident>> {
        Ok(self
            .inner
            .lock()
            .incidents
            .values()
            .find(|i| i.traveler_user_id == traveler_user_id && i.is_open())
            .cloned())
    }

    async fn transition_terminal(
        &self,
        id: IncidentId,
        transition: TerminalTransition,
        side_effects: Vec<OutboxDraft>,
    ) -> Result<TerminalOutcome> {
        // One lock over the whole mutation mirrors the advisory-lock +
        // transaction coupling of the Postgres gateway.
        let mut state = self.inner.lock();

        let incident = state
            .incidents
            .get(&id)
            .cloned()
            .ok_or(DomainError::IncidentNotFound { incident_id: id })?;

        if !incident.is_open() {
            return Ok(TerminalOutcome::AlreadyTerminal { incident });
        }

        let mut updated = incident;
        updated.apply_terminal(&transition, Utc::now());
        state.incidents.insert(id, updated.clone());

        for action in state.actions.values_mut() {
            if action.incident_id == Some(id) && action.state == ActionState::Scheduled {
                action.state = ActionState::Canceled;
            }
        }

        let now = Utc::now();
        for draft in side_effects {
            let exists = state
                .outbox
                .iter()
                .any(|m| m.idempotency_key == draft.idempotency_key);
            if !exists {
                state.outbox.push(OutboxMessage {
                    id: Uuid::new_v4(),
                    idempotency_key: draft.idempotency_key,
                    channel: draft.channel,
                    payload: draft.payload,
                    status: OutboxStatus::Pending,
                    provider_message_id: None,
                    attempts: 0,
                    last_error: None,
                    created_at: now,
                    updated_at: now,
                });
            }
        }

        let incident_alerts: Vec<AlertId> = state
            .alerts
            .values()
            .filter(|a| a.incident_id == id)
            .map(|a| a.id)
            .collect();
        let hangup_provider_call_ids = state
            .attempts
            .values()
            .filter(|ca| incident_alerts.contains(&ca.alert_id) && ca.result.is_live())
            .filter_map(|ca| ca.provider_call_id.clone())
            .collect();

        Ok(TerminalOutcome::Applied {
            incident: updated,
            hangup_provider_call_ids,
        })
    }
}

#[async_trait]
impl AlertRepository for MemoryStore {
    async fn insert(&self, alert: &Alert) -> Result<()> {
        let mut state = self.inner.lock();
        if state.alerts.values().any(|a| {
            a.incident_id == alert.incident_id
                && a.audience_user_id == alert.audience_user_id
                && a.channel == alert.channel
        }) {
            return Err(DomainError::Validation {
                field: "alert".to_string(),
                reason: "Alert already exists for (incident, audience, channel)".to_string(),
            });
        }
        state.alerts.insert(alert.id, alert.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: AlertId) -> Result<Option<Alert>> {
        Ok(self.inner.lock().alerts.get(&id).cloned())
    }

    async fn find(
        &self,
        incident_id: IncidentId,
        audience_user_id: UserId,
        channel: Channel,
    ) -> Result<Option<Alert>> {
        Ok(self
            .inner
            .lock()
            .alerts
            .values()
            .find(|a| {
                a.incident_id == incident_id
                    && a.audience_user_id == audience_user_id
                    && a.channel == channel
            })
            .cloned())
    }

    async fn find_for_incident(&self, incident_id: IncidentId) -> Result<Vec<Alert>> {
        let mut alerts: Vec<Alert> = self
            .inner
            .lock()
            .alerts
            .values()
            .filter(|a| a.incident_id == incident_id)
            .cloned()
            .collect();
        alerts.sort_by_key(|a| a.created_at);
        Ok(alerts)
    }

    async fn update_status(
        &self,
        id: AlertId,
        status: AlertStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        let mut state = self.inner.lock();
        let alert = state
            .alerts
            .get_mut(&id)
            .ok_or(DomainError::AlertNotFound { alert_id: id })?;
        alert.status = status;
        if let Some(err) = last_error {
            alert.last_error = Some(err.to_string());
        }
        Ok(())
    }

    async fn set_chat_message_id(&self, id: AlertId, message_id: &str) -> Result<()> {
        let mut state = self.inner.lock();
        let alert = state
            .alerts
            .get_mut(&id)
            .ok_or(DomainError::AlertNotFound { alert_id: id })?;
        alert.chat_message_id = Some(message_id.to_string());
        Ok(())
    }

    async fn increment_attempts(&self, id: AlertId) -> Result<u32> {
        let mut state = self.inner.lock();
        let alert = state
            .alerts
            .get_mut(&id)
            .ok_or(DomainError::AlertNotFound { alert_id: id })?;
        alert.attempts += 1;
        Ok(alert.attempts)
    }
}

#[async_trait]
impl CallAttemptRepository for MemoryStore {
    async fn insert(&self, attempt: &CallAttempt) -> Result<()> {
        let mut state = self.inner.lock();
        if state
            .attempts
            .values()
            .any(|ca| ca.alert_id == attempt.alert_id && ca.result == CallResult::Pending)
        {
            return Err(DomainError::Validation {
                field: "call_attempt".to_string(),
                reason: "Alert already has a pending attempt".to_string(),
            });
        }
        state.attempts.insert(attempt.id, attempt.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: CallAttemptId) -> Result<Option<CallAttempt>> {
        Ok(self.inner.lock().attempts.get(&id).cloned())
    }

    async fn find_by_provider_call_id(
        &self,
        provider_call_id: &str,
    ) -> Result<Option<CallAttempt>> {
        Ok(self
            .inner
            .lock()
            .attempts
            .values()
            .find(|ca| ca.provider_call_id.as_deref() == Some(provider_call_id))
            .cloned())
    }

    async fn latest_for_alert(&self, alert_id: AlertId) -> Result<Option<CallAttempt>> {
        Ok(self
            .inner
            .lock()
            .attempts
            .values()
            .filter(|ca| ca.alert_id == alert_id)
            .max_by_key(|ca| ca.attempt_no)
            .cloned())
    }

    async fn record_placed(&self, id: CallAttemptId, provider_call_id: &str) -> Result<()> {
        let mut state = self.inner.lock();
        let attempt = state
            .attempts
            .get_mut(&id)
            .ok_or(DomainError::CallAttemptNotFound { attempt_id: id })?;
        attempt.provider_call_id = Some(provider_call_id.to_string());
        Ok(())
    }

    async fn record_result(
        &self,
        id: CallAttemptId,
        result: CallResult,
        dtmf: Option<&str>,
        error_code: Option<&str>,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut state = self.inner.lock();
        let attempt = state
            .attempts
            .get_mut(&id)
            .ok_or(DomainError::CallAttemptNotFound { attempt_id: id })?;
        attempt.result = result;
        if let Some(dtmf) = dtmf {
            attempt.dtmf_received = Some(dtmf.to_string());
        }
        if let Some(code) = error_code {
            attempt.error_code = Some(code.to_string());
        }
        if ended_at.is_some() {
            attempt.ended_at = ended_at;
        }
        Ok(())
    }

    async fn total_ring_secs(&self, alert_id: AlertId) -> Result<u32> {
        Ok(self
            .inner
            .lock()
            .attempts
            .values()
            .filter(|ca| ca.alert_id == alert_id)
            .map(|ca| ca.ring_secs())
            .sum())
    }
}

#[async_trait]
impl InboxRepository for MemoryStore {
    async fn record(
        &self,
        provider: &str,
        provider_event_id: &str,
        payload: &serde_json::Value,
    ) -> Result<InboxOutcome> {
        let mut state = self.inner.lock();
        let duplicate = state
            .inbox
            .iter()
            .any(|e| e.provider == provider && e.provider_event_id == provider_event_id);
        if duplicate {
            return Ok(InboxOutcome::Duplicate);
        }
        state.inbox.push(InboxEvent {
            id: Uuid::new_v4(),
            provider: provider.to_string(),
            provider_event_id: provider_event_id.to_string(),
            payload: payload.clone(),
            received_at: Utc::now(),
            processed_at: None,
        });
        Ok(InboxOutcome::Fresh)
    }

    async fn mark_processed(&self, provider: &str, provider_event_id: &str) -> Result<()> {
        let mut state = self.inner.lock();
        if let Some(event) = state
            .inbox
            .iter_mut()
            .find(|e| e.provider == provider && e.provider_event_id == provider_event_id)
        {
            event.processed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn find_unprocessed(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<InboxEvent>> {
        Ok(self
            .inner
            .lock()
            .inbox
            .iter()
            .filter(|e| e.processed_at.is_none() && e.received_at < older_than)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl OutboxRepository for MemoryStore {
    async fn insert_pending(&self, draft: &OutboxDraft) -> Result<OutboxMessage> {
        let mut state = self.inner.lock();
        if let Some(existing) = state
            .outbox
            .iter()
            .find(|m| m.idempotency_key == draft.idempotency_key)
        {
            return Ok(existing.clone());
        }
        let now = Utc::now();
        let message = OutboxMessage {
            id: Uuid::new_v4(),
            idempotency_key: draft.idempotency_key.clone(),
            channel: draft.channel,
            payload: draft.payload.clone(),
            status: OutboxStatus::Pending,
            provider_message_id: None,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        state.outbox.push(message.clone());
        Ok(message)
    }

    async fn find_by_key(&self, idempotency_key: &str) -> Result<Option<OutboxMessage>> {
        Ok(self
            .inner
            .lock()
            .outbox
            .iter()
            .find(|m| m.idempotency_key == idempotency_key)
            .cloned())
    }

    async fn mark_sent(&self, id: Uuid, provider_message_id: &str) -> Result<()> {
        let mut state = self.inner.lock();
        if let Some(message) = state.outbox.iter_mut().find(|m| m.id == id) {
            message.status = OutboxStatus::Sent;
            message.provider_message_id = Some(provider_message_id.to_string());
            message.attempts += 1;
            message.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()> {
        let mut state = self.inner.lock();
        if let Some(message) = state.outbox.iter_mut().find(|m| m.id == id) {
            message.status = OutboxStatus::Failed;
            message.last_error = Some(error.to_string());
            message.attempts += 1;
            message.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn find_undelivered(&self, limit: i64) -> Result<Vec<OutboxMessage>> {
        Ok(self
            .inner
            .lock()
            .outbox
            .iter()
            .filter(|m| m.status != OutboxStatus::Sent)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ScheduledActionRepository for MemoryStore {
    async fn schedule(&self, action: &ScheduledAction) -> Result<()> {
        self.inner.lock().actions.insert(action.id, action.clone());
        Ok(())
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduledAction>> {
        let mut state = self.inner.lock();
        let mut due: Vec<ScheduledAction> = state
            .actions
            .values()
            .filter(|a| a.state == ActionState::Scheduled && a.run_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|a| a.run_at);
        due.truncate(limit as usize);
        for action in &mut due {
            action.state = ActionState::Running;
            if let Some(stored) = state.actions.get_mut(&action.id) {
                stored.state = ActionState::Running;
            }
        }
        Ok(due)
    }

    async fn mark_done(&self, id: ActionId) -> Result<()> {
        let mut state = self.inner.lock();
        if let Some(action) = state.actions.get_mut(&id) {
            action.state = ActionState::Done;
            action.attempts += 1;
        }
        Ok(())
    }

    async fn reschedule(&self, id: ActionId, run_at: DateTime<Utc>, error: &str) -> Result<()> {
        let mut state = self.inner.lock();
        if let Some(action) = state.actions.get_mut(&id) {
            action.state = ActionState::Scheduled;
            action.run_at = run_at;
            action.attempts += 1;
            action.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn mark_failed(&self, id: ActionId, error: &str) -> Result<()> {
        let mut state = self.inner.lock();
        if let Some(action) = state.actions.get_mut(&id) {
            action.state = ActionState::Failed;
            action.attempts += 1;
            action.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn cancel_for_incident(&self, incident_id: IncidentId) -> Result<u64> {
        let mut state = self.inner.lock();
        let mut canceled = 0;
        for action in state.actions.values_mut() {
            if action.incident_id == Some(incident_id) && action.state == ActionState::Scheduled {
                action.state = ActionState::Canceled;
                canceled += 1;
            }
        }
        Ok(canceled)
    }

    async fn recover_running(&self) -> Result<u64> {
        let mut state = self.inner.lock();
        let mut recovered = 0;
        for action in state.actions.values_mut() {
            if action.state == ActionState::Running {
                action.state = ActionState::Scheduled;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn count_scheduled(&self, incident_id: IncidentId) -> Result<i64> {
        Ok(self
            .inner
            .lock()
            .actions
            .values()
            .filter(|a| a.incident_id == Some(incident_id) && a.state == ActionState::Scheduled)
            .count() as i64)
    }

    async fn find_scheduled_by_type(&self, action_type: &str) -> Result<Vec<ScheduledAction>> {
        let mut actions: Vec<ScheduledAction> = self
            .inner
            .lock()
            .actions
            .values()
            .filter(|a| a.action_type == action_type && a.state == ActionState::Scheduled)
            .cloned()
            .collect();
        actions.sort_by_key(|a| a.run_at);
        Ok(actions)
    }
}

#[async_trait]
impl StoreHealth for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
