//! Ports adapted by the infrastructure layer: provider verbs, the
//! inbox/outbox idempotency stores, the durable scheduler store and the
//! action-handler contract.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::shared_kernel::{ActionId, Channel, DomainError, IncidentId, Result};

// ---------------------------------------------------------------------------
// Provider ports
// ---------------------------------------------------------------------------

/// One inline button rendered under a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineButton {
    pub label: String,
    /// Opaque payload echoed back in the callback, bounded to 64 bytes.
    pub callback_data: String,
}

/// Chat provider verb set.
#[async_trait]
pub trait ChatPort: Send + Sync {
    /// Send a text message, returning the provider message id.
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        buttons: &[InlineButton],
    ) -> Result<String>;

    /// Acknowledge an inline-button press so the client stops its spinner.
    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<()>;

    /// Edit a previously sent message in place.
    async fn edit_message(
        &self,
        chat_id: &str,
        message_id: &str,
        text: &str,
        buttons: &[InlineButton],
    ) -> Result<()>;
}

/// Ordered instruction executed by the voice provider once the call is
/// answered. The adapter translates these to the provider's own markup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallInstruction {
    Speak {
        language: String,
        text: String,
    },
    GatherDtmf {
        max_digits: u8,
        timeout_secs: u32,
        #[serde(default)]
        finish_on_key: Option<char>,
    },
    Hangup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceCallRequest {
    pub to_e164: String,
    pub instructions: Vec<CallInstruction>,
    pub result_webhook_url: String,
    pub ring_timeout_secs: u32,
    pub max_duration_secs: u32,
}

/// Voice provider verb set.
#[async_trait]
pub trait VoicePort: Send + Sync {
    /// Place an outbound call, returning the provider call id.
    async fn place_call(&self, request: &PlaceCallRequest) -> Result<String>;

    /// Best-effort hangup of an in-progress call.
    async fn hangup(&self, provider_call_id: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Inbox
// ---------------------------------------------------------------------------

/// A provider event recorded exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxEvent {
    pub id: Uuid,
    pub provider: String,
    pub provider_event_id: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxOutcome {
    Fresh,
    Duplicate,
}

#[async_trait]
pub trait InboxRepository: Send + Sync {
    /// Record an event; a unique violation on (provider, event id) returns
    /// `Duplicate` without error. Callers process only on `Fresh`.
    async fn record(
        &self,
        provider: &str,
        provider_event_id: &str,
        payload: &serde_json::Value,
    ) -> Result<InboxOutcome>;

    /// Set after the domain handler for the event has committed.
    async fn mark_processed(&self, provider: &str, provider_event_id: &str) -> Result<()>;

    /// Events recorded but never processed, for the background sweep.
    async fn find_unprocessed(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<InboxEvent>>;
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Sent,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Sent => "sent",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(OutboxStatus::Pending),
            "sent" => Ok(OutboxStatus::Sent),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(DomainError::Validation {
                field: "outbox.status".to_string(),
                reason: format!("Unknown status: {}", other),
            }),
        }
    }
}

/// The record of intent to call a provider, keyed for exactly-once sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub idempotency_key: String,
    pub channel: Channel,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub provider_message_id: Option<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Insert a pending row for the draft; on a key conflict the stored row
    /// wins and is returned unchanged (first write wins).
    async fn insert_pending(&self, draft: &crate::events::OutboxDraft) -> Result<OutboxMessage>;

    async fn find_by_key(&self, idempotency_key: &str) -> Result<Option<OutboxMessage>>;

    async fn mark_sent(&self, id: Uuid, provider_message_id: &str) -> Result<()>;

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()>;

    /// Pending and retryable-failed rows, oldest first.
    async fn find_undelivered(&self, limit: i64) -> Result<Vec<OutboxMessage>>;
}

// ---------------------------------------------------------------------------
// Durable scheduler
// ---------------------------------------------------------------------------

pub mod action_types {
    /// Place (or retry) one voice call attempt.
    pub const CALL_ATTEMPT: &str = "call_attempt";
    /// Periodic chat reminder for an open incident.
    pub const PANIC_REMINDER: &str = "panic_reminder";
    /// Re-run an acknowledgment that lost the advisory lock.
    pub const ACK_RECONCILE: &str = "ack_reconcile";
    /// Re-dispatch inbox events that never reached `processed_at`.
    pub const INBOX_SWEEP: &str = "inbox_sweep";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Scheduled,
    Running,
    Done,
    Canceled,
    Failed,
}

impl ActionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionState::Scheduled => "scheduled",
            ActionState::Running => "running",
            ActionState::Done => "done",
            ActionState::Canceled => "canceled",
            ActionState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "scheduled" => Ok(ActionState::Scheduled),
            "running" => Ok(ActionState::Running),
            "done" => Ok(ActionState::Done),
            "canceled" => Ok(ActionState::Canceled),
            "failed" => Ok(ActionState::Failed),
            other => Err(DomainError::Validation {
                field: "scheduled_action.state".to_string(),
                reason: format!("Unknown state: {}", other),
            }),
        }
    }
}

/// A named action fired at-least-once at `run_at`. Most actions are bound
/// to an incident; maintenance actions (the inbox sweep) are not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledAction {
    pub id: ActionId,
    pub incident_id: Option<IncidentId>,
    pub action_type: String,
    pub run_at: DateTime<Utc>,
    pub state: ActionState,
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ScheduledAction {
    pub fn new(
        incident_id: IncidentId,
        action_type: &str,
        run_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: ActionId::new(),
            incident_id: Some(incident_id),
            action_type: action_type.to_string(),
            run_at,
            state: ActionState::Scheduled,
            payload,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    /// An action not tied to any incident.
    pub fn system(action_type: &str, run_at: DateTime<Utc>, payload: serde_json::Value) -> Self {
        Self {
            id: ActionId::new(),
            incident_id: None,
            action_type: action_type.to_string(),
            run_at,
            state: ActionState::Scheduled,
            payload,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait ScheduledActionRepository: Send + Sync {
    async fn schedule(&self, action: &ScheduledAction) -> Result<()>;

    /// Claim due actions (scheduled, run_at <= now) and flip them to
    /// `running`. Claims are exclusive across competing pollers.
    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduledAction>>;

    async fn mark_done(&self, id: ActionId) -> Result<()>;

    /// Put a failed action back in line with its attempt counter bumped.
    async fn reschedule(&self, id: ActionId, run_at: DateTime<Utc>, error: &str) -> Result<()>;

    async fn mark_failed(&self, id: ActionId, error: &str) -> Result<()>;

    /// Cancel every still-scheduled action of an incident.
    async fn cancel_for_incident(&self, incident_id: IncidentId) -> Result<u64>;

    /// Return `running` actions to `scheduled`. Called by a starting
    /// runner: with a single leader, anything still marked running was
    /// orphaned by a crash mid-dispatch, and handlers are idempotent.
    async fn recover_running(&self) -> Result<u64>;

    /// Number of actions still in `scheduled` for an incident.
    async fn count_scheduled(&self, incident_id: IncidentId) -> Result<i64>;

    /// Still-scheduled actions of one type; lets a recurring system action
    /// avoid seeding a second chain.
    async fn find_scheduled_by_type(&self, action_type: &str) -> Result<Vec<ScheduledAction>>;
}

/// A handler invoked by the scheduler runner for one action type.
///
/// Handlers are idempotent by contract: incident state guards duplicate
/// work, and a handler firing after the incident left `open` is a no-op.
/// `incident_id` is `None` for system actions.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(
        &self,
        incident_id: Option<IncidentId>,
        payload: &serde_json::Value,
    ) -> Result<()>;
}

/// String -> handler map assembled at startup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action_type: &str, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(action_type.to_string(), handler);
    }

    pub fn get(&self, action_type: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(action_type).cloned()
    }
}

// ---------------------------------------------------------------------------
// Operational probes
// ---------------------------------------------------------------------------

/// Readiness probe against the backing store.
#[async_trait]
pub trait StoreHealth: Send + Sync {
    async fn ping(&self) -> Result<()>;
}

/// Applies and reports schema migrations, exposed on the admin surface.
#[async_trait]
pub trait MigrationControl: Send + Sync {
    async fn apply(&self) -> Result<Vec<String>>;

    async fn status(&self) -> Result<MigrationStatus>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationStatus {
    pub applied: Vec<String>,
    pub pending: Vec<String>,
}
