//! The incident state machine.
//!
//! `open -> acknowledged` and `open -> canceled` are the only transitions;
//! terminal statuses are monotonic. Concurrent terminal transitions are
//! serialized by the store gateway's advisory incident lock, and a repeated
//! transition returns the recorded decision unchanged.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::OutboxDraft;
use crate::shared_kernel::{DomainError, IncidentId, Result, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Open,
    Acknowledged,
    Canceled,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Open => "open",
            IncidentStatus::Acknowledged => "acknowledged",
            IncidentStatus::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "open" => Ok(IncidentStatus::Open),
            "acknowledged" => Ok(IncidentStatus::Acknowledged),
            "canceled" => Ok(IncidentStatus::Canceled),
            other => Err(DomainError::Validation {
                field: "incident.status".to_string(),
                reason: format!("Unknown status: {}", other),
            }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, IncidentStatus::Open)
    }
}

/// How a guardian acknowledged: inline chat button or DTMF "1".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckChannel {
    ChatButton,
    Dtmf,
}

impl AckChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckChannel::ChatButton => "chat_button",
            AckChannel::Dtmf => "dtmf",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "chat_button" => Ok(AckChannel::ChatButton),
            "dtmf" => Ok(AckChannel::Dtmf),
            other => Err(DomainError::Validation {
                field: "incident.ack_channel".to_string(),
                reason: format!("Unknown ack channel: {}", other),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub traveler_user_id: UserId,
    pub status: IncidentStatus,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by_user_id: Option<UserId>,
    pub ack_channel: Option<AckChannel>,
    pub canceled_at: Option<DateTime<Utc>>,
}

impl Incident {
    pub fn new(traveler_user_id: UserId) -> Self {
        Self {
            id: IncidentId::new(),
            traveler_user_id,
            status: IncidentStatus::Open,
            created_at: Utc::now(),
            acknowledged_at: None,
            acknowledged_by_user_id: None,
            ack_channel: None,
            canceled_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == IncidentStatus::Open
    }

    /// Apply a terminal transition in memory. The caller guards `open`.
    pub fn apply_terminal(&mut self, transition: &TerminalTransition, at: DateTime<Utc>) {
        match transition {
            TerminalTransition::Acknowledge { by, via } => {
                self.status = IncidentStatus::Acknowledged;
                self.acknowledged_at = Some(at);
                self.acknowledged_by_user_id = Some(*by);
                self.ack_channel = Some(*via);
            }
            TerminalTransition::Cancel { .. } => {
                self.status = IncidentStatus::Canceled;
                self.canceled_at = Some(at);
            }
        }
    }
}

/// The two terminal transitions an open incident accepts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TerminalTransition {
    Acknowledge { by: UserId, via: AckChannel },
    Cancel { by: UserId },
}

impl TerminalTransition {
    pub fn target_status(&self) -> IncidentStatus {
        match self {
            TerminalTransition::Acknowledge { .. } => IncidentStatus::Acknowledged,
            TerminalTransition::Cancel { .. } => IncidentStatus::Canceled,
        }
    }
}

/// Outcome of an attempted terminal transition.
#[derive(Debug, Clone)]
pub enum TerminalOutcome {
    /// The transition was applied now. Carries provider call ids of call
    /// attempts that were still live, for best-effort post-commit hangup.
    Applied {
        incident: Incident,
        hangup_provider_call_ids: Vec<String>,
    },
    /// The incident was already terminal; the stored decision is returned
    /// unchanged (second acknowledge/cancel is a no-op).
    AlreadyTerminal { incident: Incident },
}

impl TerminalOutcome {
    pub fn incident(&self) -> &Incident {
        match self {
            TerminalOutcome::Applied { incident, .. } => incident,
            TerminalOutcome::AlreadyTerminal { incident } => incident,
        }
    }

    pub fn applied(&self) -> bool {
        matches!(self, TerminalOutcome::Applied { .. })
    }
}

#[async_trait]
pub trait IncidentRepository: Send + Sync {
    async fn insert(&self, incident: &Incident) -> Result<()>;

    async fn find_by_id(&self, id: IncidentId) -> Result<Option<Incident>>;

    async fn find_open_for_traveler(&self, traveler_user_id: UserId) -> Result<Option<Incident>>;

    /// Atomically apply a terminal transition under the advisory incident
    /// lock: gate on `open`, flip the status, cancel every scheduled action
    /// of the incident, enqueue the side-effect outbox drafts, and collect
    /// provider call ids of still-live call attempts. Lock starvation
    /// surfaces as [`DomainError::Contention`].
    async fn transition_terminal(
        &self,
        id: IncidentId,
        transition: TerminalTransition,
        side_effects: Vec<OutboxDraft>,
    ) -> Result<TerminalOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_terminal() {
        assert!(!IncidentStatus::Open.is_terminal());
        assert!(IncidentStatus::Acknowledged.is_terminal());
        assert!(IncidentStatus::Canceled.is_terminal());
    }

    #[test]
    fn acknowledge_records_who_and_how() {
        let mut incident = Incident::new(UserId::new());
        let guardian = UserId::new();
        let at = Utc::now();

        incident.apply_terminal(
            &TerminalTransition::Acknowledge {
                by: guardian,
                via: AckChannel::Dtmf,
            },
            at,
        );

        assert_eq!(incident.status, IncidentStatus::Acknowledged);
        assert_eq!(incident.acknowledged_by_user_id, Some(guardian));
        assert_eq!(incident.ack_channel, Some(AckChannel::Dtmf));
        assert_eq!(incident.acknowledged_at, Some(at));
        assert!(incident.canceled_at.is_none());
    }

    #[test]
    fn cancel_records_timestamp_only() {
        let mut incident = Incident::new(UserId::new());
        let at = Utc::now();

        incident.apply_terminal(&TerminalTransition::Cancel { by: UserId::new() }, at);

        assert_eq!(incident.status, IncidentStatus::Canceled);
        assert_eq!(incident.canceled_at, Some(at));
        assert!(incident.acknowledged_by_user_id.is_none());
    }

    #[test]
    fn status_parse_round_trip() {
        for status in [
            IncidentStatus::Open,
            IncidentStatus::Acknowledged,
            IncidentStatus::Canceled,
        ] {
            assert_eq!(IncidentStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(IncidentStatus::parse("exhausted").is_err());
    }
}
