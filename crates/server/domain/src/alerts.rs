//! Alerts and voice call attempts.
//!
//! An alert records the intent to contact one guardian over one channel for
//! one incident; a voice alert owns a sequence of call attempts, one live at
//! a time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::shared_kernel::{
    AlertId, CallAttemptId, Channel, DomainError, IncidentId, Result, UserId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
    Halted,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Pending => "pending",
            AlertStatus::Sent => "sent",
            AlertStatus::Delivered => "delivered",
            AlertStatus::Failed => "failed",
            AlertStatus::Halted => "halted",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(AlertStatus::Pending),
            "sent" => Ok(AlertStatus::Sent),
            "delivered" => Ok(AlertStatus::Delivered),
            "failed" => Ok(AlertStatus::Failed),
            "halted" => Ok(AlertStatus::Halted),
            other => Err(DomainError::Validation {
                field: "alert.status".to_string(),
                reason: format!("Unknown status: {}", other),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub incident_id: IncidentId,
    pub audience_user_id: UserId,
    pub channel: Channel,
    pub status: AlertStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Provider message id of the initial chat alert, kept for in-place
    /// reminder edits and "handled" updates.
    pub chat_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(incident_id: IncidentId, audience_user_id: UserId, channel: Channel) -> Self {
        Self {
            id: AlertId::new(),
            incident_id,
            audience_user_id,
            channel,
            status: AlertStatus::Pending,
            attempts: 0,
            last_error: None,
            chat_message_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_halted(&self) -> bool {
        matches!(self.status, AlertStatus::Halted | AlertStatus::Failed)
    }
}

/// Result of a single voice call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallResult {
    Pending,
    Ringing,
    AnsweredHuman,
    AnsweredMachine,
    NoAnswer,
    Busy,
    Failed,
    Acknowledged,
}

impl CallResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallResult::Pending => "pending",
            CallResult::Ringing => "ringing",
            CallResult::AnsweredHuman => "answered_human",
            CallResult::AnsweredMachine => "answered_machine",
            CallResult::NoAnswer => "no_answer",
            CallResult::Busy => "busy",
            CallResult::Failed => "failed",
            CallResult::Acknowledged => "acknowledged",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(CallResult::Pending),
            "ringing" => Ok(CallResult::Ringing),
            "answered_human" => Ok(CallResult::AnsweredHuman),
            "answered_machine" => Ok(CallResult::AnsweredMachine),
            "no_answer" => Ok(CallResult::NoAnswer),
            "busy" => Ok(CallResult::Busy),
            "failed" => Ok(CallResult::Failed),
            "acknowledged" => Ok(CallResult::Acknowledged),
            other => Err(DomainError::Validation {
                field: "call_attempt.result".to_string(),
                reason: format!("Unknown result: {}", other),
            }),
        }
    }

    /// Still waiting on the provider: the call may yet be answered.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            CallResult::Pending | CallResult::Ringing | CallResult::AnsweredHuman
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallResult::AnsweredMachine
                | CallResult::NoAnswer
                | CallResult::Busy
                | CallResult::Failed
                | CallResult::Acknowledged
        )
    }
}

/// Map a provider hangup cause onto a call result.
pub fn result_from_hangup_cause(cause: &str) -> CallResult {
    match cause {
        "busy" => CallResult::Busy,
        "no_answer" | "call_timeout" | "timeout" | "originator_cancel" => CallResult::NoAnswer,
        "normal_clearing" => CallResult::NoAnswer,
        _ => CallResult::Failed,
    }
}

/// A single voice call placement under an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallAttempt {
    pub id: CallAttemptId,
    pub alert_id: AlertId,
    pub provider_call_id: Option<String>,
    /// 1-based within the alert.
    pub attempt_no: u32,
    pub result: CallResult,
    pub dtmf_received: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
}

impl CallAttempt {
    pub fn new(alert_id: AlertId, attempt_no: u32) -> Self {
        Self {
            id: CallAttemptId::new(),
            alert_id,
            provider_call_id: None,
            attempt_no,
            result: CallResult::Pending,
            dtmf_received: None,
            started_at: Utc::now(),
            ended_at: None,
            error_code: None,
        }
    }

    /// Seconds this attempt spent ringing or connected.
    pub fn ring_secs(&self) -> u32 {
        match self.ended_at {
            Some(ended) => (ended - self.started_at).num_seconds().max(0) as u32,
            None => 0,
        }
    }
}

#[async_trait]
pub trait AlertRepository: Send + Sync {
    async fn insert(&self, alert: &Alert) -> Result<()>;

    async fn find_by_id(&self, id: AlertId) -> Result<Option<Alert>>;

    /// One alert per (incident, audience, channel).
    async fn find(
        &self,
        incident_id: IncidentId,
        audience_user_id: UserId,
        channel: Channel,
    ) -> Result<Option<Alert>>;

    async fn find_for_incident(&self, incident_id: IncidentId) -> Result<Vec<Alert>>;

    async fn update_status(
        &self,
        id: AlertId,
        status: AlertStatus,
        last_error: Option<&str>,
    ) -> Result<()>;

    async fn set_chat_message_id(&self, id: AlertId, message_id: &str) -> Result<()>;

    async fn increment_attempts(&self, id: AlertId) -> Result<u32>;
}

#[async_trait]
pub trait CallAttemptRepository: Send + Sync {
    /// Insert a new attempt. Fails while the alert still has a live one.
    async fn insert(&self, attempt: &CallAttempt) -> Result<()>;

    async fn find_by_id(&self, id: CallAttemptId) -> Result<Option<CallAttempt>>;

    async fn find_by_provider_call_id(&self, provider_call_id: &str)
        -> Result<Option<CallAttempt>>;

    async fn latest_for_alert(&self, alert_id: AlertId) -> Result<Option<CallAttempt>>;

    async fn record_placed(&self, id: CallAttemptId, provider_call_id: &str) -> Result<()>;

    async fn record_result(
        &self,
        id: CallAttemptId,
        result: CallResult,
        dtmf: Option<&str>,
        error_code: Option<&str>,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Cumulative ring seconds across all finished attempts of an alert.
    async fn total_ring_secs(&self, alert_id: AlertId) -> Result<u32>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn hangup_causes_map_to_results() {
        assert_eq!(result_from_hangup_cause("busy"), CallResult::Busy);
        assert_eq!(result_from_hangup_cause("no_answer"), CallResult::NoAnswer);
        assert_eq!(
            result_from_hangup_cause("call_timeout"),
            CallResult::NoAnswer
        );
        assert_eq!(result_from_hangup_cause("call_rejected"), CallResult::Failed);
        assert_eq!(result_from_hangup_cause("unallocated"), CallResult::Failed);
    }

    #[test]
    fn live_and_terminal_partitions() {
        assert!(CallResult::Pending.is_live());
        assert!(CallResult::Ringing.is_live());
        assert!(CallResult::AnsweredHuman.is_live());
        assert!(!CallResult::NoAnswer.is_live());

        assert!(CallResult::Acknowledged.is_terminal());
        assert!(CallResult::Busy.is_terminal());
        assert!(!CallResult::Pending.is_terminal());
    }

    #[test]
    fn ring_secs_measured_from_start_to_end() {
        let mut attempt = CallAttempt::new(AlertId::new(), 1);
        assert_eq!(attempt.ring_secs(), 0);

        attempt.ended_at = Some(attempt.started_at + Duration::seconds(25));
        assert_eq!(attempt.ring_secs(), 25);
    }
}
