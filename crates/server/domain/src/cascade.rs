//! Pure cascade policy: idempotency keys, call retry decisions and the
//! scheduler's failure backoff. Everything here is side-effect free so the
//! engine and the tests share one source of truth.

use chrono::{DateTime, Duration, Utc};

use crate::alerts::CallResult;
use crate::guardians::GuardianLink;
use crate::shared_kernel::{IncidentId, UserId};

/// Idempotency-key builders for every outbound action of one incident.
///
/// A retried cascade step re-derives the same key and therefore collapses
/// onto a single real provider call.
pub mod keys {
    use super::*;

    /// Initial chat alert to one guardian.
    pub fn chat_alert(incident: IncidentId, audience: UserId) -> String {
        format!("chat:{}:{}:alert", incident, audience)
    }

    /// n-th reminder edit of the guardian's alert message.
    pub fn chat_reminder(incident: IncidentId, audience: UserId, n: u32) -> String {
        format!("chat:{}:{}:reminder:{}", incident, audience, n)
    }

    /// "Handled by X" edit sent to a guardian after acknowledgment.
    pub fn chat_handled(incident: IncidentId, audience: UserId) -> String {
        format!("chat:{}:{}:handled", incident, audience)
    }

    /// "Canceled by traveler" edit sent to a guardian.
    pub fn chat_canceled(incident: IncidentId, audience: UserId) -> String {
        format!("chat:{}:{}:canceled", incident, audience)
    }

    /// Acknowledgment notice sent back to the traveler.
    pub fn chat_traveler_ack(incident: IncidentId) -> String {
        format!("chat:{}:traveler:acknowledged", incident)
    }

    /// Cancellation confirmation sent back to the traveler.
    pub fn chat_traveler_cancel(incident: IncidentId) -> String {
        format!("chat:{}:traveler:canceled", incident)
    }

    /// "Could not reach any guardian" notice to the traveler.
    pub fn chat_traveler_unreachable(incident: IncidentId) -> String {
        format!("chat:{}:traveler:unreachable", incident)
    }

    /// Panic confirmation (with cancel button) sent to the traveler.
    pub fn chat_traveler_opened(incident: IncidentId) -> String {
        format!("chat:{}:traveler:opened", incident)
    }

    /// n-th voice call placed for one guardian.
    pub fn voice_attempt(incident: IncidentId, audience: UserId, n: u32) -> String {
        format!("voice:{}:{}:attempt:{}", incident, audience, n)
    }
}

/// What the policy wants after a call attempt reached a terminal result.
#[derive(Debug, Clone, PartialEq)]
pub enum NextCallStep {
    /// Schedule the next attempt at `run_at`.
    Retry { attempt_no: u32, run_at: DateTime<Utc> },
    /// The guardian's voice alert is exhausted.
    Halt,
}

/// Decide the follow-up to a finished call attempt.
///
/// Backoff is measured from the attempt's end, not from when the decision
/// runs, so a scheduler restart between the two does not stretch the
/// cascade. The total-ring cap bounds runaway retries regardless of the
/// per-link retry budget.
pub fn next_call_step(
    link: &GuardianLink,
    attempt_no: u32,
    result: CallResult,
    attempt_ended_at: DateTime<Utc>,
    total_ring_secs: u32,
    max_total_ring_secs: u32,
) -> NextCallStep {
    debug_assert!(result.is_terminal());

    if result == CallResult::Acknowledged {
        return NextCallStep::Halt;
    }

    if attempt_no >= link.max_retries {
        return NextCallStep::Halt;
    }

    if total_ring_secs >= max_total_ring_secs {
        return NextCallStep::Halt;
    }

    NextCallStep::Retry {
        attempt_no: attempt_no + 1,
        run_at: attempt_ended_at + Duration::seconds(i64::from(link.retry_backoff_secs)),
    }
}

/// Exponential backoff for failed scheduled actions, capped.
pub fn action_retry_backoff(attempts: u32, base_secs: u64, cap_secs: u64) -> Duration {
    let exp = attempts.saturating_sub(1).min(16);
    let secs = base_secs.saturating_mul(1u64 << exp).min(cap_secs);
    Duration::seconds(secs as i64)
}

/// Bound for the random spread applied to seed calls so one incident does
/// not burst the voice provider.
pub const SEED_JITTER_MAX_MS: u64 = 1_500;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guardians::CascadeDefaults;

    fn link_with(max_retries: u32, backoff_secs: u32) -> GuardianLink {
        let mut link = GuardianLink::new(
            UserId::new(),
            UserId::new(),
            1,
            &CascadeDefaults::default(),
        );
        link.max_retries = max_retries;
        link.retry_backoff_secs = backoff_secs;
        link
    }

    #[test]
    fn keys_follow_the_documented_shape() {
        let incident = IncidentId::new();
        let audience = UserId::new();

        assert_eq!(
            keys::chat_alert(incident, audience),
            format!("chat:{}:{}:alert", incident, audience)
        );
        assert_eq!(
            keys::voice_attempt(incident, audience, 2),
            format!("voice:{}:{}:attempt:2", incident, audience)
        );
        assert_eq!(
            keys::chat_reminder(incident, audience, 3),
            format!("chat:{}:{}:reminder:3", incident, audience)
        );
    }

    #[test]
    fn retry_backoff_measured_from_attempt_end() {
        let link = link_with(2, 60);
        let ended = Utc::now();

        match next_call_step(&link, 1, CallResult::NoAnswer, ended, 25, 180) {
            NextCallStep::Retry { attempt_no, run_at } => {
                assert_eq!(attempt_no, 2);
                assert_eq!(run_at, ended + Duration::seconds(60));
            }
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn halts_once_retry_budget_is_spent() {
        let link = link_with(2, 60);
        let step = next_call_step(&link, 2, CallResult::NoAnswer, Utc::now(), 50, 180);
        assert_eq!(step, NextCallStep::Halt);
    }

    #[test]
    fn halts_at_the_total_ring_cap_even_with_retries_left() {
        let link = link_with(5, 60);
        let step = next_call_step(&link, 2, CallResult::Busy, Utc::now(), 180, 180);
        assert_eq!(step, NextCallStep::Halt);
    }

    #[test]
    fn machine_answer_is_retried_like_no_answer() {
        let link = link_with(3, 30);
        let ended = Utc::now();
        match next_call_step(&link, 1, CallResult::AnsweredMachine, ended, 10, 180) {
            NextCallStep::Retry { run_at, .. } => {
                assert_eq!(run_at, ended + Duration::seconds(30));
            }
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn acknowledged_never_retries() {
        let link = link_with(5, 30);
        let step = next_call_step(&link, 1, CallResult::Acknowledged, Utc::now(), 0, 180);
        assert_eq!(step, NextCallStep::Halt);
    }

    #[test]
    fn action_backoff_doubles_then_caps() {
        assert_eq!(action_retry_backoff(1, 5, 300), Duration::seconds(5));
        assert_eq!(action_retry_backoff(2, 5, 300), Duration::seconds(10));
        assert_eq!(action_retry_backoff(3, 5, 300), Duration::seconds(20));
        assert_eq!(action_retry_backoff(8, 5, 300), Duration::seconds(300));
    }
}
