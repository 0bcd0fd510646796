//! Guardian links: who watches over a traveler, in what order, over which
//! channels, and with which per-guardian call settings.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::shared_kernel::{DomainError, GuardianLinkId, Result, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardianLinkStatus {
    Active,
    Revoked,
}

impl GuardianLinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardianLinkStatus::Active => "active",
            GuardianLinkStatus::Revoked => "revoked",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "active" => Ok(GuardianLinkStatus::Active),
            "revoked" => Ok(GuardianLinkStatus::Revoked),
            other => Err(DomainError::Validation {
                field: "guardian_link.status".to_string(),
                reason: format!("Unknown status: {}", other),
            }),
        }
    }
}

/// Per-traveler cascade defaults, sourced from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeDefaults {
    pub ring_timeout_secs: u32,
    pub max_retries: u32,
    pub retry_backoff_secs: u32,
    pub reminder_interval_secs: u32,
    /// Total-ring cap per guardian across all attempts.
    pub max_total_ring_secs: u32,
}

impl Default for CascadeDefaults {
    fn default() -> Self {
        Self {
            ring_timeout_secs: 25,
            max_retries: 2,
            retry_backoff_secs: 60,
            reminder_interval_secs: 120,
            max_total_ring_secs: 180,
        }
    }
}

/// (traveler, watcher) link with the watcher's contact policy.
///
/// Uniqueness on (traveler_user_id, watcher_user_id); priority_rank plus
/// created_at impose a total contact order per traveler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardianLink {
    pub id: GuardianLinkId,
    pub traveler_user_id: UserId,
    pub watcher_user_id: UserId,
    pub priority_rank: u32,
    pub ring_timeout_secs: u32,
    pub max_retries: u32,
    pub retry_backoff_secs: u32,
    pub chat_enabled: bool,
    pub call_enabled: bool,
    pub status: GuardianLinkStatus,
    pub created_at: DateTime<Utc>,
}

impl GuardianLink {
    pub fn new(
        traveler_user_id: UserId,
        watcher_user_id: UserId,
        priority_rank: u32,
        defaults: &CascadeDefaults,
    ) -> Self {
        Self {
            id: GuardianLinkId::new(),
            traveler_user_id,
            watcher_user_id,
            priority_rank,
            ring_timeout_secs: defaults.ring_timeout_secs,
            max_retries: defaults.max_retries,
            retry_backoff_secs: defaults.retry_backoff_secs,
            chat_enabled: true,
            call_enabled: true,
            status: GuardianLinkStatus::Active,
            created_at: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.priority_rank == 0 {
            return Err(DomainError::Validation {
                field: "priority_rank".to_string(),
                reason: "Priority rank must be >= 1".to_string(),
            });
        }

        if self.traveler_user_id == self.watcher_user_id {
            return Err(DomainError::Validation {
                field: "watcher_user_id".to_string(),
                reason: "A traveler cannot guard themselves".to_string(),
            });
        }

        if self.ring_timeout_secs == 0 {
            return Err(DomainError::Validation {
                field: "ring_timeout_secs".to_string(),
                reason: "Ring timeout must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.status == GuardianLinkStatus::Active
    }
}

/// Sort links into the contact order: rank ascending, link age as tiebreak.
pub fn order_contact_plan(mut links: Vec<GuardianLink>) -> Vec<GuardianLink> {
    links.sort_by(|a, b| {
        a.priority_rank
            .cmp(&b.priority_rank)
            .then(a.created_at.cmp(&b.created_at))
    });
    links
}

#[async_trait]
pub trait GuardianLinkRepository: Send + Sync {
    async fn insert(&self, link: &GuardianLink) -> Result<()>;

    /// Active links for a traveler, already in contact order.
    async fn active_for_traveler(&self, traveler_user_id: UserId) -> Result<Vec<GuardianLink>>;

    async fn find(
        &self,
        traveler_user_id: UserId,
        watcher_user_id: UserId,
    ) -> Result<Option<GuardianLink>>;

    async fn revoke(&self, id: GuardianLinkId) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn link(rank: u32, age_secs: i64) -> GuardianLink {
        let mut l = GuardianLink::new(
            UserId::new(),
            UserId::new(),
            rank,
            &CascadeDefaults::default(),
        );
        l.created_at = Utc::now() - Duration::seconds(age_secs);
        l
    }

    #[test]
    fn contact_plan_orders_by_rank_then_age() {
        let a = link(2, 100);
        let b = link(1, 10);
        let c = link(1, 50); // older than b, same rank

        let ordered = order_contact_plan(vec![a.clone(), b.clone(), c.clone()]);
        assert_eq!(ordered[0].id, c.id);
        assert_eq!(ordered[1].id, b.id);
        assert_eq!(ordered[2].id, a.id);
    }

    #[test]
    fn rejects_rank_zero_and_self_links() {
        let defaults = CascadeDefaults::default();
        let traveler = UserId::new();

        let mut bad_rank = GuardianLink::new(traveler, UserId::new(), 0, &defaults);
        assert!(bad_rank.validate().is_err());
        bad_rank.priority_rank = 1;
        assert!(bad_rank.validate().is_ok());

        let self_link = GuardianLink::new(traveler, traveler, 1, &defaults);
        assert!(self_link.validate().is_err());
    }

    #[test]
    fn defaults_match_charter_values() {
        let d = CascadeDefaults::default();
        assert_eq!(d.ring_timeout_secs, 25);
        assert_eq!(d.max_retries, 2);
        assert_eq!(d.retry_backoff_secs, 60);
        assert_eq!(d.reminder_interval_secs, 120);
        assert_eq!(d.max_total_ring_secs, 180);
    }
}
