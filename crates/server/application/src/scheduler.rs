//! Durable scheduler runner.
//!
//! A single cooperative runner polls due actions, dispatches them through
//! the handler registry and applies a capped exponential backoff on
//! failure. Deployed as a singleton behind the store gateway's leader
//! lock; web replicas only enqueue.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use vigil_server_domain::cascade::action_retry_backoff;
use vigil_server_domain::ports::{HandlerRegistry, ScheduledActionRepository};
use vigil_server_domain::shared_kernel::Result;

use crate::outbox::OutboxDispatcher;
use crate::telemetry::Metrics;

/// Whether this process currently holds scheduler leadership. Readiness
/// only checks the heartbeat on the replica that actually won the leader
/// lock; passive replicas stay in rotation.
#[derive(Default)]
pub struct SchedulerLeadership {
    leader: AtomicBool,
}

impl SchedulerLeadership {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn mark_leader(&self) {
        self.leader.store(true, Ordering::SeqCst);
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }
}

/// Liveness signal for the readiness probe.
#[derive(Default)]
pub struct SchedulerHeartbeat {
    last_beat_ms: AtomicI64,
}

impl SchedulerHeartbeat {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn beat(&self) {
        self.last_beat_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    pub fn is_fresh(&self, max_age: Duration) -> bool {
        let last = self.last_beat_ms.load(Ordering::SeqCst);
        if last == 0 {
            return false;
        }
        let age_ms = Utc::now().timestamp_millis() - last;
        age_ms >= 0 && (age_ms as u128) <= max_age.as_millis()
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    /// Retry ceiling per action before it is marked failed.
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    /// Outbox rows retried per poll cycle.
    pub outbox_flush_batch: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1_000),
            batch_size: 32,
            max_attempts: 5,
            backoff_base_secs: 5,
            backoff_cap_secs: 300,
            outbox_flush_batch: 16,
        }
    }
}

pub struct SchedulerRunner {
    actions: Arc<dyn ScheduledActionRepository>,
    registry: Arc<HandlerRegistry>,
    outbox: Arc<OutboxDispatcher>,
    heartbeat: Arc<SchedulerHeartbeat>,
    metrics: Arc<Metrics>,
    config: SchedulerConfig,
}

impl SchedulerRunner {
    pub fn new(
        actions: Arc<dyn ScheduledActionRepository>,
        registry: Arc<HandlerRegistry>,
        outbox: Arc<OutboxDispatcher>,
        heartbeat: Arc<SchedulerHeartbeat>,
        metrics: Arc<Metrics>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            actions,
            registry,
            outbox,
            heartbeat,
            metrics,
            config,
        }
    }

    /// Re-adopt actions a crashed runner left in `running`.
    pub async fn recover(&self) -> Result<u64> {
        let recovered = self.actions.recover_running().await?;
        if recovered > 0 {
            info!(recovered, "Recovered in-flight actions from a previous run");
        }
        Ok(recovered)
    }

    /// Poll and dispatch until the task is aborted.
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Scheduler runner started"
        );
        if let Err(e) = self.recover().await {
            error!(error = %e, "In-flight action recovery failed");
        }
        loop {
            match self.run_once().await {
                Ok(count) if count > 0 => {
                    debug!(count, "Dispatched scheduled actions");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Scheduler poll failed"),
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// One poll cycle: flush undelivered outbox rows, then claim and run
    /// due actions. Returns how many actions were dispatched.
    pub async fn run_once(&self) -> Result<usize> {
        self.heartbeat.beat();

        if let Err(e) = self
            .outbox
            .flush_undelivered(self.config.outbox_flush_batch)
            .await
        {
            warn!(error = %e, "Outbox flush failed");
        }

        let now = Utc::now();
        let due = self.actions.claim_due(now, self.config.batch_size).await?;
        let count = due.len();

        for action in due {
            let lag = (now - action.run_at).num_milliseconds().max(0) as f64 / 1_000.0;
            self.metrics
                .scheduler_action_lag
                .with_label_values(&[&action.action_type])
                .observe(lag);

            let Some(handler) = self.registry.get(&action.action_type) else {
                error!(
                    action_id = %action.id,
                    action_type = %action.action_type,
                    "No handler registered, marking failed"
                );
                self.actions
                    .mark_failed(action.id, "no handler registered")
                    .await
                    .ok();
                self.metrics
                    .scheduler_actions_failed
                    .with_label_values(&[&action.action_type])
                    .inc();
                continue;
            };

            match handler.handle(action.incident_id, &action.payload).await {
                Ok(()) => {
                    self.actions.mark_done(action.id).await?;
                }
                Err(e) => {
                    let attempts = action.attempts + 1;
                    if !e.is_retryable() || attempts >= self.config.max_attempts {
                        error!(
                            action_id = %action.id,
                            action_type = %action.action_type,
                            attempts,
                            error = %e,
                            "Scheduled action failed permanently"
                        );
                        self.actions.mark_failed(action.id, &e.to_string()).await?;
                        self.metrics
                            .scheduler_actions_failed
                            .with_label_values(&[&action.action_type])
                            .inc();
                    } else {
                        let backoff = action_retry_backoff(
                            attempts,
                            self.config.backoff_base_secs,
                            self.config.backoff_cap_secs,
                        );
                        warn!(
                            action_id = %action.id,
                            action_type = %action.action_type,
                            attempts,
                            backoff_secs = backoff.num_seconds(),
                            error = %e,
                            "Scheduled action failed, backing off"
                        );
                        self.actions
                            .reschedule(action.id, Utc::now() + backoff, &e.to_string())
                            .await?;
                    }
                }
            }
        }

        Ok(count)
    }
}
