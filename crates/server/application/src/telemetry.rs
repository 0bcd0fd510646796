//! Prometheus metrics for the orchestrator.

use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};

pub struct Metrics {
    pub registry: Registry,
    pub panic_incidents_started: IntCounter,
    pub panic_acknowledged: IntCounter,
    pub panic_canceled: IntCounter,
    pub webhook_duplicates: IntCounterVec,
    pub webhook_rejected: IntCounterVec,
    pub outbox_send_failures: IntCounterVec,
    pub calls_placed: IntCounter,
    pub scheduler_action_lag: HistogramVec,
    pub scheduler_actions_failed: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let panic_incidents_started = IntCounter::with_opts(Opts::new(
            "vigil_panic_incidents_started_total",
            "Panic incidents opened",
        ))?;
        let panic_acknowledged = IntCounter::with_opts(Opts::new(
            "vigil_panic_acknowledged_total",
            "Panic incidents acknowledged by a guardian",
        ))?;
        let panic_canceled = IntCounter::with_opts(Opts::new(
            "vigil_panic_canceled_total",
            "Panic incidents canceled by the traveler",
        ))?;
        let webhook_duplicates = IntCounterVec::new(
            Opts::new(
                "vigil_webhook_duplicates_total",
                "Webhook deliveries rejected as duplicates",
            ),
            &["provider"],
        )?;
        let webhook_rejected = IntCounterVec::new(
            Opts::new(
                "vigil_webhook_rejected_total",
                "Webhook deliveries rejected before processing",
            ),
            &["provider", "reason"],
        )?;
        let outbox_send_failures = IntCounterVec::new(
            Opts::new(
                "vigil_outbox_send_failures_total",
                "Outbox deliveries that failed at the provider",
            ),
            &["channel"],
        )?;
        let calls_placed = IntCounter::with_opts(Opts::new(
            "vigil_calls_placed_total",
            "Outbound voice calls placed",
        ))?;
        let scheduler_action_lag = HistogramVec::new(
            HistogramOpts::new(
                "vigil_scheduler_action_lag_seconds",
                "Delay between an action's run_at and its execution",
            ),
            &["action_type"],
        )?;
        let scheduler_actions_failed = IntCounterVec::new(
            Opts::new(
                "vigil_scheduler_actions_failed_total",
                "Scheduled actions that exhausted their retries",
            ),
            &["action_type"],
        )?;

        registry.register(Box::new(panic_incidents_started.clone()))?;
        registry.register(Box::new(panic_acknowledged.clone()))?;
        registry.register(Box::new(panic_canceled.clone()))?;
        registry.register(Box::new(webhook_duplicates.clone()))?;
        registry.register(Box::new(webhook_rejected.clone()))?;
        registry.register(Box::new(outbox_send_failures.clone()))?;
        registry.register(Box::new(calls_placed.clone()))?;
        registry.register(Box::new(scheduler_action_lag.clone()))?;
        registry.register(Box::new(scheduler_actions_failed.clone()))?;

        Ok(Self {
            registry,
            panic_incidents_started,
            panic_acknowledged,
            panic_canceled,
            webhook_duplicates,
            webhook_rejected,
            outbox_send_failures,
            calls_placed,
            scheduler_action_lag,
            scheduler_actions_failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_once() {
        let metrics = Metrics::new().unwrap();
        metrics.panic_incidents_started.inc();
        assert_eq!(metrics.panic_incidents_started.get(), 1);
        assert!(!metrics.registry.gather().is_empty());
    }
}
