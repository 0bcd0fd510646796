//! Inbox gate: record a provider event exactly once, run the domain
//! handler on the first delivery only.
//!
//! The recording and the domain effects commit in separate transactions; a
//! crash between them leaves `processed_at` null, and the background sweep
//! re-dispatches the event later.

use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use vigil_server_domain::ports::{InboxOutcome, InboxRepository};
use vigil_server_domain::shared_kernel::Result;

use crate::telemetry::Metrics;

pub struct InboxProcessor {
    inbox: Arc<dyn InboxRepository>,
    metrics: Arc<Metrics>,
}

impl InboxProcessor {
    pub fn new(inbox: Arc<dyn InboxRepository>, metrics: Arc<Metrics>) -> Self {
        Self { inbox, metrics }
    }

    /// Record the event and run `handler` only when the recording is fresh.
    /// `processed_at` is set after the handler returns successfully; a
    /// failing handler leaves the event eligible for the sweep.
    pub async fn process<F, Fut>(
        &self,
        provider: &str,
        provider_event_id: &str,
        payload: &serde_json::Value,
        handler: F,
    ) -> Result<InboxOutcome>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<()>> + Send,
    {
        match self.inbox.record(provider, provider_event_id, payload).await? {
            InboxOutcome::Duplicate => {
                debug!(provider, event_id = provider_event_id, "Duplicate event");
                self.metrics
                    .webhook_duplicates
                    .with_label_values(&[provider])
                    .inc();
                Ok(InboxOutcome::Duplicate)
            }
            InboxOutcome::Fresh => {
                handler().await?;
                self.inbox
                    .mark_processed(provider, provider_event_id)
                    .await?;
                Ok(InboxOutcome::Fresh)
            }
        }
    }

    pub fn repository(&self) -> Arc<dyn InboxRepository> {
        self.inbox.clone()
    }
}
