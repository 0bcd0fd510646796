//! `inbox_sweep` handler: re-dispatch inbox events that never reached
//! `processed_at`, typically because the process crashed between recording
//! and committing the domain effects, or because a call event raced its
//! placement.
//!
//! The sweep runs as a recurring system action on the durable scheduler,
//! so only the replica holding scheduler leadership ever sweeps and two
//! replicas cannot redispatch the same stuck event concurrently. Each run
//! queues the next round; `ensure_scheduled` seeds the chain at leadership
//! acquisition without forking a second one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use vigil_server_domain::ports::{
    action_types, ActionHandler, InboxEvent, ScheduledAction, ScheduledActionRepository,
};
use vigil_server_domain::shared_kernel::{IncidentId, Result};

use crate::http::webhooks::{chat, voice};
use crate::http::AppState;

const SWEEP_BATCH: i64 = 32;

pub struct InboxSweepHandler {
    state: Arc<AppState>,
    actions: Arc<dyn ScheduledActionRepository>,
    interval: Duration,
    /// Events younger than this are left for the live webhook path.
    min_age: Duration,
}

impl InboxSweepHandler {
    pub fn new(
        state: Arc<AppState>,
        actions: Arc<dyn ScheduledActionRepository>,
        interval: Duration,
        min_age: Duration,
    ) -> Self {
        Self {
            state,
            actions,
            interval,
            min_age,
        }
    }

    /// Seed the recurring sweep unless a round is already queued.
    pub async fn ensure_scheduled(&self) -> Result<()> {
        let queued = self
            .actions
            .find_scheduled_by_type(action_types::INBOX_SWEEP)
            .await?;
        if queued.is_empty() {
            self.schedule_next(Utc::now()).await?;
        }
        Ok(())
    }

    async fn schedule_next(&self, run_at: chrono::DateTime<Utc>) -> Result<()> {
        self.actions
            .schedule(&ScheduledAction::system(
                action_types::INBOX_SWEEP,
                run_at,
                serde_json::json!({}),
            ))
            .await
    }
}

#[async_trait]
impl ActionHandler for InboxSweepHandler {
    async fn handle(
        &self,
        _incident_id: Option<IncidentId>,
        _payload: &serde_json::Value,
    ) -> Result<()> {
        let processed = sweep_once(&self.state, self.min_age).await?;
        if processed > 0 {
            info!(processed, "Inbox sweep re-processed events");
        }

        let interval = chrono::Duration::from_std(self.interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        self.schedule_next(Utc::now() + interval).await
    }
}

/// One pass: re-dispatch every unprocessed event older than `min_age`.
pub async fn sweep_once(state: &Arc<AppState>, min_age: Duration) -> Result<usize> {
    let older_than = Utc::now()
        - chrono::Duration::from_std(min_age).unwrap_or_else(|_| chrono::Duration::seconds(60));
    let events = state
        .inbox
        .repository()
        .find_unprocessed(older_than, SWEEP_BATCH)
        .await?;

    let mut processed = 0;
    for event in events {
        match redispatch(state, &event).await {
            Ok(()) => {
                state
                    .inbox
                    .repository()
                    .mark_processed(&event.provider, &event.provider_event_id)
                    .await?;
                processed += 1;
            }
            Err(e) => {
                warn!(
                    provider = %event.provider,
                    event_id = %event.provider_event_id,
                    error = %e,
                    "Sweep redispatch failed, keeping event"
                );
            }
        }
    }

    Ok(processed)
}

async fn redispatch(state: &Arc<AppState>, event: &InboxEvent) -> Result<()> {
    match event.provider.as_str() {
        "telegram" => {
            let update: chat::ChatUpdate = serde_json::from_value(event.payload.clone())?;
            chat::process_update(state.clone(), update).await
        }
        "voice" => {
            let parsed: voice::VoiceEvent = serde_json::from_value(event.payload.clone())?;
            voice::process_event(state.clone(), parsed).await
        }
        other => {
            warn!(provider = other, "Unknown inbox provider, dropping event");
            Ok(())
        }
    }
}
