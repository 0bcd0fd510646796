//! Router assembly and shared handler state.

pub mod admin;
pub mod health;
pub mod metrics;
pub mod webhooks;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use vigil_server_application::commands::CommandDispatcher;
use vigil_server_application::inbox::InboxProcessor;
use vigil_server_application::outbox::OutboxDispatcher;
use vigil_server_application::scheduler::{SchedulerHeartbeat, SchedulerLeadership};
use vigil_server_application::telemetry::Metrics;
use vigil_server_domain::ports::{MigrationControl, StoreHealth};
use vigil_server_domain::users::UserRepository;

pub struct AppState {
    pub dispatcher: Arc<CommandDispatcher>,
    pub inbox: Arc<InboxProcessor>,
    pub outbox: Arc<OutboxDispatcher>,
    pub users: Arc<dyn UserRepository>,
    pub store_health: Arc<dyn StoreHealth>,
    pub migrations: Arc<dyn MigrationControl>,
    pub heartbeat: Arc<SchedulerHeartbeat>,
    /// Readiness only checks the heartbeat on the replica that holds
    /// scheduler leadership; passive replicas stay in rotation.
    pub leadership: Arc<SchedulerLeadership>,
    pub metrics: Arc<Metrics>,
    pub chat_webhook_secret: String,
    pub voice_webhook_secret: String,
    pub admin_key: String,
    pub feature_panic: bool,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health/live", get(health::live))
        .route("/health/ready", get(health::ready))
        .route("/metrics", get(metrics::exposition))
        .route("/webhook/chat", post(webhooks::chat::handle))
        .route("/webhook/voice", post(webhooks::voice::handle))
        .route("/admin/panic/trigger", post(admin::trigger_panic))
        .route("/admin/migrations/apply", post(admin::migrations_apply))
        .route("/admin/migrations/status", get(admin::migrations_status))
        .with_state(state)
}
