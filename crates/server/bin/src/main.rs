//! Vigil server
//!
//! Entry point wiring the Postgres gateway, provider adapters, domain
//! services, the HTTP surface and (behind the leader lock) the scheduler
//! runner.

use std::sync::Arc;
use std::time::Duration;

use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use vigil_server_application::cascade::{
    CallAttemptHandler, CascadeConfig, CascadeEngine, ReminderHandler,
};
use vigil_server_application::commands::{AckReconcileHandler, CommandDispatcher};
use vigil_server_application::inbox::InboxProcessor;
use vigil_server_application::outbox::OutboxDispatcher;
use vigil_server_application::panic::PanicService;
use vigil_server_application::scheduler::{
    SchedulerConfig, SchedulerHeartbeat, SchedulerLeadership, SchedulerRunner,
};
use vigil_server_application::telemetry::Metrics;

use vigil_server_domain::ports::{action_types, HandlerRegistry};

use vigil_server_infrastructure::config::AppConfig;
use vigil_server_infrastructure::persistence::postgres::{
    connect, PostgresAlertRepository, PostgresCallAttemptRepository,
    PostgresGuardianLinkRepository, PostgresInboxRepository, PostgresIncidentRepository,
    PostgresMigrator, PostgresOutboxRepository, PostgresScheduledActionRepository,
    PostgresStoreHealth, PostgresUserRepository, SchedulerLeaderLock,
};
use vigil_server_infrastructure::providers::{TelegramChatPort, TelnyxVoicePort};

use vigil_server_interface::http::{router, AppState};
use vigil_server_interface::sweep::InboxSweepHandler;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = AppConfig::from_env().map_err(|e| anyhow::anyhow!("{}", e))?;
    info!(env = config.app_env.as_str(), "Starting vigil server");

    // Shared Postgres pool + schema.
    let pool = connect(&config.database)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    info!("Connected to database");

    let migrator = Arc::new(PostgresMigrator::new(pool.clone()));
    let applied = migrator
        .run_migrations()
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    if applied.is_empty() {
        info!("Schema up to date");
    } else {
        info!(count = applied.len(), "Applied migrations");
    }

    // Repositories.
    let users = Arc::new(PostgresUserRepository::new(pool.clone()));
    let guardians = Arc::new(PostgresGuardianLinkRepository::new(pool.clone()));
    let incidents = Arc::new(PostgresIncidentRepository::new(pool.clone()));
    let alerts = Arc::new(PostgresAlertRepository::new(pool.clone()));
    let calls = Arc::new(PostgresCallAttemptRepository::new(pool.clone()));
    let inbox_repo = Arc::new(PostgresInboxRepository::new(pool.clone()));
    let outbox_repo = Arc::new(PostgresOutboxRepository::new(pool.clone()));
    let actions = Arc::new(PostgresScheduledActionRepository::new(pool.clone()));
    let store_health = Arc::new(PostgresStoreHealth::new(pool.clone()));

    // Provider adapters share one pooled HTTP client per provider, with a
    // bounded connection count to respect upstream rate limits.
    let http_client = reqwest::Client::builder()
        .pool_max_idle_per_host(8)
        .timeout(Duration::from_secs(15))
        .build()?;
    let chat = Arc::new(TelegramChatPort::new(
        http_client.clone(),
        config.chat_bot_token.clone(),
    ));
    let voice = Arc::new(TelnyxVoicePort::new(
        http_client,
        config.voice_api_key.clone(),
        config.voice_connection_id.clone(),
    ));

    // Services.
    let metrics = Arc::new(Metrics::new()?);
    let outbox = Arc::new(OutboxDispatcher::new(
        outbox_repo.clone(),
        chat.clone(),
        voice.clone(),
        alerts.clone(),
        calls.clone(),
        incidents.clone(),
        metrics.clone(),
    ));
    let panic = Arc::new(PanicService::new(
        incidents.clone(),
        users.clone(),
        alerts.clone(),
        voice.clone(),
        outbox.clone(),
        metrics.clone(),
    ));
    let cascade = Arc::new(CascadeEngine::new(
        incidents.clone(),
        users.clone(),
        guardians.clone(),
        alerts.clone(),
        calls.clone(),
        actions.clone(),
        outbox.clone(),
        CascadeConfig {
            defaults: config.cascade_defaults,
            public_base_url: config.public_base_url.clone(),
            whitelist_only: config.feature_allow_only_whitelist,
            allowed_numbers: config.allowed_e164_numbers.clone(),
            call_max_duration_secs: config.call_max_duration_secs,
        },
    ));
    let dispatcher = Arc::new(CommandDispatcher::new(
        panic.clone(),
        cascade.clone(),
        users.clone(),
        alerts.clone(),
        calls.clone(),
        actions.clone(),
        chat.clone(),
    ));
    let inbox = Arc::new(InboxProcessor::new(inbox_repo.clone(), metrics.clone()));
    let heartbeat = SchedulerHeartbeat::new();
    let leadership = SchedulerLeadership::new();

    // HTTP surface.
    let state = Arc::new(AppState {
        dispatcher,
        inbox,
        outbox: outbox.clone(),
        users,
        store_health,
        migrations: migrator,
        heartbeat: heartbeat.clone(),
        leadership: leadership.clone(),
        metrics: metrics.clone(),
        chat_webhook_secret: config.chat_webhook_secret.clone(),
        voice_webhook_secret: config.voice_webhook_secret.clone(),
        admin_key: config.admin_key.clone(),
        feature_panic: config.feature_panic,
    });

    // Scheduler runner, singleton behind the leader lock. The inbox sweep
    // runs as a recurring system action on the same runner, so only the
    // leader ever redispatches stuck events.
    if config.scheduler_enabled {
        let sweep_handler = Arc::new(InboxSweepHandler::new(
            state.clone(),
            actions.clone(),
            Duration::from_secs(60),
            Duration::from_secs(120),
        ));

        let mut registry = HandlerRegistry::new();
        registry.register(
            action_types::CALL_ATTEMPT,
            Arc::new(CallAttemptHandler::new(cascade.clone())),
        );
        registry.register(
            action_types::PANIC_REMINDER,
            Arc::new(ReminderHandler::new(cascade.clone())),
        );
        registry.register(
            action_types::ACK_RECONCILE,
            Arc::new(AckReconcileHandler::new(panic.clone(), incidents.clone())),
        );
        registry.register(action_types::INBOX_SWEEP, sweep_handler.clone());

        let runner = SchedulerRunner::new(
            actions.clone(),
            Arc::new(registry),
            outbox.clone(),
            heartbeat.clone(),
            metrics.clone(),
            SchedulerConfig {
                poll_interval: config.scheduler_poll_interval,
                ..SchedulerConfig::default()
            },
        );

        let leader_pool = pool.clone();
        tokio::spawn(async move {
            // Replicas without the lock stay passive and re-try; the lock
            // frees when the leader's connection dies.
            loop {
                match SchedulerLeaderLock::try_acquire(&leader_pool).await {
                    Ok(Some(_lock)) => {
                        leadership.mark_leader();
                        if let Err(e) = sweep_handler.ensure_scheduled().await {
                            warn!(error = %e, "Failed to seed the inbox sweep");
                        }
                        runner.run().await;
                        break;
                    }
                    Ok(None) => {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "Leader lock acquisition failed");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });
        info!("Scheduler enabled, contending for leadership");
    } else {
        info!("Scheduler disabled (SCHEDULER_ENABLED != true)");
    }

    let app = router(state).layer(TraceLayer::new_for_http());
    let addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}
