//! HTTP surface tests over in-memory adapters.

use std::sync::Arc;

use axum_test::TestServer;
use serde_json::json;

use vigil_server_application::cascade::{CascadeConfig, CascadeEngine};
use vigil_server_application::commands::CommandDispatcher;
use vigil_server_application::inbox::InboxProcessor;
use vigil_server_application::outbox::OutboxDispatcher;
use vigil_server_application::panic::PanicService;
use vigil_server_application::scheduler::{SchedulerHeartbeat, SchedulerLeadership};
use vigil_server_application::telemetry::Metrics;

use vigil_server_domain::guardians::{CascadeDefaults, GuardianLink};
use vigil_server_domain::incidents::{IncidentRepository, IncidentStatus};
use vigil_server_domain::ports::{
    action_types, ActionHandler, MigrationControl, MigrationStatus, ScheduledActionRepository,
};
use vigil_server_domain::shared_kernel::Result;
use vigil_server_domain::users::{User, UserRepository};

use vigil_server_interface::auth::sign_voice_payload;
use vigil_server_interface::http::{router, AppState};
use vigil_server_interface::sweep::InboxSweepHandler;

use vigil_testing::{MemoryStore, MockChatPort, MockVoicePort};

const CHAT_SECRET: &str = "chat-webhook-secret";
const VOICE_SECRET: &str = "voice-webhook-secret";
const ADMIN_KEY: &str = "admin-key";

struct NoopMigrations;

#[async_trait::async_trait]
impl MigrationControl for NoopMigrations {
    async fn apply(&self) -> Result<Vec<String>> {
        Ok(vec!["0001_users".to_string()])
    }

    async fn status(&self) -> Result<MigrationStatus> {
        Ok(MigrationStatus {
            applied: vec!["0001_users".to_string()],
            pending: vec![],
        })
    }
}

struct TestApp {
    server: TestServer,
    state: Arc<AppState>,
    store: MemoryStore,
    chat: Arc<MockChatPort>,
    metrics: Arc<Metrics>,
    heartbeat: Arc<SchedulerHeartbeat>,
}

fn test_app(leader: bool) -> TestApp {
    let store = MemoryStore::new();
    let chat = MockChatPort::new();
    let voice = MockVoicePort::new();
    let metrics = Arc::new(Metrics::new().unwrap());

    let outbox = Arc::new(OutboxDispatcher::new(
        Arc::new(store.clone()),
        chat.clone(),
        voice.clone(),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        metrics.clone(),
    ));
    let panic = Arc::new(PanicService::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        voice.clone(),
        outbox.clone(),
        metrics.clone(),
    ));
    let cascade = Arc::new(CascadeEngine::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        outbox.clone(),
        CascadeConfig {
            defaults: CascadeDefaults::default(),
            public_base_url: "http://localhost:8000".to_string(),
            whitelist_only: false,
            allowed_numbers: vec![],
            call_max_duration_secs: 90,
        },
    ));
    let dispatcher = Arc::new(CommandDispatcher::new(
        panic,
        cascade,
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        chat.clone(),
    ));
    let inbox = Arc::new(InboxProcessor::new(Arc::new(store.clone()), metrics.clone()));
    let heartbeat = SchedulerHeartbeat::new();
    let leadership = SchedulerLeadership::new();
    if leader {
        leadership.mark_leader();
    }

    let state = Arc::new(AppState {
        dispatcher,
        inbox,
        outbox,
        users: Arc::new(store.clone()),
        store_health: Arc::new(store.clone()),
        migrations: Arc::new(NoopMigrations),
        heartbeat: heartbeat.clone(),
        leadership,
        metrics: metrics.clone(),
        chat_webhook_secret: CHAT_SECRET.to_string(),
        voice_webhook_secret: VOICE_SECRET.to_string(),
        admin_key: ADMIN_KEY.to_string(),
        feature_panic: true,
    });

    let server = TestServer::new(router(state.clone())).unwrap();
    TestApp {
        server,
        state,
        store,
        chat,
        metrics,
        heartbeat,
    }
}

async fn seed_traveler_with_guardian(store: &MemoryStore) -> (User, User) {
    let traveler = User::new("100", "Мария");
    let guardian = User::new("200", "Иван");
    UserRepository::insert(store, &traveler).await.unwrap();
    UserRepository::insert(store, &guardian).await.unwrap();

    let link = GuardianLink::new(
        traveler.id,
        guardian.id,
        1,
        &CascadeDefaults::default(),
    );
    vigil_server_domain::guardians::GuardianLinkRepository::insert(store, &link)
        .await
        .unwrap();
    (traveler, guardian)
}

#[tokio::test]
async fn liveness_always_answers() {
    let app = test_app(false);
    let response = app.server.get("/health/live").await;
    response.assert_status_ok();
    assert_eq!(response.json::<serde_json::Value>()["status"], "alive");
}

#[tokio::test]
async fn readiness_checks_the_heartbeat_only_on_the_leader() {
    // The leader with a stale heartbeat is pulled from rotation.
    let app = test_app(true);
    let response = app.server.get("/health/ready").await;
    assert_eq!(response.status_code().as_u16(), 503);

    // A beating leader is ready.
    app.heartbeat.beat();
    let response = app.server.get("/health/ready").await;
    response.assert_status_ok();

    // A passive replica never beats and is ready anyway.
    let app = test_app(false);
    let response = app.server.get("/health/ready").await;
    response.assert_status_ok();
}

#[tokio::test]
async fn metrics_expose_prometheus_text() {
    let app = test_app(false);
    app.metrics.panic_incidents_started.inc();

    let response = app.server.get("/metrics").await;
    response.assert_status_ok();
    let body = response.text();
    assert!(body.contains("vigil_panic_incidents_started_total"));
    assert!(body.contains("# HELP"));
}

#[tokio::test]
async fn chat_webhook_rejects_bad_secret() {
    let app = test_app(false);

    let response = app
        .server
        .post("/webhook/chat")
        .json(&json!({ "update_id": 1 }))
        .await;
    assert_eq!(response.status_code().as_u16(), 401);

    let response = app
        .server
        .post("/webhook/chat")
        .add_header("x-telegram-bot-api-secret-token", "wrong")
        .json(&json!({ "update_id": 1 }))
        .await;
    assert_eq!(response.status_code().as_u16(), 401);
}

#[tokio::test]
async fn chat_webhook_rejects_malformed_payload() {
    let app = test_app(false);

    let response = app
        .server
        .post("/webhook/chat")
        .add_header("x-telegram-bot-api-secret-token", CHAT_SECRET)
        .text("not json at all")
        .await;
    assert_eq!(response.status_code().as_u16(), 400);
}

#[tokio::test]
async fn panic_command_opens_an_incident() {
    let app = test_app(false);
    let (traveler, _) = seed_traveler_with_guardian(&app.store).await;

    let update = json!({
        "update_id": 7,
        "message": {
            "message_id": 1,
            "from": { "id": 100, "first_name": "Мария" },
            "chat": { "id": 100 },
            "text": "/panic"
        }
    });

    let response = app
        .server
        .post("/webhook/chat")
        .add_header("x-telegram-bot-api-secret-token", CHAT_SECRET)
        .json(&update)
        .await;
    response.assert_status_ok();

    let incident = IncidentRepository::find_open_for_traveler(&app.store, traveler.id)
        .await
        .unwrap()
        .expect("incident opened");
    assert_eq!(incident.status, IncidentStatus::Open);

    // Guardian alert went out with the responsibility button.
    let sent = app.chat.sent.lock();
    assert!(sent
        .iter()
        .any(|m| m.chat_id == "200" && !m.buttons.is_empty()));
}

#[tokio::test]
async fn ack_callback_closes_the_loop() {
    let app = test_app(false);
    let (traveler, guardian) = seed_traveler_with_guardian(&app.store).await;

    let trigger = json!({
        "update_id": 1,
        "message": {
            "message_id": 1,
            "from": { "id": 100, "first_name": "Мария" },
            "chat": { "id": 100 },
            "text": "/panic"
        }
    });
    app.server
        .post("/webhook/chat")
        .add_header("x-telegram-bot-api-secret-token", CHAT_SECRET)
        .json(&trigger)
        .await
        .assert_status_ok();

    let incident = IncidentRepository::find_open_for_traveler(&app.store, traveler.id)
        .await
        .unwrap()
        .unwrap();

    let callback = json!({
        "update_id": 2,
        "callback_query": {
            "id": "cb1",
            "from": { "id": 200, "first_name": "Иван" },
            "data": format!("v1|ack|{}", incident.id),
        }
    });
    app.server
        .post("/webhook/chat")
        .add_header("x-telegram-bot-api-secret-token", CHAT_SECRET)
        .json(&callback)
        .await
        .assert_status_ok();

    let incident = IncidentRepository::find_by_id(&app.store, incident.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(incident.status, IncidentStatus::Acknowledged);
    assert_eq!(incident.acknowledged_by_user_id, Some(guardian.id));
}

#[tokio::test]
async fn duplicate_updates_only_count() {
    let app = test_app(false);
    seed_traveler_with_guardian(&app.store).await;

    let update = json!({
        "update_id": 5,
        "message": {
            "message_id": 1,
            "from": { "id": 100, "first_name": "Мария" },
            "chat": { "id": 100 },
            "text": "/ping"
        }
    });

    for _ in 0..3 {
        app.server
            .post("/webhook/chat")
            .add_header("x-telegram-bot-api-secret-token", CHAT_SECRET)
            .json(&update)
            .await
            .assert_status_ok();
    }

    assert_eq!(
        app.metrics
            .webhook_duplicates
            .with_label_values(&["telegram"])
            .get(),
        2
    );
    // One pong, not three.
    assert_eq!(app.chat.sent_count(), 1);
}

#[tokio::test]
async fn shared_contacts_store_normalized_phones() {
    let app = test_app(false);
    let (_, guardian) = seed_traveler_with_guardian(&app.store).await;

    let update = json!({
        "update_id": 9,
        "message": {
            "message_id": 3,
            "from": { "id": 200, "first_name": "Иван" },
            "chat": { "id": 200 },
            "contact": { "phone_number": "+34 600 111 222", "first_name": "Иван" }
        }
    });
    app.server
        .post("/webhook/chat")
        .add_header("x-telegram-bot-api-secret-token", CHAT_SECRET)
        .json(&update)
        .await
        .assert_status_ok();

    let stored = UserRepository::find_by_id(&app.store, guardian.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.phone_e164.as_deref(), Some("+34600111222"));

    // A bogus number is rejected at the edge, not stored.
    let update = json!({
        "update_id": 10,
        "message": {
            "message_id": 4,
            "from": { "id": 100, "first_name": "Мария" },
            "chat": { "id": 100 },
            "contact": { "phone_number": "12", "first_name": "Мария" }
        }
    });
    app.server
        .post("/webhook/chat")
        .add_header("x-telegram-bot-api-secret-token", CHAT_SECRET)
        .json(&update)
        .await
        .assert_status_ok();

    let travelers = UserRepository::find_by_chat_user_id(&app.store, "100")
        .await
        .unwrap()
        .unwrap();
    assert!(travelers.phone_e164.is_none());
}

#[tokio::test]
async fn voice_webhook_requires_valid_signature() {
    let app = test_app(false);
    let body = json!({
        "data": {
            "event_type": "call.answered",
            "id": "evt_1",
            "payload": { "call_control_id": "cc_1" }
        }
    })
    .to_string();

    let response = app.server.post("/webhook/voice").text(body.clone()).await;
    assert_eq!(response.status_code().as_u16(), 401);

    let response = app
        .server
        .post("/webhook/voice")
        .add_header("x-webhook-timestamp", "1700000000")
        .add_header("x-webhook-signature", "deadbeef")
        .text(body)
        .await;
    assert_eq!(response.status_code().as_u16(), 401);
}

#[tokio::test]
async fn signed_voice_events_are_accepted() {
    let app = test_app(false);
    let body = json!({
        "data": {
            "event_type": "call.playback.started",
            "id": "evt_2",
            "payload": { "call_control_id": "cc_1" }
        }
    })
    .to_string();

    let timestamp = "1700000000";
    let signature = sign_voice_payload(VOICE_SECRET, timestamp, body.as_bytes());

    let response = app
        .server
        .post("/webhook/voice")
        .add_header("x-webhook-timestamp", timestamp)
        .add_header("x-webhook-signature", signature)
        .text(body)
        .await;
    response.assert_status_ok();
}

// A recorded-but-unprocessed event (crash between record and commit) is
// re-dispatched by the sweep action, which keeps its chain to one row.
#[tokio::test]
async fn inbox_sweep_redispatches_stuck_events() {
    let app = test_app(true);
    let (traveler, guardian) = seed_traveler_with_guardian(&app.store).await;

    let (incident, _) = app
        .state
        .dispatcher
        .trigger_panic(traveler.id)
        .await
        .unwrap();

    // The ack callback lands in the inbox but its handler never ran.
    let payload = json!({
        "update_id": 77,
        "callback_query": {
            "id": "cb77",
            "from": { "id": 200, "first_name": "Иван" },
            "data": format!("v1|ack|{}", incident.id),
        }
    });
    app.state
        .inbox
        .repository()
        .record("telegram", "77", &payload)
        .await
        .unwrap();

    let handler = InboxSweepHandler::new(
        app.state.clone(),
        Arc::new(app.store.clone()),
        std::time::Duration::from_secs(60),
        std::time::Duration::from_secs(0),
    );

    // Seeding twice forks no second chain.
    handler.ensure_scheduled().await.unwrap();
    handler.ensure_scheduled().await.unwrap();
    assert_eq!(
        app.store
            .find_scheduled_by_type(action_types::INBOX_SWEEP)
            .await
            .unwrap()
            .len(),
        1
    );

    // The runner claims the round, the handler sweeps and queues the next.
    let claimed = app
        .store
        .claim_due(chrono::Utc::now(), 10)
        .await
        .unwrap();
    assert!(claimed
        .iter()
        .any(|a| a.action_type == action_types::INBOX_SWEEP));
    handler.handle(None, &json!({})).await.unwrap();

    let incident = IncidentRepository::find_by_id(&app.store, incident.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(incident.status, IncidentStatus::Acknowledged);
    assert_eq!(incident.acknowledged_by_user_id, Some(guardian.id));

    assert_eq!(
        app.store
            .find_scheduled_by_type(action_types::INBOX_SWEEP)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn admin_trigger_requires_key_and_known_traveler() {
    let app = test_app(false);
    let (traveler, _) = seed_traveler_with_guardian(&app.store).await;

    let response = app
        .server
        .post("/admin/panic/trigger")
        .json(&json!({ "traveler_id": traveler.id.0 }))
        .await;
    assert_eq!(response.status_code().as_u16(), 401);

    let response = app
        .server
        .post("/admin/panic/trigger")
        .add_header("x-admin-key", ADMIN_KEY)
        .json(&json!({ "traveler_id": uuid::Uuid::new_v4() }))
        .await;
    assert_eq!(response.status_code().as_u16(), 404);

    let response = app
        .server
        .post("/admin/panic/trigger")
        .add_header("x-admin-key", ADMIN_KEY)
        .json(&json!({ "traveler_id": traveler.id.0 }))
        .await;
    response.assert_status_ok();
    let body = response.json::<serde_json::Value>();
    assert!(body["incident_id"].is_string());
    assert_eq!(body["created"], true);
}

#[tokio::test]
async fn admin_migrations_report_status() {
    let app = test_app(false);

    let response = app.server.get("/admin/migrations/status").await;
    assert_eq!(response.status_code().as_u16(), 401);

    let response = app
        .server
        .get("/admin/migrations/status")
        .add_header("x-admin-key", ADMIN_KEY)
        .await;
    response.assert_status_ok();
    let body = response.json::<serde_json::Value>();
    assert_eq!(body["applied"][0], "0001_users");
}
