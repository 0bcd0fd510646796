//! End-to-end cascade scenarios over the in-memory adapters.

use std::sync::Arc;

use chrono::{Duration, Utc};

use vigil_server_application::cascade::{
    CallAttemptHandler, CascadeConfig, CascadeEngine, ReminderHandler,
};
use vigil_server_application::commands::{AckReconcileHandler, CommandDispatcher};
use vigil_server_application::inbox::InboxProcessor;
use vigil_server_application::outbox::OutboxDispatcher;
use vigil_server_application::panic::PanicService;
use vigil_server_application::scheduler::{SchedulerConfig, SchedulerHeartbeat, SchedulerRunner};
use vigil_server_application::telemetry::Metrics;

use vigil_server_domain::alerts::{AlertStatus, CallResult};
use vigil_server_domain::commands::InboundCommand;
use vigil_server_domain::events::{ChatDelivery, OutboxDraft};
use vigil_server_domain::guardians::{CascadeDefaults, GuardianLink};
use vigil_server_domain::incidents::{AckChannel, Incident, IncidentStatus, TerminalOutcome};
use vigil_server_domain::ports::{
    action_types, ActionState, HandlerRegistry, InboxOutcome, ScheduledActionRepository,
};
use vigil_server_domain::shared_kernel::{Channel, DomainError, UserId};
use vigil_server_domain::users::{User, UserRepository};

use vigil_testing::{MemoryStore, MockChatPort, MockVoicePort};

struct Harness {
    store: MemoryStore,
    chat: Arc<MockChatPort>,
    voice: Arc<MockVoicePort>,
    panic: Arc<PanicService>,
    dispatcher: Arc<CommandDispatcher>,
    outbox: Arc<OutboxDispatcher>,
    inbox: Arc<InboxProcessor>,
    runner: SchedulerRunner,
    metrics: Arc<Metrics>,
}

fn harness() -> Harness {
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
        panic.clone(),
        cascade.clone(),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        chat.clone(),
    ));
    let inbox = Arc::new(InboxProcessor::new(Arc::new(store.clone()), metrics.clone()));

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
        Arc::new(AckReconcileHandler::new(
            panic.clone(),
            Arc::new(store.clone()),
        )),
    );

    let runner = SchedulerRunner::new(
        Arc::new(store.clone()),
        Arc::new(registry),
        outbox.clone(),
        SchedulerHeartbeat::new(),
        metrics.clone(),
        SchedulerConfig::default(),
    );

    Harness {
        store,
        chat,
        voice,
        panic,
        dispatcher,
        outbox,
        inbox,
        runner,
        metrics,
    }
}

async fn add_user(store: &MemoryStore, chat_id: &str, name: &str, phone: Option<&str>) -> User {
    let mut user = User::new(chat_id, name);
    if let Some(phone) = phone {
        user = user.with_phone(phone);
    }
    UserRepository::insert(store, &user).await.unwrap();
    user
}

async fn add_link(
    store: &MemoryStore,
    traveler: UserId,
    watcher: UserId,
    rank: u32,
    chat_enabled: bool,
    call_enabled: bool,
) -> GuardianLink {
    let mut link = GuardianLink::new(traveler, watcher, rank, &CascadeDefaults::default());
    link.chat_enabled = chat_enabled;
    link.call_enabled = call_enabled;
    vigil_server_domain::guardians::GuardianLinkRepository::insert(store, &link)
        .await
        .unwrap();
    link
}

/// Pull still-scheduled actions of one type into the due window so
/// `run_once` picks them up without sleeping through jitter or backoff.
async fn make_due(store: &MemoryStore, action_type: &str) {
    let past = Utc::now() - Duration::seconds(1);
    for action in store.action_rows() {
        if action.state == ActionState::Scheduled && action.action_type == action_type {
            store.reschedule(action.id, past, "forced due").await.unwrap();
        }
    }
}

async fn incident_by_id(store: &MemoryStore, incident: &Incident) -> Incident {
    vigil_server_domain::incidents::IncidentRepository::find_by_id(store, incident.id)
        .await
        .unwrap()
        .unwrap()
}

// S1: happy path, chat acknowledgment.
#[tokio::test]
async fn chat_ack_stops_the_cascade_and_notifies_everyone() {
    let h = harness();
    let traveler = add_user(&h.store, "100", "Мария", None).await;
    let g1 = add_user(&h.store, "200", "Иван", Some("+34600111222")).await;
    let g2 = add_user(&h.store, "300", "Анна", None).await;
    add_link(&h.store, traveler.id, g1.id, 1, true, true).await;
    add_link(&h.store, traveler.id, g2.id, 2, true, false).await;

    let (incident, created) = h.dispatcher.trigger_panic(traveler.id).await.unwrap();
    assert!(created);
    assert_eq!(incident.status, IncidentStatus::Open);

    // Traveler confirmation plus two guardian alerts.
    assert_eq!(h.chat.sent_count(), 3);
    let alerts = h.store.alert_rows();
    assert_eq!(alerts.len(), 3); // chat G1, chat G2, voice G1
    assert_eq!(
        alerts.iter().filter(|a| a.channel == Channel::Chat).count(),
        2
    );

    // First call attempt goes out.
    make_due(&h.store, action_types::CALL_ATTEMPT).await;
    h.runner.run_once().await.unwrap();
    assert_eq!(h.voice.placed_count(), 1);
    let placed_call_id = h.voice.placed.lock()[0].provider_call_id.clone();

    // G1 presses the responsibility button.
    h.dispatcher
        .dispatch(InboundCommand::ChatAck {
            incident_id: incident.id,
            chat_user_id: g1.chat_user_id.clone(),
            callback_id: "cb1".to_string(),
        })
        .await
        .unwrap();

    let incident = incident_by_id(&h.store, &incident).await;
    assert_eq!(incident.status, IncidentStatus::Acknowledged);
    assert_eq!(incident.acknowledged_by_user_id, Some(g1.id));
    assert_eq!(incident.ack_channel, Some(AckChannel::ChatButton));

    // P4: nothing left scheduled for a terminal incident.
    assert_eq!(h.store.count_scheduled(incident.id).await.unwrap(), 0);

    // The in-flight call is hung up and both guardians see the edit.
    assert!(h.voice.hangups.lock().contains(&placed_call_id));
    let edits = h.chat.edits.lock();
    assert_eq!(edits.len(), 2);
    assert!(edits.iter().all(|e| e.text.contains("Иван")));

    // Traveler is told who took responsibility.
    let sent = h.chat.sent.lock();
    assert!(sent
        .iter()
        .any(|m| m.chat_id == traveler.chat_user_id && m.text.contains("Иван")));
}

// S2: DTMF acknowledgment on the second attempt, backoff measured from
// the first attempt's end.
#[tokio::test]
async fn dtmf_ack_after_no_answer_retry() {
    let h = harness();
    let traveler = add_user(&h.store, "100", "Мария", None).await;
    let g1 = add_user(&h.store, "200", "Иван", Some("+34600111222")).await;
    add_link(&h.store, traveler.id, g1.id, 1, false, true).await;

    let (incident, _) = h.dispatcher.trigger_panic(traveler.id).await.unwrap();

    make_due(&h.store, action_types::CALL_ATTEMPT).await;
    h.runner.run_once().await.unwrap();
    assert_eq!(h.voice.placed_count(), 1);
    let call1 = h.voice.placed.lock()[0].provider_call_id.clone();

    // Attempt 1 rings out.
    h.dispatcher
        .dispatch(InboundCommand::VoiceHangup {
            provider_call_id: call1,
            cause: "no_answer".to_string(),
        })
        .await
        .unwrap();

    let attempt1 = h
        .store
        .attempt_rows()
        .into_iter()
        .find(|a| a.attempt_no == 1)
        .unwrap();
    assert_eq!(attempt1.result, CallResult::NoAnswer);

    // Attempt 2 is scheduled at attempt 1's end + the guardian backoff,
    // not at "now + backoff" of whoever processes it.
    let retry = h
        .store
        .action_rows()
        .into_iter()
        .find(|a| {
            a.action_type == action_types::CALL_ATTEMPT && a.state == ActionState::Scheduled
        })
        .expect("retry scheduled");
    let ended = attempt1.ended_at.unwrap();
    assert_eq!((retry.run_at - ended).num_seconds(), 60);

    make_due(&h.store, action_types::CALL_ATTEMPT).await;
    h.runner.run_once().await.unwrap();
    assert_eq!(h.voice.placed_count(), 2);
    let call2 = h.voice.placed.lock()[1].provider_call_id.clone();

    // Guardian answers and presses "1".
    h.dispatcher
        .dispatch(InboundCommand::VoiceAnswered {
            provider_call_id: call2.clone(),
        })
        .await
        .unwrap();
    h.dispatcher
        .dispatch(InboundCommand::VoiceDigit {
            provider_call_id: call2,
            digit: '1',
        })
        .await
        .unwrap();

    let incident = incident_by_id(&h.store, &incident).await;
    assert_eq!(incident.status, IncidentStatus::Acknowledged);
    assert_eq!(incident.ack_channel, Some(AckChannel::Dtmf));
    assert_eq!(incident.acknowledged_by_user_id, Some(g1.id));

    // Attempt 3 never exists; nothing left scheduled.
    assert_eq!(h.store.attempt_rows().len(), 2);
    assert_eq!(h.store.count_scheduled(incident.id).await.unwrap(), 0);
}

// S3: the provider redelivers the same ack callback three times.
#[tokio::test]
async fn duplicate_webhook_deliveries_collapse() {
    let h = harness();
    let traveler = add_user(&h.store, "100", "Мария", None).await;
    let g1 = add_user(&h.store, "200", "Иван", None).await;
    add_link(&h.store, traveler.id, g1.id, 1, true, false).await;

    let (incident, _) = h.dispatcher.trigger_panic(traveler.id).await.unwrap();

    let payload = serde_json::json!({ "update_id": 42 });
    let mut outcomes = Vec::new();
    for _ in 0..3 {
        let dispatcher = h.dispatcher.clone();
        let incident_id = incident.id;
        let chat_user_id = g1.chat_user_id.clone();
        let outcome = h
            .inbox
            .process("telegram", "42", &payload, || async move {
                dispatcher
                    .dispatch(InboundCommand::ChatAck {
                        incident_id,
                        chat_user_id,
                        callback_id: "cb".to_string(),
                    })
                    .await
            })
            .await
            .unwrap();
        outcomes.push(outcome);
    }

    assert_eq!(
        outcomes,
        vec![
            InboxOutcome::Fresh,
            InboxOutcome::Duplicate,
            InboxOutcome::Duplicate
        ]
    );
    assert_eq!(
        h.metrics
            .webhook_duplicates
            .with_label_values(&["telegram"])
            .get(),
        2
    );

    // Exactly one transition, exactly one traveler notification row.
    let incident = incident_by_id(&h.store, &incident).await;
    assert_eq!(incident.status, IncidentStatus::Acknowledged);
    let ack_rows: Vec<_> = h
        .store
        .outbox_rows()
        .into_iter()
        .filter(|m| m.idempotency_key.ends_with(":traveler:acknowledged"))
        .collect();
    assert_eq!(ack_rows.len(), 1);
}

// S4: traveler cancels while two calls are in flight.
#[tokio::test]
async fn traveler_cancel_hangs_up_everyone() {
    let h = harness();
    let traveler = add_user(&h.store, "100", "Мария", None).await;
    let g1 = add_user(&h.store, "200", "Иван", Some("+34600111222")).await;
    let g2 = add_user(&h.store, "300", "Анна", Some("+34600333444")).await;
    add_link(&h.store, traveler.id, g1.id, 1, true, true).await;
    add_link(&h.store, traveler.id, g2.id, 2, true, true).await;

    let (incident, _) = h.dispatcher.trigger_panic(traveler.id).await.unwrap();

    make_due(&h.store, action_types::CALL_ATTEMPT).await;
    h.runner.run_once().await.unwrap();
    assert_eq!(h.voice.placed_count(), 2);

    h.dispatcher
        .dispatch(InboundCommand::ChatCancel {
            incident_id: incident.id,
            chat_user_id: traveler.chat_user_id.clone(),
            callback_id: "cb".to_string(),
        })
        .await
        .unwrap();

    let incident = incident_by_id(&h.store, &incident).await;
    assert_eq!(incident.status, IncidentStatus::Canceled);
    assert!(incident.canceled_at.is_some());

    assert_eq!(h.voice.hangups.lock().len(), 2);
    assert_eq!(h.store.count_scheduled(incident.id).await.unwrap(), 0);

    // Both guardians get the "canceled by traveler" edit.
    let edits = h.chat.edits.lock();
    assert_eq!(edits.len(), 2);
    assert!(edits.iter().all(|e| e.text.contains("Мария")));

    // Nothing further fires.
    drop(edits);
    make_due(&h.store, action_types::CALL_ATTEMPT).await;
    h.runner.run_once().await.unwrap();
    assert_eq!(h.voice.placed_count(), 2);
}

// A guardian pressing the traveler's cancel button is rejected.
#[tokio::test]
async fn only_the_traveler_may_cancel() {
    let h = harness();
    let traveler = add_user(&h.store, "100", "Мария", None).await;
    let g1 = add_user(&h.store, "200", "Иван", None).await;
    add_link(&h.store, traveler.id, g1.id, 1, true, false).await;

    let (incident, _) = h.dispatcher.trigger_panic(traveler.id).await.unwrap();

    let err = h.panic.cancel(incident.id, g1.id, false).await.unwrap_err();
    assert!(matches!(err, DomainError::Unauthorized { .. }));

    // Through the dispatcher the rejection is swallowed per webhook policy.
    h.dispatcher
        .dispatch(InboundCommand::ChatCancel {
            incident_id: incident.id,
            chat_user_id: g1.chat_user_id.clone(),
            callback_id: "cb".to_string(),
        })
        .await
        .unwrap();

    let incident = incident_by_id(&h.store, &incident).await;
    assert_eq!(incident.status, IncidentStatus::Open);
}

// S6: chat button and DTMF race; first writer wins, loser is a no-op.
#[tokio::test]
async fn concurrent_acknowledgments_serialize() {
    let h = harness();
    let traveler = add_user(&h.store, "100", "Мария", None).await;
    let g1 = add_user(&h.store, "200", "Иван", None).await;
    let g2 = add_user(&h.store, "300", "Анна", None).await;
    add_link(&h.store, traveler.id, g1.id, 1, true, false).await;
    add_link(&h.store, traveler.id, g2.id, 2, true, false).await;

    let (incident, _) = h.dispatcher.trigger_panic(traveler.id).await.unwrap();

    let (first, second) = tokio::join!(
        h.panic
            .acknowledge(incident.id, g1.id, AckChannel::ChatButton),
        h.panic.acknowledge(incident.id, g2.id, AckChannel::Dtmf),
    );
    let first = first.unwrap();
    let second = second.unwrap();

    assert_eq!(
        [first.applied(), second.applied()]
            .iter()
            .filter(|a| **a)
            .count(),
        1
    );

    let incident = incident_by_id(&h.store, &incident).await;
    assert_eq!(incident.status, IncidentStatus::Acknowledged);

    let winner = if first.applied() { g1.id } else { g2.id };
    assert_eq!(incident.acknowledged_by_user_id, Some(winner));

    // The losing outcome reports the stored decision, unchanged.
    let loser = if first.applied() { second } else { first };
    assert_eq!(
        loser.incident().acknowledged_by_user_id,
        Some(winner)
    );
}

// L1: acknowledge is idempotent.
#[tokio::test]
async fn second_acknowledge_returns_first_decision() {
    let h = harness();
    let traveler = add_user(&h.store, "100", "Мария", None).await;
    let g1 = add_user(&h.store, "200", "Иван", None).await;
    let g2 = add_user(&h.store, "300", "Анна", None).await;
    add_link(&h.store, traveler.id, g1.id, 1, true, false).await;
    add_link(&h.store, traveler.id, g2.id, 2, true, false).await;

    let (incident, _) = h.dispatcher.trigger_panic(traveler.id).await.unwrap();

    let first = h
        .panic
        .acknowledge(incident.id, g1.id, AckChannel::ChatButton)
        .await
        .unwrap();
    assert!(first.applied());

    let sends_after_first = h.chat.sent_count();

    let second = h
        .panic
        .acknowledge(incident.id, g2.id, AckChannel::Dtmf)
        .await
        .unwrap();
    assert!(matches!(second, TerminalOutcome::AlreadyTerminal { .. }));
    assert_eq!(second.incident().acknowledged_by_user_id, Some(g1.id));

    // No new provider traffic from the no-op.
    assert_eq!(h.chat.sent_count(), sends_after_first);
}

// L3: outbox first write wins; one provider call per key.
#[tokio::test]
async fn outbox_key_collapses_to_one_send() {
    let h = harness();

    let first = OutboxDraft::chat(
        "chat:test:alert".to_string(),
        &ChatDelivery::Send {
            chat_id: "100".to_string(),
            text: "первый".to_string(),
            buttons: vec![],
            alert_id: None,
        },
    )
    .unwrap();
    let second = OutboxDraft::chat(
        "chat:test:alert".to_string(),
        &ChatDelivery::Send {
            chat_id: "100".to_string(),
            text: "второй".to_string(),
            buttons: vec![],
            alert_id: None,
        },
    )
    .unwrap();

    let d1 = h.outbox.send(first).await.unwrap();
    let d2 = h.outbox.send(second).await.unwrap();

    assert!(!d1.already_sent);
    assert!(d2.already_sent);
    assert_eq!(d1.provider_message_id, d2.provider_message_id);

    let sent = h.chat.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].text, "первый");
}

// Transient provider failure: the row stays in the outbox and the sweep
// delivers it exactly once when the provider recovers.
#[tokio::test]
async fn failed_sends_are_retried_not_duplicated() {
    let h = harness();
    h.chat.fail_sends(true);

    let draft = OutboxDraft::chat(
        "chat:test:retry".to_string(),
        &ChatDelivery::Send {
            chat_id: "100".to_string(),
            text: "привет".to_string(),
            buttons: vec![],
            alert_id: None,
        },
    )
    .unwrap();

    assert!(h.outbox.send(draft).await.is_err());
    assert_eq!(h.chat.sent_count(), 0);

    h.chat.fail_sends(false);
    let delivered = h.outbox.flush_undelivered(16).await.unwrap();
    assert_eq!(delivered, 1);
    assert_eq!(h.chat.sent_count(), 1);

    // Another flush finds nothing to do.
    let delivered = h.outbox.flush_undelivered(16).await.unwrap();
    assert_eq!(delivered, 0);
    assert_eq!(h.chat.sent_count(), 1);
}

// Voice exhaustion: retries spent on every guardian, traveler told.
#[tokio::test]
async fn exhausted_cascade_notifies_the_traveler() {
    let h = harness();
    let traveler = add_user(&h.store, "100", "Мария", None).await;
    let g1 = add_user(&h.store, "200", "Иван", Some("+34600111222")).await;
    add_link(&h.store, traveler.id, g1.id, 1, false, true).await;

    let (incident, _) = h.dispatcher.trigger_panic(traveler.id).await.unwrap();

    // Default max_retries is 2: two attempts, both ringing out.
    for _ in 0..2 {
        make_due(&h.store, action_types::CALL_ATTEMPT).await;
        h.runner.run_once().await.unwrap();
        let call_id = h.voice.placed.lock().last().unwrap().provider_call_id.clone();
        h.dispatcher
            .dispatch(InboundCommand::VoiceHangup {
                provider_call_id: call_id,
                cause: "no_answer".to_string(),
            })
            .await
            .unwrap();
    }

    assert_eq!(h.voice.placed_count(), 2);

    let voice_alert = h
        .store
        .alert_rows()
        .into_iter()
        .find(|a| a.channel == Channel::Voice)
        .unwrap();
    assert_eq!(voice_alert.status, AlertStatus::Halted);

    // The traveler hears about it; the incident stays open.
    let sent = h.chat.sent.lock();
    assert!(sent
        .iter()
        .any(|m| m.chat_id == traveler.chat_user_id && m.text.contains("Не удалось")));
    drop(sent);

    let incident = incident_by_id(&h.store, &incident).await;
    assert_eq!(incident.status, IncidentStatus::Open);
}

// Reminders edit the original guardian message in place, round by round.
#[tokio::test]
async fn reminders_edit_the_original_alert() {
    let h = harness();
    let traveler = add_user(&h.store, "100", "Мария", None).await;
    let g1 = add_user(&h.store, "200", "Иван", None).await;
    add_link(&h.store, traveler.id, g1.id, 1, true, false).await;

    let (incident, _) = h.dispatcher.trigger_panic(traveler.id).await.unwrap();

    let alert_message_id = h
        .store
        .alert_rows()
        .into_iter()
        .find(|a| a.channel == Channel::Chat)
        .and_then(|a| a.chat_message_id)
        .expect("alert message sent");

    make_due(&h.store, action_types::CALL_ATTEMPT).await;
    h.runner.run_once().await.unwrap();

    let edits = h.chat.edits.lock();
    assert_eq!(edits.len(), 1);
    assert_eq!(edits[0].message_id, alert_message_id);
    assert!(edits[0].text.contains("напоминание 1"));
    drop(edits);

    // The next round is queued.
    let next = h
        .store
        .action_rows()
        .into_iter()
        .find(|a| {
            a.action_type == action_types::PANIC_REMINDER && a.state == ActionState::Scheduled
        })
        .expect("next reminder scheduled");
    assert_eq!(next.incident_id, Some(incident.id));
}

// S5/P6: a runner killed mid-dispatch leaves actions in `running`; a
// restart re-adopts them and redelivered work does not double-place calls.
#[tokio::test]
async fn restart_recovers_inflight_actions_without_duplicates() {
    let h = harness();
    let traveler = add_user(&h.store, "100", "Мария", None).await;
    let g1 = add_user(&h.store, "200", "Иван", Some("+34600111222")).await;
    add_link(&h.store, traveler.id, g1.id, 1, false, true).await;

    let (incident, _) = h.dispatcher.trigger_panic(traveler.id).await.unwrap();

    // A doomed runner claims the due action and dies before dispatching.
    make_due(&h.store, action_types::CALL_ATTEMPT).await;
    let claimed = h.store.claim_due(Utc::now(), 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(h.voice.placed_count(), 0);

    // A fresh poll sees nothing: the orphan is stuck in `running`.
    h.runner.run_once().await.unwrap();
    assert_eq!(h.voice.placed_count(), 0);

    // Restart: recovery re-adopts the orphan, the next poll places it.
    h.runner.recover().await.unwrap();
    h.runner.run_once().await.unwrap();
    assert_eq!(h.voice.placed_count(), 1);

    // A redelivered copy of the same step is a no-op on the attempt and
    // collapses onto the same outbox row: still exactly one real call.
    let duplicate = vigil_server_domain::ports::ScheduledAction::new(
        incident.id,
        action_types::CALL_ATTEMPT,
        Utc::now() - Duration::seconds(1),
        serde_json::json!({
            "alert_id": h.store.alert_rows()[0].id,
            "attempt_no": 1,
        }),
    );
    h.store.schedule(&duplicate).await.unwrap();
    h.runner.run_once().await.unwrap();
    assert_eq!(h.voice.placed_count(), 1);

    let voice_rows: Vec<_> = h
        .store
        .outbox_rows()
        .into_iter()
        .filter(|m| m.channel == Channel::Voice)
        .collect();
    assert_eq!(voice_rows.len(), 1);
}

// A double trigger reuses the open incident instead of forking.
#[tokio::test]
async fn double_panic_reuses_the_open_incident() {
    let h = harness();
    let traveler = add_user(&h.store, "100", "Мария", None).await;
    let g1 = add_user(&h.store, "200", "Иван", None).await;
    add_link(&h.store, traveler.id, g1.id, 1, true, false).await;

    let (first, created_first) = h.dispatcher.trigger_panic(traveler.id).await.unwrap();
    let (second, created_second) = h.dispatcher.trigger_panic(traveler.id).await.unwrap();

    assert!(created_first);
    assert!(!created_second);
    assert_eq!(first.id, second.id);

    // Seeding ran once: one alert, one guardian chat message.
    assert_eq!(h.store.alert_rows().len(), 1);
}
