//! End-to-end tests: engine, gateway, simulated participants and worker pool
//! wired together the way the server wires them.

use std::sync::Arc;
use std::time::Duration;

use common::SagaId;
use saga::trip_booking::{
    self, ACTION_CANCEL_FLIGHT, FLIGHT_SERVICE, HOTEL_SERVICE, PAYMENT_SERVICE,
    STEP_BOOK_HOTEL, STEP_CHARGE_PAYMENT, STEP_RESERVE_FLIGHT,
};
use saga::{
    BackoffPolicy, Behavior, DefinitionRegistry, EngineConfig, EventRouter, GatewayConfig,
    InMemoryAlertSink, InMemoryParticipants, ParticipantEvent, RecoveryConfig, RecoveryManager,
    SagaDefinition, SagaEngine, SagaError, StepDefinition, TransportGateway, WorkerPool,
};
use state_store::{
    InMemoryIdempotencyStore, InMemoryStateStore, SagaInstance, SagaStatus, StateStoreExt,
    StepOutcome,
};

type Engine = SagaEngine<
    InMemoryStateStore,
    InMemoryIdempotencyStore,
    TransportGateway<InMemoryParticipants>,
>;

struct TestHarness {
    engine: Arc<Engine>,
    participants: InMemoryParticipants,
    alerts: InMemoryAlertSink,
    store: InMemoryStateStore,
    router: EventRouter,
    pool: WorkerPool,
}

impl TestHarness {
    fn new() -> Self {
        Self::with(EngineConfig::default(), vec![trip_booking::definition()])
    }

    fn with(config: EngineConfig, definitions: Vec<SagaDefinition>) -> Self {
        let mut registry = DefinitionRegistry::new();
        for definition in definitions {
            registry.register(definition).unwrap();
        }

        let (router, receivers) = EventRouter::new(4, 64);
        let participants = InMemoryParticipants::new(router.clone());
        let gateway = TransportGateway::new(
            Arc::new(participants.clone()),
            router.clone(),
            GatewayConfig {
                backoff: BackoffPolicy::none(),
                transport_retries: 2,
                transport_retry_delay: Duration::ZERO,
            },
        );
        let store = InMemoryStateStore::new();
        let alerts = InMemoryAlertSink::new();
        let engine = Arc::new(SagaEngine::new(
            store.clone(),
            InMemoryIdempotencyStore::new(),
            gateway,
            Arc::new(registry),
            Arc::new(alerts.clone()),
            config,
        ));
        let pool = WorkerPool::spawn(engine.clone(), receivers);

        Self {
            engine,
            participants,
            alerts,
            store,
            router,
            pool,
        }
    }

    async fn start_trip(&self) -> SagaId {
        self.engine
            .start(trip_booking::DEFINITION_NAME, trip_booking::sample_payload())
            .await
            .unwrap()
    }

    /// Polls until the saga reaches a terminal status and owes no alert.
    async fn wait_for_terminal(&self, saga_id: SagaId) -> SagaInstance {
        for _ in 0..500 {
            let instance = self.engine.get(saga_id).await.unwrap();
            if instance.status.is_terminal() && !instance.alert_pending {
                return instance;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("saga {saga_id} did not reach a terminal status");
    }

    /// Polls until `condition` holds.
    async fn wait_until(&self, condition: impl Fn(&InMemoryParticipants) -> bool) {
        for _ in 0..500 {
            if condition(&self.participants) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }
}

fn non_refundable_hotel_definition() -> SagaDefinition {
    SagaDefinition::builder("TripBookingNonRefundableHotel")
        .step(
            StepDefinition::new(STEP_RESERVE_FLIGHT, FLIGHT_SERVICE, STEP_RESERVE_FLIGHT)
                .compensated_by(FLIGHT_SERVICE, ACTION_CANCEL_FLIGHT),
        )
        .step(StepDefinition::new(STEP_BOOK_HOTEL, HOTEL_SERVICE, STEP_BOOK_HOTEL))
        .step(StepDefinition::new(
            STEP_CHARGE_PAYMENT,
            PAYMENT_SERVICE,
            STEP_CHARGE_PAYMENT,
        ))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_happy_path_completes_all_steps() {
    let h = TestHarness::new();
    let saga_id = h.start_trip().await;

    let saga = h.wait_for_terminal(saga_id).await;

    assert_eq!(saga.status, SagaStatus::Completed);
    assert_eq!(
        saga.done_steps().collect::<Vec<_>>(),
        vec![STEP_RESERVE_FLIGHT, STEP_BOOK_HOTEL, STEP_CHARGE_PAYMENT]
    );
    assert!(saga.step_results.iter().all(|s| s.result.is_some()));
    assert!(saga.failure_reason.is_none());
    assert_eq!(
        h.participants.dispatch_log(saga_id),
        vec!["reserve_flight(fwd)", "book_hotel(fwd)", "charge_payment(fwd)"]
    );
}

#[tokio::test]
async fn test_payment_failure_compensates_in_reverse_order() {
    let h = TestHarness::new();
    h.participants.set_behavior(
        PAYMENT_SERVICE,
        STEP_CHARGE_PAYMENT,
        Behavior::Reject("card declined".into()),
    );
    let saga_id = h.start_trip().await;

    let saga = h.wait_for_terminal(saga_id).await;

    assert_eq!(saga.status, SagaStatus::Compensated);
    assert!(saga.failure_reason.as_deref().unwrap().contains("card declined"));
    assert_eq!(
        h.participants.dispatch_log(saga_id),
        vec![
            "reserve_flight(fwd)",
            "book_hotel(fwd)",
            "charge_payment(fwd)",
            "book_hotel(undo)",
            "reserve_flight(undo)"
        ]
    );
    assert_eq!(saga.step(STEP_RESERVE_FLIGHT).unwrap().outcome, StepOutcome::Undone);
    assert_eq!(saga.step(STEP_BOOK_HOTEL).unwrap().outcome, StepOutcome::Undone);
    assert_eq!(saga.step(STEP_CHARGE_PAYMENT).unwrap().outcome, StepOutcome::Failed);
    assert_eq!(h.alerts.alert_count(), 0);
}

#[tokio::test]
async fn test_first_step_failure_needs_no_compensation() {
    let h = TestHarness::new();
    h.participants.set_behavior(
        FLIGHT_SERVICE,
        STEP_RESERVE_FLIGHT,
        Behavior::Reject("sold out".into()),
    );
    let saga_id = h.start_trip().await;

    let saga = h.wait_for_terminal(saga_id).await;

    assert_eq!(saga.status, SagaStatus::Compensated);
    assert_eq!(h.participants.dispatch_log(saga_id), vec!["reserve_flight(fwd)"]);
}

#[tokio::test]
async fn test_non_compensable_steps_are_skipped_on_undo() {
    let h = TestHarness::with(EngineConfig::default(), vec![non_refundable_hotel_definition()]);
    h.participants.set_behavior(
        PAYMENT_SERVICE,
        STEP_CHARGE_PAYMENT,
        Behavior::Reject("card declined".into()),
    );
    let saga_id = h
        .engine
        .start("TripBookingNonRefundableHotel", serde_json::json!({"customer_id": "c-1"}))
        .await
        .unwrap();

    let saga = h.wait_for_terminal(saga_id).await;

    assert_eq!(saga.status, SagaStatus::Compensated);
    assert_eq!(
        h.participants.dispatch_log(saga_id),
        vec![
            "reserve_flight(fwd)",
            "book_hotel(fwd)",
            "charge_payment(fwd)",
            "reserve_flight(undo)"
        ]
    );
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let h = TestHarness::new();
    h.participants
        .set_behavior(HOTEL_SERVICE, STEP_BOOK_HOTEL, Behavior::FailTransiently(1));
    let saga_id = h.start_trip().await;

    let saga = h.wait_for_terminal(saga_id).await;

    assert_eq!(saga.status, SagaStatus::Completed);
    assert_eq!(saga.step(STEP_BOOK_HOTEL).unwrap().attempts, 2);
    assert_eq!(
        h.participants.dispatch_log(saga_id),
        vec![
            "reserve_flight(fwd)",
            "book_hotel(fwd)",
            "book_hotel(fwd)",
            "charge_payment(fwd)"
        ]
    );
}

#[tokio::test]
async fn test_transient_failures_exhaust_into_compensation() {
    let h = TestHarness::new();
    h.participants
        .set_behavior(HOTEL_SERVICE, STEP_BOOK_HOTEL, Behavior::FailTransiently(u32::MAX));
    let saga_id = h.start_trip().await;

    let saga = h.wait_for_terminal(saga_id).await;

    assert_eq!(saga.status, SagaStatus::Compensated);
    assert_eq!(saga.step(STEP_BOOK_HOTEL).unwrap().attempts, 3);
    assert_eq!(
        h.participants.dispatch_log(saga_id).last().map(String::as_str),
        Some("reserve_flight(undo)")
    );
}

#[tokio::test]
async fn test_unreachable_participant_is_retried_by_transport() {
    let h = TestHarness::new();
    h.participants
        .set_behavior(FLIGHT_SERVICE, STEP_RESERVE_FLIGHT, Behavior::Unavailable(1));
    let saga_id = h.start_trip().await;

    let saga = h.wait_for_terminal(saga_id).await;

    assert_eq!(saga.status, SagaStatus::Completed);
    assert_eq!(saga.step(STEP_RESERVE_FLIGHT).unwrap().attempts, 1);
}

#[tokio::test]
async fn test_duplicate_events_are_ignored() {
    let h = TestHarness::new();
    h.participants
        .set_behavior(PAYMENT_SERVICE, STEP_CHARGE_PAYMENT, Behavior::Silent);
    let saga_id = h.start_trip().await;
    h.wait_until(|p| p.delivered_count(saga_id) == 3).await;
    let before = h.engine.get(saga_id).await.unwrap();

    let flight = h.participants.delivered()[0].clone();
    let duplicate = ParticipantEvent::succeeded(&flight, serde_json::json!({"reference": "X"}));
    h.router.route(duplicate.clone()).await.unwrap();
    let status = h.engine.handle_event(duplicate).await.unwrap();

    assert_eq!(status, SagaStatus::Running);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let after = h.engine.get(saga_id).await.unwrap();
    assert_eq!(before, after);
    assert_eq!(h.participants.delivered_count(saga_id), 3);
}

#[tokio::test]
async fn test_events_after_completion_change_nothing() {
    let h = TestHarness::new();
    let saga_id = h.start_trip().await;
    let completed = h.wait_for_terminal(saga_id).await;

    let payment = h.participants.delivered()[2].clone();
    let status = h
        .engine
        .handle_event(ParticipantEvent::succeeded(&payment, serde_json::Value::Null))
        .await
        .unwrap();

    assert_eq!(status, SagaStatus::Completed);
    assert_eq!(h.engine.get(saga_id).await.unwrap(), completed);
}

#[tokio::test]
async fn test_recovery_resumes_after_crash_without_rerunning_done_steps() {
    let h = TestHarness::new();

    // State left behind by a process that died right after step 0 succeeded
    let def = trip_booking::definition();
    let mut instance = SagaInstance::new(
        SagaId::new(),
        def.name.clone(),
        def.step_names(),
        trip_booking::sample_payload(),
    );
    instance.step_results[0].outcome = StepOutcome::Done;
    instance.step_results[0].attempts = 1;
    instance.step_results[0].result = Some(serde_json::json!({"reference": "RF-1"}));
    instance.current_index = 1;
    h.store.save_and_update(&mut instance).await.unwrap();

    let recovery = RecoveryManager::new(h.engine.clone(), RecoveryConfig::default());
    let report = recovery.recover().await.unwrap();
    assert_eq!(report.resumed, 1);

    let saga = h.wait_for_terminal(instance.saga_id).await;
    assert_eq!(saga.status, SagaStatus::Completed);
    assert_eq!(
        h.participants.dispatch_log(instance.saga_id),
        vec!["book_hotel(fwd)", "charge_payment(fwd)"]
    );
    assert_eq!(
        h.participants.delivered()[0].payload["results"][STEP_RESERVE_FLIGHT]["reference"],
        "RF-1"
    );
}

#[tokio::test]
async fn test_sweep_expires_silent_participant() {
    let h = TestHarness::new();
    h.participants
        .set_behavior(PAYMENT_SERVICE, STEP_CHARGE_PAYMENT, Behavior::Silent);
    let saga_id = h.start_trip().await;
    h.wait_until(|p| p.delivered_count(saga_id) == 3).await;

    let recovery = RecoveryManager::new(
        h.engine.clone(),
        RecoveryConfig {
            interval: Duration::from_secs(60),
            stuck_timeout: Duration::ZERO,
        },
    );
    let report = recovery.sweep().await.unwrap();
    assert_eq!(report.expired, 1);

    h.wait_until(|p| p.delivered_count(saga_id) == 4).await;
    let saga = h.engine.get(saga_id).await.unwrap();
    assert_eq!(saga.status, SagaStatus::Running);
    assert_eq!(saga.step(STEP_CHARGE_PAYMENT).unwrap().attempts, 2);
}

#[tokio::test]
async fn test_exhausted_compensation_fails_and_alerts_operator() {
    let config = EngineConfig {
        max_compensation_attempts: 3,
        ..Default::default()
    };
    let h = TestHarness::with(config, vec![trip_booking::definition()]);
    h.participants.set_behavior(
        PAYMENT_SERVICE,
        STEP_CHARGE_PAYMENT,
        Behavior::Reject("card declined".into()),
    );
    h.participants.set_behavior(
        FLIGHT_SERVICE,
        ACTION_CANCEL_FLIGHT,
        Behavior::FailTransiently(u32::MAX),
    );
    let saga_id = h.start_trip().await;

    let saga = h.wait_for_terminal(saga_id).await;

    assert_eq!(saga.status, SagaStatus::Failed);
    assert!(!saga.alert_pending);
    let flight = saga.step(STEP_RESERVE_FLIGHT).unwrap();
    assert!(flight.needs_intervention);
    assert_eq!(flight.compensation_attempts, 3);
    assert_eq!(saga.step(STEP_BOOK_HOTEL).unwrap().outcome, StepOutcome::Undone);

    let alerts = h.alerts.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].saga_id, saga_id);
    assert_eq!(alerts[0].step_name, STEP_RESERVE_FLIGHT);
}

#[tokio::test]
async fn test_many_sagas_run_concurrently() {
    let h = TestHarness::new();
    h.participants.set_behavior(
        PAYMENT_SERVICE,
        STEP_CHARGE_PAYMENT,
        Behavior::FailTransiently(1),
    );

    let mut ids = Vec::new();
    for _ in 0..20 {
        ids.push(h.start_trip().await);
    }

    for id in ids {
        let saga = h.wait_for_terminal(id).await;
        assert_eq!(saga.status, SagaStatus::Completed);
        assert_eq!(saga.step(STEP_CHARGE_PAYMENT).unwrap().attempts, 2);
    }
}

#[tokio::test]
async fn test_start_rejects_unknown_definition_and_invalid_payload() {
    let h = TestHarness::new();

    let unknown = h
        .engine
        .start("CarRental", trip_booking::sample_payload())
        .await;
    assert!(matches!(unknown, Err(SagaError::DefinitionNotFound(name)) if name == "CarRental"));

    let missing_field = h
        .engine
        .start(
            trip_booking::DEFINITION_NAME,
            serde_json::json!({"customer_id": "c-1", "flight_number": "LH-1"}),
        )
        .await;
    assert!(matches!(missing_field, Err(SagaError::InvalidPayload(_))));

    let not_an_object = h
        .engine
        .start(trip_booking::DEFINITION_NAME, serde_json::json!([1, 2, 3]))
        .await;
    assert!(matches!(not_an_object, Err(SagaError::InvalidPayload(_))));

    assert_eq!(h.store.instance_count().await, 0);
    assert!(h.participants.delivered().is_empty());
}

#[tokio::test]
async fn test_worker_pool_shuts_down() {
    let h = TestHarness::new();
    let saga_id = h.start_trip().await;
    h.wait_for_terminal(saga_id).await;

    assert_eq!(h.pool.worker_count(), 4);
    h.pool.shutdown().await;
}
