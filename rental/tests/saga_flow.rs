//! Saga integration tests.
//!
//! Drives every saga step by hand over in-memory adapters: the relays are run one pass
//! at a time and each handler is fed the messages the previous step published. This
//! makes redelivery and ordering explicit without background tasks.
//!
//! Run with: `cargo test -p rental --test saga_flow`

#![allow(clippy::unwrap_used)]
#![allow(clippy::too_many_lines)]

use chrono::Duration;
use rental::analytics::AnalyticsService;
use rental::payments::{OrderRequest, PaymentService};
use rental::reservations::ReservationService;
use rental::runtime::handlers::{
    ANALYTICS_PAYMENTS, ANALYTICS_RESERVATIONS, AnalyticsPaymentHandler,
    AnalyticsReservationHandler, PAYMENT_COMPLETION, PAYMENT_RELEASE, PaymentCompletionHandler,
    PaymentReleaseHandler, RESERVATION_CONFIRMATION, ReservationConfirmationHandler,
};
use rental::runtime::{ExpirationSweeper, Outcome, OutboxRelay, SagaHandler};
use rentflow_core::environment::Clock;
use rentflow_core::error::ErrorKind;
use rentflow_core::messages::{
    CAPTURE_COMPLETED_TOPIC, PAYMENT_COMPLETED_TOPIC, PaymentCompleted, RESERVATION_EVENTS_TOPIC,
    ReservationChanged, StreamPayload,
};
use rentflow_core::payment::PaymentStatus;
use rentflow_core::ports::PaymentStore;
use rentflow_core::reservation::{BookingPolicy, BookingRequest, Reservation, ReservationStatus};
use rentflow_core::stream::{StreamMessage, StreamPosition};
use rentflow_core::types::{CustomerId, GatewayToken, Money, PayerId, PaymentId, VehicleId};
use rentflow_testing::mocks::parse;
use rentflow_testing::{
    InMemoryAnalyticsStore, InMemoryChangeStream, InMemoryPaymentStore, InMemoryReservationStore,
    InMemoryVehicleCatalog, ManualClock, MockPaymentGateway, init_test_tracing,
};
use std::sync::Arc;

/// Reservation, Payment and Analytics services sharing one stream and one clock.
struct Platform {
    clock: ManualClock,
    stream: InMemoryChangeStream,
    reservation_store: InMemoryReservationStore,
    payment_store: InMemoryPaymentStore,
    analytics_store: InMemoryAnalyticsStore,
    reservations: Arc<ReservationService>,
    payments: Arc<PaymentService>,
    analytics: Arc<AnalyticsService>,
    reservation_relay: OutboxRelay,
    capture_relay: OutboxRelay,
}

impl Platform {
    fn at(now: &str) -> Self {
        init_test_tracing();
        let clock = ManualClock::at(now);
        let stream = InMemoryChangeStream::new();
        let reservation_store = InMemoryReservationStore::new();
        let payment_store = InMemoryPaymentStore::new();
        let analytics_store = InMemoryAnalyticsStore::new();
        let catalog =
            InMemoryVehicleCatalog::new().with_vehicle(VehicleId::new(1), Money::from_units(50));

        let reservations = Arc::new(ReservationService::new(
            Arc::new(reservation_store.clone()),
            Arc::new(catalog),
            Arc::new(clock.clone()),
            BookingPolicy::default(),
        ));
        let payments = Arc::new(PaymentService::new(
            Arc::new(payment_store.clone()),
            Arc::new(reservation_store.clone()),
            Arc::new(MockPaymentGateway::new()),
            Arc::new(clock.clone()),
        ));
        let analytics = Arc::new(AnalyticsService::new(Arc::new(analytics_store.clone())));

        let reservation_relay = OutboxRelay::new(
            "reservation_outbox",
            Arc::new(reservation_store.clone()),
            Arc::new(stream.clone()),
            Arc::new(clock.clone()),
        );
        let capture_relay = OutboxRelay::new(
            "capture_events",
            Arc::new(payment_store.clone()),
            Arc::new(stream.clone()),
            Arc::new(clock.clone()),
        );

        Self {
            clock,
            stream,
            reservation_store,
            payment_store,
            analytics_store,
            reservations,
            payments,
            analytics,
            reservation_relay,
            capture_relay,
        }
    }

    async fn book(&self, pick_up: &str, drop_off: &str) -> Reservation {
        self.reservations
            .create(BookingRequest {
                customer_id: CustomerId::new("alice"),
                vehicle_id: VehicleId::new(1),
                pick_up: parse(pick_up),
                drop_off: parse(drop_off),
            })
            .await
            .unwrap()
    }

    /// Open an order for `reservation` and complete the gateway round trip.
    async fn pay(&self, reservation: &Reservation) -> GatewayToken {
        let opened = self
            .payments
            .open_order(OrderRequest {
                reservation_id: reservation.id,
                customer_id: reservation.customer_id.clone(),
                amount: reservation.total_amount,
            })
            .await
            .unwrap();
        let token = opened.payment.token;
        self.payments
            .capture(token.clone(), PayerId::new("PAYER-1"))
            .await
            .unwrap();
        token
    }

    fn completion_handler(&self) -> PaymentCompletionHandler {
        PaymentCompletionHandler::new(Arc::clone(&self.payments), Arc::new(self.stream.clone()))
    }

    fn confirmation_handler(&self) -> ReservationConfirmationHandler {
        ReservationConfirmationHandler::new(Arc::clone(&self.reservations))
    }

    fn reservation_status(&self, reservation: &Reservation) -> ReservationStatus {
        self.reservation_store
            .all()
            .into_iter()
            .find(|r| r.id == reservation.id)
            .unwrap()
            .status
    }

    /// Relay the reservation outbox and feed every snapshot to both of its consumers.
    async fn sync_reservation_events(&self) {
        self.reservation_relay.relay_once().await.unwrap();
        let replica = AnalyticsReservationHandler::new(Arc::clone(&self.analytics));
        let release = PaymentReleaseHandler::new(Arc::clone(&self.payments));
        for message in self.stream.published(RESERVATION_EVENTS_TOPIC) {
            assert_eq!(
                replica.handle(ANALYTICS_RESERVATIONS, &message).await,
                Outcome::Applied
            );
            assert_eq!(release.handle(PAYMENT_RELEASE, &message).await, Outcome::Applied);
        }
    }
}

async fn handle_all(handler: &dyn SagaHandler, consumer: &str, messages: &[StreamMessage]) {
    for message in messages {
        assert_eq!(handler.handle(consumer, message).await, Outcome::Applied);
    }
}

#[tokio::test]
async fn paid_reservation_is_confirmed_everywhere() {
    let platform = Platform::at("2025-06-01T10:00:00Z");
    let reservation = platform
        .book("2025-06-01T12:00:00Z", "2025-06-01T14:00:00Z")
        .await;
    assert_eq!(reservation.total_amount, Money::from_units(50));

    let token = platform.pay(&reservation).await;

    // Capture fact → payment.completed
    assert_eq!(platform.capture_relay.relay_once().await.unwrap().published, 1);
    let facts = platform.stream.published(CAPTURE_COMPLETED_TOPIC);
    handle_all(&platform.completion_handler(), PAYMENT_COMPLETION, &facts).await;

    let completed = platform.stream.published(PAYMENT_COMPLETED_TOPIC);
    assert_eq!(completed.len(), 1);
    let payment = PaymentCompleted::decode(&completed[0].payload).unwrap();
    assert_eq!(payment.paypal_token, token);
    assert_eq!(payment.reservation_id, reservation.id);
    assert_eq!(payment.amount_cents, 5_000);

    // payment.completed → CONFIRMED
    handle_all(&platform.confirmation_handler(), RESERVATION_CONFIRMATION, &completed).await;
    assert_eq!(platform.reservation_status(&reservation), ReservationStatus::Confirmed);

    // Replica and revenue
    platform.sync_reservation_events().await;
    let analytics = AnalyticsPaymentHandler::new(Arc::clone(&platform.analytics));
    handle_all(&analytics, ANALYTICS_PAYMENTS, &completed).await;

    let replica = platform.analytics_store.replica(reservation.id).unwrap();
    assert_eq!(replica.status, ReservationStatus::Confirmed);
    let summary = platform.analytics.summary().await.unwrap();
    assert_eq!(summary.payments_captured, 1);
    assert_eq!(summary.revenue_cents, 5_000);
    assert_eq!(summary.reservations_by_status.get("CONFIRMED"), Some(&1));

    // Confirmed reservations keep their payment
    let stored = platform.payments.get(token).await.unwrap();
    assert_eq!(stored.status, PaymentStatus::Completed);
}

#[tokio::test]
async fn redelivered_facts_confirm_once() {
    let platform = Platform::at("2025-06-01T10:00:00Z");
    let reservation = platform
        .book("2025-06-01T12:00:00Z", "2025-06-01T14:00:00Z")
        .await;
    platform.pay(&reservation).await;
    platform.capture_relay.relay_once().await.unwrap();

    // Same capture fact three times: one payment.completed.
    let fact = platform.stream.published(CAPTURE_COMPLETED_TOPIC).remove(0);
    let completion = platform.completion_handler();
    for _ in 0..3 {
        assert_eq!(completion.handle(PAYMENT_COMPLETION, &fact).await, Outcome::Applied);
    }
    let completed = platform.stream.published(PAYMENT_COMPLETED_TOPIC);
    assert_eq!(completed.len(), 1);

    // Same payment.completed three times: one transition, one snapshot.
    let confirmation = platform.confirmation_handler();
    for _ in 0..3 {
        assert_eq!(
            confirmation
                .handle(RESERVATION_CONFIRMATION, &completed[0])
                .await,
            Outcome::Applied
        );
    }
    assert_eq!(platform.reservation_status(&reservation), ReservationStatus::Confirmed);
    // Creation snapshot plus the confirmation
    assert_eq!(platform.reservation_store.outbox_len(), 2);

    // Same payment.completed twice on the analytics side: revenue booked once.
    platform.sync_reservation_events().await;
    let analytics = AnalyticsPaymentHandler::new(Arc::clone(&platform.analytics));
    handle_all(&analytics, ANALYTICS_PAYMENTS, &completed).await;
    handle_all(&analytics, ANALYTICS_PAYMENTS, &completed).await;
    assert_eq!(platform.analytics.summary().await.unwrap().revenue_cents, 5_000);
}

#[tokio::test]
async fn unpaid_reservation_expires_and_frees_the_vehicle() {
    // R created at 10:00 for 12:00-14:00 with a one hour grace period.
    let platform = Platform::at("2025-06-01T10:00:00Z");
    let reservation = platform
        .book("2025-06-01T12:00:00Z", "2025-06-01T14:00:00Z")
        .await;

    // 13:30-16:00 collides with the buffered window [12:00, 15:00].
    let err = platform
        .reservations
        .create(BookingRequest {
            customer_id: CustomerId::new("bob"),
            vehicle_id: VehicleId::new(1),
            pick_up: parse("2025-06-01T13:30:00Z"),
            drop_off: parse("2025-06-01T16:00:00Z"),
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // 10:31: thirty minutes have passed, the sweeper expires R.
    platform.clock.set(parse("2025-06-01T10:31:00Z"));
    let sweeper = ExpirationSweeper::new(
        Arc::clone(&platform.reservations),
        Arc::new(platform.clock.clone()),
        Duration::minutes(30),
        100,
    );
    assert_eq!(sweeper.sweep_once().await.unwrap(), 1);
    assert_eq!(platform.reservation_status(&reservation), ReservationStatus::Expired);

    // The same window is bookable again.
    let rebooked = platform
        .reservations
        .create(BookingRequest {
            customer_id: CustomerId::new("bob"),
            vehicle_id: VehicleId::new(1),
            pick_up: parse("2025-06-01T13:30:00Z"),
            drop_off: parse("2025-06-01T16:00:00Z"),
        })
        .await
        .unwrap();
    assert_eq!(rebooked.status, ReservationStatus::Pending);
}

#[tokio::test]
async fn expired_reservation_releases_its_open_payment() {
    let platform = Platform::at("2025-06-01T10:00:00Z");
    let reservation = platform
        .book("2025-06-01T12:00:00Z", "2025-06-01T14:00:00Z")
        .await;
    let opened = platform
        .payments
        .open_order(OrderRequest {
            reservation_id: reservation.id,
            customer_id: reservation.customer_id.clone(),
            amount: reservation.total_amount,
        })
        .await
        .unwrap();

    platform.clock.advance(Duration::minutes(31));
    assert!(platform.reservations.expire(reservation.id).await.unwrap());
    platform.sync_reservation_events().await;

    let payment = platform.payments.get(opened.payment.token.clone()).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Cancelled);

    // The customer coming back from the gateway is refused.
    let err = platform
        .payments
        .capture(opened.payment.token, PayerId::new("PAYER-1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(platform.stream.published(CAPTURE_COMPLETED_TOPIC).is_empty());
    assert_eq!(
        platform.analytics_store.replica(reservation.id).unwrap().status,
        ReservationStatus::Expired
    );
}

#[tokio::test]
async fn late_payment_does_not_revive_an_expired_reservation() {
    let platform = Platform::at("2025-06-01T10:00:00Z");
    let reservation = platform
        .book("2025-06-01T12:00:00Z", "2025-06-01T14:00:00Z")
        .await;
    platform.pay(&reservation).await;

    // The sweeper wins before the capture fact travels.
    platform.clock.advance(Duration::minutes(31));
    assert!(platform.reservations.expire(reservation.id).await.unwrap());

    platform.capture_relay.relay_once().await.unwrap();
    let facts = platform.stream.published(CAPTURE_COMPLETED_TOPIC);
    handle_all(&platform.completion_handler(), PAYMENT_COMPLETION, &facts).await;
    let completed = platform.stream.published(PAYMENT_COMPLETED_TOPIC);
    handle_all(&platform.confirmation_handler(), RESERVATION_CONFIRMATION, &completed).await;

    // Terminal states are sticky; the message is acknowledged, nothing else happens.
    assert_eq!(platform.reservation_status(&reservation), ReservationStatus::Expired);
    let payments = platform.payment_store.all();
    assert_eq!(payments[0].status, PaymentStatus::Completed);
}

#[tokio::test]
async fn capture_fact_is_durable_before_anything_is_published() {
    let platform = Platform::at("2025-06-01T10:00:00Z");
    let reservation = platform
        .book("2025-06-01T12:00:00Z", "2025-06-01T14:00:00Z")
        .await;
    let opened = platform
        .payments
        .open_order(OrderRequest {
            reservation_id: reservation.id,
            customer_id: reservation.customer_id.clone(),
            amount: reservation.total_amount,
        })
        .await
        .unwrap();
    let token = opened.payment.token;
    platform
        .payment_store
        .mark_paid(token.clone(), PayerId::new("PAYER-1"), platform.clock.now())
        .await
        .unwrap();

    // The gateway captured, the local commit failed: still PAID, no fact.
    platform.payment_store.fail_next_commits(1);
    let err = platform
        .payments
        .capture(token.clone(), PayerId::new("PAYER-1"))
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert_eq!(platform.payment_store.all()[0].status, PaymentStatus::Paid);
    assert!(platform.payment_store.capture_events().is_empty());
    assert_eq!(platform.capture_relay.relay_once().await.unwrap().published, 0);

    // The customer retries: the payment completes with exactly one fact.
    let payment = platform
        .payments
        .capture(token, PayerId::new("PAYER-1"))
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);
    assert_eq!(platform.payment_store.capture_events().len(), 1);
    assert_eq!(platform.capture_relay.relay_once().await.unwrap().published, 1);
}

#[tokio::test]
async fn reservation_snapshot_and_status_commit_together() {
    let platform = Platform::at("2025-06-01T10:00:00Z");

    platform.reservation_store.fail_next_commits(1);
    let err = platform
        .reservations
        .create(BookingRequest {
            customer_id: CustomerId::new("alice"),
            vehicle_id: VehicleId::new(1),
            pick_up: parse("2025-06-01T12:00:00Z"),
            drop_off: parse("2025-06-01T14:00:00Z"),
        })
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert!(platform.reservation_store.all().is_empty());
    assert_eq!(platform.reservation_store.outbox_len(), 0);

    let reservation = platform
        .book("2025-06-01T12:00:00Z", "2025-06-01T14:00:00Z")
        .await;
    platform.reservation_store.fail_next_commits(1);
    assert!(platform.reservations.cancel(reservation.id).await.is_err());
    assert_eq!(platform.reservation_status(&reservation), ReservationStatus::Pending);
    assert_eq!(platform.reservation_store.outbox_len(), 1);
}

#[tokio::test]
async fn payment_that_overtakes_the_snapshots_keeps_its_revenue() {
    let platform = Platform::at("2025-06-01T10:00:00Z");
    let reservation = platform
        .book("2025-06-01T12:00:00Z", "2025-06-01T14:00:00Z")
        .await;
    platform.pay(&reservation).await;
    platform.capture_relay.relay_once().await.unwrap();
    let facts = platform.stream.published(CAPTURE_COMPLETED_TOPIC);
    handle_all(&platform.completion_handler(), PAYMENT_COMPLETION, &facts).await;
    let completed = platform.stream.published(PAYMENT_COMPLETED_TOPIC);

    // Analytics sees payment.completed before any reservation.events.
    let analytics = AnalyticsPaymentHandler::new(Arc::clone(&platform.analytics));
    handle_all(&analytics, ANALYTICS_PAYMENTS, &completed).await;
    assert!(platform.analytics_store.replica(reservation.id).is_none());
    assert_eq!(platform.analytics.summary().await.unwrap().revenue_cents, 5_000);

    // The confirmation reaches the Reservation service, then the snapshots catch up.
    handle_all(&platform.confirmation_handler(), RESERVATION_CONFIRMATION, &completed).await;
    platform.sync_reservation_events().await;

    let replica = platform.analytics_store.replica(reservation.id).unwrap();
    assert_eq!(replica.status, ReservationStatus::Confirmed);
    let summary = platform.analytics.summary().await.unwrap();
    assert_eq!(summary.revenue_cents, 5_000);
    assert_eq!(summary.payments_captured, 1);
    assert_eq!(summary.reservations_by_status.get("CONFIRMED"), Some(&1));
}

#[tokio::test]
async fn underpayment_is_refused_before_the_gateway() {
    let platform = Platform::at("2025-06-01T10:00:00Z");
    let reservation = platform
        .book("2025-06-01T12:00:00Z", "2025-06-01T14:00:00Z")
        .await;

    let err = platform
        .payments
        .open_order(OrderRequest {
            reservation_id: reservation.id,
            customer_id: reservation.customer_id.clone(),
            amount: Money::from_cents(1),
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(platform.payment_store.all().is_empty());
    assert_eq!(platform.reservation_status(&reservation), ReservationStatus::Pending);
}

#[tokio::test]
async fn completed_payment_for_the_wrong_amount_is_dead_lettered() {
    let platform = Platform::at("2025-06-01T10:00:00Z");
    let reservation = platform
        .book("2025-06-01T12:00:00Z", "2025-06-01T14:00:00Z")
        .await;
    let forged = PaymentCompleted {
        paypal_token: GatewayToken::new("EC-FORGED"),
        payment_id: PaymentId::new(99),
        reservation_id: reservation.id,
        amount_cents: 1,
        completed_at: platform.clock.now(),
    };
    let message = StreamMessage {
        position: StreamPosition {
            topic: PAYMENT_COMPLETED_TOPIC.to_string(),
            partition: 0,
            offset: 0,
        },
        key: Some(forged.key()),
        payload: forged.encode().unwrap(),
    };

    let outcome = platform
        .confirmation_handler()
        .handle(RESERVATION_CONFIRMATION, &message)
        .await;

    assert!(matches!(outcome, Outcome::DeadLetter(_)));
    assert_eq!(platform.reservation_status(&reservation), ReservationStatus::Pending);
    assert_eq!(platform.reservation_store.outbox_len(), 1);
}

#[tokio::test]
async fn expired_reservation_cannot_be_paid() {
    let platform = Platform::at("2025-06-01T10:00:00Z");
    let reservation = platform
        .book("2025-06-01T12:00:00Z", "2025-06-01T14:00:00Z")
        .await;
    platform.clock.advance(Duration::minutes(31));
    assert!(platform.reservations.expire(reservation.id).await.unwrap());
    platform.sync_reservation_events().await;

    let err = platform
        .payments
        .open_order(OrderRequest {
            reservation_id: reservation.id,
            customer_id: reservation.customer_id.clone(),
            amount: reservation.total_amount,
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(platform.payment_store.all().is_empty());
}

#[tokio::test]
async fn snapshots_are_stamped_with_the_service_clock() {
    let platform = Platform::at("2025-06-01T10:00:00Z");
    let reservation = platform
        .book("2025-06-01T12:00:00Z", "2025-06-01T14:00:00Z")
        .await;
    platform.clock.advance(Duration::minutes(5));
    platform.reservations.cancel(reservation.id).await.unwrap();

    platform.reservation_relay.relay_once().await.unwrap();
    let stamps: Vec<_> = platform
        .stream
        .published(RESERVATION_EVENTS_TOPIC)
        .iter()
        .map(|message| ReservationChanged::decode(&message.payload).unwrap().occurred_at)
        .collect();
    assert_eq!(
        stamps,
        vec![parse("2025-06-01T10:00:00Z"), parse("2025-06-01T10:05:00Z")]
    );
}

#[tokio::test]
async fn garbage_payload_is_dead_lettered() {
    let platform = Platform::at("2025-06-01T10:00:00Z");
    let message = StreamMessage {
        position: StreamPosition {
            topic: PAYMENT_COMPLETED_TOPIC.to_string(),
            partition: 0,
            offset: 0,
        },
        key: Some("EC-1".to_string()),
        payload: b"not json".to_vec(),
    };

    let outcome = platform
        .confirmation_handler()
        .handle(RESERVATION_CONFIRMATION, &message)
        .await;
    assert!(matches!(outcome, Outcome::DeadLetter(_)));
}
