//! Saga steps.
//!
//! | Handler | Service | Topic | Effect |
//! |---|---|---|---|
//! | [`PaymentCompletionHandler`] | Payment | `payment.capture-completed` | publish `payment.completed` |
//! | [`ReservationConfirmationHandler`] | Reservation | `payment.completed` | PENDING → CONFIRMED once the amount matches |
//! | [`PaymentReleaseHandler`] | Payment | `reservation.events` | cancel the open payment of an ended reservation |
//! | [`AnalyticsReservationHandler`] | Analytics | `reservation.events` | upsert the replica |
//! | [`AnalyticsPaymentHandler`] | Analytics | `payment.completed` | confirm the replica, book revenue |
//!
//! Unparseable payloads are permanent failures.

use super::{Outcome, SagaHandler};
use crate::analytics::AnalyticsService;
use crate::metrics;
use crate::payments::PaymentService;
use crate::reservations::{Confirmation, ReservationService};
use async_trait::async_trait;
use rentflow_core::error::RentalError;
use rentflow_core::messages::{
    CaptureCompleted, PAYMENT_COMPLETED_TOPIC, PaymentCompleted, ReservationChanged, StreamPayload,
};
use rentflow_core::ports::ConsumerCheckpoint;
use rentflow_core::reservation::ReservationStatus;
use rentflow_core::stream::{ChangeStream, StreamMessage};
use rentflow_core::types::Money;
use std::sync::Arc;

/// Payment service: capture facts → `payment.completed`.
pub const PAYMENT_COMPLETION: &str = "payment-completion";
/// Payment service: reservation snapshots → payment release.
pub const PAYMENT_RELEASE: &str = "payment-release";
/// Reservation service: `payment.completed` → confirmation.
pub const RESERVATION_CONFIRMATION: &str = "reservation-confirmation";
/// Analytics service: reservation snapshots → replica.
pub const ANALYTICS_RESERVATIONS: &str = "analytics-reservations";
/// Analytics service: `payment.completed` → replica confirmation and revenue.
pub const ANALYTICS_PAYMENTS: &str = "analytics-payments";

fn decode<T: StreamPayload>(message: &StreamMessage) -> Result<T, Outcome> {
    T::decode(&message.payload).map_err(|e| Outcome::DeadLetter(e.to_string()))
}

/// Derives `payment.completed` from a relayed capture fact.
///
/// The payment is verified COMPLETED before anything is published. Publishing comes
/// before the checkpoint commit, so a crash in between publishes again; downstream
/// consumers treat the duplicate as a no-op.
pub struct PaymentCompletionHandler {
    payments: Arc<PaymentService>,
    stream: Arc<dyn ChangeStream>,
}

impl PaymentCompletionHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(payments: Arc<PaymentService>, stream: Arc<dyn ChangeStream>) -> Self {
        Self { payments, stream }
    }

    async fn complete(
        &self,
        consumer: &str,
        message: &StreamMessage,
        fact: CaptureCompleted,
    ) -> Result<(), RentalError> {
        let payment = self.payments.completed_payment(fact.paypal_token.clone()).await?;

        if payment.completion_published {
            tracing::debug!(token = %payment.token, "payment.completed already published");
        } else {
            let completed = PaymentCompleted::from(&payment);
            let payload = completed
                .encode()
                .map_err(|e| RentalError::Validation(e.to_string()))?;
            self.stream
                .publish(PAYMENT_COMPLETED_TOPIC, &completed.key(), &payload)
                .await
                .map_err(|e| RentalError::Transient(e.to_string()))?;
            tracing::info!(
                token = %payment.token,
                reservation_id = %payment.reservation_id,
                "payment.completed published"
            );
        }

        self.payments
            .mark_completion_published(fact.paypal_token, ConsumerCheckpoint::new(consumer, message))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SagaHandler for PaymentCompletionHandler {
    async fn handle(&self, consumer: &str, message: &StreamMessage) -> Outcome {
        match decode::<CaptureCompleted>(message) {
            Ok(fact) => self.complete(consumer, message, fact).await.into(),
            Err(outcome) => outcome,
        }
    }
}

/// Confirms the reservation a completed payment is for.
pub struct ReservationConfirmationHandler {
    reservations: Arc<ReservationService>,
}

impl ReservationConfirmationHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(reservations: Arc<ReservationService>) -> Self {
        Self { reservations }
    }
}

#[async_trait]
impl SagaHandler for ReservationConfirmationHandler {
    async fn handle(&self, consumer: &str, message: &StreamMessage) -> Outcome {
        let payment = match decode::<PaymentCompleted>(message) {
            Ok(payment) => payment,
            Err(outcome) => return outcome,
        };

        let result = self
            .reservations
            .confirm(
                payment.reservation_id,
                Money::from_cents(payment.amount_cents),
                ConsumerCheckpoint::new(consumer, message),
            )
            .await;
        match result {
            Ok(Confirmation::TerminalConflict) => {
                metrics::record_terminal_conflict(consumer);
                Outcome::Applied
            },
            Ok(Confirmation::Confirmed | Confirmation::Duplicate) => Outcome::Applied,
            Err(error) => Outcome::from_error(&error),
        }
    }
}

/// Cancels the open payment of a reservation that expired or was cancelled, so a late
/// capture is refused.
pub struct PaymentReleaseHandler {
    payments: Arc<PaymentService>,
}

impl PaymentReleaseHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(payments: Arc<PaymentService>) -> Self {
        Self { payments }
    }
}

#[async_trait]
impl SagaHandler for PaymentReleaseHandler {
    async fn handle(&self, consumer: &str, message: &StreamMessage) -> Outcome {
        let change = match decode::<ReservationChanged>(message) {
            Ok(change) => change,
            Err(outcome) => return outcome,
        };

        match change.reservation.status {
            ReservationStatus::Expired | ReservationStatus::Cancelled => self
                .payments
                .release_for_reservation(
                    change.reservation.id,
                    ConsumerCheckpoint::new(consumer, message),
                )
                .await
                .map(|_| ())
                .into(),
            _ => Outcome::Applied,
        }
    }
}

/// Keeps the Analytics replica in step with reservation snapshots.
pub struct AnalyticsReservationHandler {
    analytics: Arc<AnalyticsService>,
}

impl AnalyticsReservationHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(analytics: Arc<AnalyticsService>) -> Self {
        Self { analytics }
    }
}

#[async_trait]
impl SagaHandler for AnalyticsReservationHandler {
    async fn handle(&self, consumer: &str, message: &StreamMessage) -> Outcome {
        match decode::<ReservationChanged>(message) {
            Ok(change) => self
                .analytics
                .record_snapshot(change, ConsumerCheckpoint::new(consumer, message))
                .await
                .into(),
            Err(outcome) => outcome,
        }
    }
}

/// Applies completed payments to the Analytics replica and the revenue ledger.
pub struct AnalyticsPaymentHandler {
    analytics: Arc<AnalyticsService>,
}

impl AnalyticsPaymentHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(analytics: Arc<AnalyticsService>) -> Self {
        Self { analytics }
    }
}

#[async_trait]
impl SagaHandler for AnalyticsPaymentHandler {
    async fn handle(&self, consumer: &str, message: &StreamMessage) -> Outcome {
        match decode::<PaymentCompleted>(message) {
            Ok(payment) => self
                .analytics
                .record_payment(payment, ConsumerCheckpoint::new(consumer, message))
                .await
                .into(),
            Err(outcome) => outcome,
        }
    }
}
