//! Reservation service: booking, staff commands, saga confirmation and expiry.
//!
//! Every status change goes through [`ReservationStore::transition`], which runs the
//! state machine under the row lock. The service decides what each outcome means for
//! its caller:
//!
//! - staff commands surface a terminal conflict as [`RentalError::Conflict`]
//! - the saga logs it and succeeds, so the message is acknowledged
//! - the sweeper skips it

use crate::metrics;
use chrono::{DateTime, Utc};
use rentflow_core::environment::Clock;
use rentflow_core::error::{ErrorKind, RentalError};
use rentflow_core::lifecycle::{ReservationEvent, TransitionOutcome};
use rentflow_core::ports::{ConsumerCheckpoint, ReservationStore, TransitionResult, VehicleCatalog};
use rentflow_core::reservation::{
    BookingPolicy, BookingRequest, DropOffFacts, NewReservation, Reservation,
};
use rentflow_core::types::{Money, ReservationId};
use std::sync::Arc;

/// What a saga confirmation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// PENDING became CONFIRMED.
    Confirmed,
    /// Already confirmed (or beyond), or the message was a replay.
    Duplicate,
    /// The reservation was cancelled or expired first; the payment is left as is.
    TerminalConflict,
}

/// Reservation service.
pub struct ReservationService {
    store: Arc<dyn ReservationStore>,
    catalog: Arc<dyn VehicleCatalog>,
    clock: Arc<dyn Clock>,
    policy: BookingPolicy,
}

impl ReservationService {
    /// Create a service over its collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn ReservationStore>,
        catalog: Arc<dyn VehicleCatalog>,
        clock: Arc<dyn Clock>,
        policy: BookingPolicy,
    ) -> Self {
        Self {
            store,
            catalog,
            clock,
            policy,
        }
    }

    /// Book a vehicle. The reservation starts PENDING.
    ///
    /// # Errors
    ///
    /// - [`RentalError::NotFound`] for an unknown vehicle
    /// - [`RentalError::Validation`] for an invalid window
    /// - [`RentalError::Conflict`] if a live reservation of the vehicle overlaps
    pub async fn create(&self, request: BookingRequest) -> Result<Reservation, RentalError> {
        let rate = self.catalog.daily_rate(request.vehicle_id).await?;
        let vehicle_id = request.vehicle_id;
        let new = NewReservation::from_request(request, rate, &self.policy, self.clock.now())?;

        let reservation = self.store.insert_guarded(new).await.map_err(|error| {
            let error = RentalError::from(error);
            if error.kind() == ErrorKind::Conflict {
                tracing::info!(%vehicle_id, reason = %error, "Booking refused");
            }
            error
        })?;

        metrics::record_reservation_status(reservation.status.as_str());
        tracing::info!(
            reservation_id = %reservation.id,
            vehicle_id = %reservation.vehicle_id,
            customer_id = %reservation.customer_id,
            total = %reservation.total_amount,
            "Reservation created"
        );
        Ok(reservation)
    }

    /// Load a reservation.
    ///
    /// # Errors
    ///
    /// Returns [`RentalError::NotFound`] if absent.
    pub async fn get(&self, id: ReservationId) -> Result<Reservation, RentalError> {
        Ok(self.store.get(id).await?)
    }

    /// Apply a payment confirmation delivered by the saga.
    ///
    /// The local change and the consumer checkpoint commit together, so a redelivered
    /// message is a no-op.
    ///
    /// # Errors
    ///
    /// - [`RentalError::NotFound`] for an unknown reservation
    /// - [`RentalError::Validation`] if `paid` is not the reservation total
    /// - [`RentalError::Transient`] on storage failure
    pub async fn confirm(
        &self,
        id: ReservationId,
        paid: Money,
        checkpoint: ConsumerCheckpoint,
    ) -> Result<Confirmation, RentalError> {
        let reservation = self.store.get(id).await?;
        if reservation.total_amount != paid {
            tracing::warn!(
                reservation_id = %id,
                %paid,
                total = %reservation.total_amount,
                "Payment amount does not match the reservation"
            );
            return Err(RentalError::Validation(format!(
                "payment of {paid} does not match total {} of reservation {id}",
                reservation.total_amount
            )));
        }

        match self
            .store
            .transition(id, ReservationEvent::Confirm, self.clock.now(), Some(checkpoint))
            .await?
        {
            TransitionResult::Replayed => {
                tracing::debug!(reservation_id = %id, "Confirmation already applied");
                Ok(Confirmation::Duplicate)
            },
            TransitionResult::Done { outcome, .. } => match outcome {
                TransitionOutcome::Applied { to, .. } => {
                    metrics::record_reservation_status(to.as_str());
                    tracing::info!(reservation_id = %id, "Reservation confirmed");
                    Ok(Confirmation::Confirmed)
                },
                TransitionOutcome::AlreadyApplied { status } => {
                    tracing::debug!(reservation_id = %id, %status, "Duplicate confirmation");
                    Ok(Confirmation::Duplicate)
                },
                TransitionOutcome::Conflict { current, .. } => {
                    tracing::warn!(
                        reservation_id = %id,
                        status = %current,
                        "Payment confirmed for a terminal reservation; no refund issued"
                    );
                    Ok(Confirmation::TerminalConflict)
                },
            },
        }
    }

    /// Staff: the customer collected the vehicle.
    ///
    /// # Errors
    ///
    /// Returns [`RentalError::Validation`] unless the reservation is CONFIRMED.
    pub async fn record_pickup(
        &self,
        id: ReservationId,
        at: DateTime<Utc>,
    ) -> Result<Reservation, RentalError> {
        self.staff_transition(id, ReservationEvent::PickUp { at }).await
    }

    /// Staff: the vehicle was returned and inspected.
    ///
    /// # Errors
    ///
    /// Returns [`RentalError::Validation`] unless the reservation is PICKED_UP, or if
    /// the drop-off precedes the pick-up.
    pub async fn finalize(
        &self,
        id: ReservationId,
        facts: DropOffFacts,
    ) -> Result<Reservation, RentalError> {
        self.staff_transition(id, ReservationEvent::Finalize(facts))
            .await
    }

    /// Staff or customer: cancel a PENDING or CONFIRMED reservation.
    ///
    /// # Errors
    ///
    /// Returns [`RentalError::Conflict`] if the reservation already expired and
    /// [`RentalError::Validation`] once the vehicle was picked up.
    pub async fn cancel(&self, id: ReservationId) -> Result<Reservation, RentalError> {
        self.staff_transition(id, ReservationEvent::Cancel).await
    }

    async fn staff_transition(
        &self,
        id: ReservationId,
        event: ReservationEvent,
    ) -> Result<Reservation, RentalError> {
        match self
            .store
            .transition(id, event, self.clock.now(), None)
            .await?
        {
            TransitionResult::Done {
                reservation,
                outcome,
            } => match outcome {
                TransitionOutcome::Applied { from, to } => {
                    metrics::record_reservation_status(to.as_str());
                    tracing::info!(reservation_id = %id, %from, %to, "Reservation updated");
                    Ok(reservation)
                },
                TransitionOutcome::AlreadyApplied { .. } => Ok(reservation),
                TransitionOutcome::Conflict { current, attempted } => Err(RentalError::Conflict(
                    format!("cannot {attempted} reservation {id}: it is already {current}"),
                )),
            },
            // No checkpoint was passed, so the store has nothing to replay against.
            TransitionResult::Replayed => self.get(id).await,
        }
    }

    /// PENDING reservations created at or before `created_before`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`RentalError::Transient`] on storage failure.
    pub async fn expirable(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reservation>, RentalError> {
        Ok(self.store.find_expirable(created_before, limit).await?)
    }

    /// Expire a PENDING reservation. Returns `false` if it moved on first (confirmed,
    /// cancelled or already expired).
    ///
    /// # Errors
    ///
    /// Returns [`RentalError::Transient`] on storage failure.
    pub async fn expire(&self, id: ReservationId) -> Result<bool, RentalError> {
        match self
            .store
            .transition(id, ReservationEvent::Expire, self.clock.now(), None)
            .await?
        {
            TransitionResult::Done {
                outcome: TransitionOutcome::Applied { to, .. },
                ..
            } => {
                metrics::record_reservation_status(to.as_str());
                metrics::record_reservation_expired();
                tracing::info!(reservation_id = %id, "Reservation expired");
                Ok(true)
            },
            TransitionResult::Done { outcome, .. } => {
                tracing::debug!(reservation_id = %id, ?outcome, "Reservation not expired");
                Ok(false)
            },
            TransitionResult::Replayed => Ok(false),
        }
    }

    /// Staff: delete a reservation in any status.
    ///
    /// # Errors
    ///
    /// Returns [`RentalError::NotFound`] if absent.
    pub async fn delete(&self, id: ReservationId) -> Result<(), RentalError> {
        self.store.delete(id).await?;
        tracing::info!(reservation_id = %id, "Reservation deleted");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rentflow_core::reservation::{DamageLevel, DirtinessLevel, ReservationStatus};
    use rentflow_core::stream::{StreamMessage, StreamPosition};
    use rentflow_core::types::{CustomerId, VehicleId};
    use rentflow_testing::mocks::parse;
    use rentflow_testing::{InMemoryReservationStore, InMemoryVehicleCatalog, ManualClock};

    const VEHICLE: VehicleId = VehicleId::new(1);

    fn service(clock: &ManualClock) -> (ReservationService, InMemoryReservationStore) {
        let store = InMemoryReservationStore::new();
        let catalog = InMemoryVehicleCatalog::new().with_vehicle(VEHICLE, Money::from_units(50));
        let service = ReservationService::new(
            Arc::new(store.clone()),
            Arc::new(catalog),
            Arc::new(clock.clone()),
            BookingPolicy::default(),
        );
        (service, store)
    }

    fn request(pick_up: &str, drop_off: &str) -> BookingRequest {
        BookingRequest {
            customer_id: CustomerId::new("alice"),
            vehicle_id: VEHICLE,
            pick_up: parse(pick_up),
            drop_off: parse(drop_off),
        }
    }

    fn checkpoint(offset: i64) -> ConsumerCheckpoint {
        ConsumerCheckpoint::new(
            "reservation-confirmation",
            &StreamMessage {
                position: StreamPosition {
                    topic: "payment.completed".to_string(),
                    partition: 0,
                    offset,
                },
                key: Some("MOCK-1".to_string()),
                payload: Vec::new(),
            },
        )
    }

    #[tokio::test]
    async fn booking_is_priced_and_pending() {
        let clock = ManualClock::at("2025-06-01T10:00:00Z");
        let (service, _) = service(&clock);

        let reservation = service
            .create(request("2025-06-02T10:00:00Z", "2025-06-04T09:00:00Z"))
            .await
            .unwrap();

        assert_eq!(reservation.status, ReservationStatus::Pending);
        assert_eq!(reservation.total_amount, Money::from_units(100));
        assert_eq!(reservation.created_at, clock.now());
    }

    #[tokio::test]
    async fn unknown_vehicle_is_not_found() {
        let clock = ManualClock::at("2025-06-01T10:00:00Z");
        let (service, _) = service(&clock);
        let mut booking = request("2025-06-02T10:00:00Z", "2025-06-03T10:00:00Z");
        booking.vehicle_id = VehicleId::new(99);

        let error = service.create(booking).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn staff_lifecycle_runs_to_completion() {
        let clock = ManualClock::at("2025-06-01T10:00:00Z");
        let (service, _) = service(&clock);
        let reservation = service
            .create(request("2025-06-01T12:00:00Z", "2025-06-01T14:00:00Z"))
            .await
            .unwrap();

        assert_eq!(
            service
                .confirm(reservation.id, reservation.total_amount, checkpoint(0))
                .await
                .unwrap(),
            Confirmation::Confirmed
        );
        service
            .record_pickup(reservation.id, parse("2025-06-01T12:05:00Z"))
            .await
            .unwrap();
        let done = service
            .finalize(
                reservation.id,
                DropOffFacts {
                    dropped_off_at: parse("2025-06-01T14:30:00Z"),
                    damage: DamageLevel::None,
                    dirtiness: DirtinessLevel::Clean,
                    accident: false,
                },
            )
            .await
            .unwrap();

        assert_eq!(done.status, ReservationStatus::Completed);
        let condition = done.condition.unwrap();
        assert!(condition.late_delivery);
        assert!(!condition.fee_due);
    }

    #[tokio::test]
    async fn cancelling_an_expired_reservation_is_a_conflict() {
        let clock = ManualClock::at("2025-06-01T10:00:00Z");
        let (service, _) = service(&clock);
        let reservation = service
            .create(request("2025-06-01T12:00:00Z", "2025-06-01T14:00:00Z"))
            .await
            .unwrap();

        assert!(service.expire(reservation.id).await.unwrap());
        assert!(!service.expire(reservation.id).await.unwrap());

        let error = service.cancel(reservation.id).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn pickup_before_confirmation_is_a_validation_error() {
        let clock = ManualClock::at("2025-06-01T10:00:00Z");
        let (service, _) = service(&clock);
        let reservation = service
            .create(request("2025-06-01T12:00:00Z", "2025-06-01T14:00:00Z"))
            .await
            .unwrap();

        let error = service
            .record_pickup(reservation.id, clock.now() + Duration::hours(2))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn late_confirmation_of_an_expired_reservation_is_swallowed() {
        let clock = ManualClock::at("2025-06-01T10:00:00Z");
        let (service, store) = service(&clock);
        let reservation = service
            .create(request("2025-06-01T12:00:00Z", "2025-06-01T14:00:00Z"))
            .await
            .unwrap();
        service.expire(reservation.id).await.unwrap();

        let outcome = service
            .confirm(reservation.id, reservation.total_amount, checkpoint(0))
            .await
            .unwrap();

        assert_eq!(outcome, Confirmation::TerminalConflict);
        assert_eq!(
            store.all()[0].status,
            ReservationStatus::Expired,
            "expiry is sticky"
        );
    }

    #[tokio::test]
    async fn confirmation_for_a_different_amount_is_refused() {
        let clock = ManualClock::at("2025-06-01T10:00:00Z");
        let (service, store) = service(&clock);
        let reservation = service
            .create(request("2025-06-01T12:00:00Z", "2025-06-01T14:00:00Z"))
            .await
            .unwrap();

        let error = service
            .confirm(reservation.id, Money::from_cents(1), checkpoint(0))
            .await
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Validation);
        assert_eq!(store.all()[0].status, ReservationStatus::Pending);
    }

    #[tokio::test]
    async fn deleted_reservation_is_gone() {
        let clock = ManualClock::at("2025-06-01T10:00:00Z");
        let (service, _) = service(&clock);
        let reservation = service
            .create(request("2025-06-01T12:00:00Z", "2025-06-01T14:00:00Z"))
            .await
            .unwrap();

        service.delete(reservation.id).await.unwrap();

        let error = service.get(reservation.id).await.unwrap_err();
        assert_eq!(error, RentalError::not_found("reservation", reservation.id));
        assert_eq!(
            service.delete(reservation.id).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }
}
