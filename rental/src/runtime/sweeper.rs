//! Expiration sweeper.
//!
//! On every tick, PENDING reservations created at or before `now - threshold` are
//! expired through the state machine. A reservation confirmed in the meantime wins: the
//! row lock makes the sweeper see CONFIRMED and skip it. Failures are logged and the
//! next tick tries again.

use crate::reservations::ReservationService;
use chrono::Duration as ChronoDuration;
use rentflow_core::environment::Clock;
use rentflow_core::error::RentalError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Expires reservations that were never paid.
pub struct ExpirationSweeper {
    reservations: Arc<ReservationService>,
    clock: Arc<dyn Clock>,
    threshold: ChronoDuration,
    batch_size: usize,
}

impl ExpirationSweeper {
    /// Sweeper expiring reservations older than `threshold`, `batch_size` per tick.
    #[must_use]
    pub fn new(
        reservations: Arc<ReservationService>,
        clock: Arc<dyn Clock>,
        threshold: ChronoDuration,
        batch_size: usize,
    ) -> Self {
        Self {
            reservations,
            clock,
            threshold,
            batch_size,
        }
    }

    /// Run one sweep. Returns how many reservations were expired.
    ///
    /// A failure on one reservation does not stop the others.
    ///
    /// # Errors
    ///
    /// Returns [`RentalError::Transient`] if the candidates cannot be loaded.
    pub async fn sweep_once(&self) -> Result<usize, RentalError> {
        let cutoff = self.clock.now() - self.threshold;
        let candidates = self.reservations.expirable(cutoff, self.batch_size).await?;

        let mut expired = 0;
        for reservation in candidates {
            match self.reservations.expire(reservation.id).await {
                Ok(true) => expired += 1,
                Ok(false) => {},
                Err(e) => tracing::warn!(
                    reservation_id = %reservation.id,
                    error = %e,
                    "Failed to expire reservation"
                ),
            }
        }

        if expired > 0 {
            tracing::info!(expired, %cutoff, "Sweep finished");
        }
        Ok(expired)
    }

    /// Spawn the sweeper, ticking every `interval`.
    #[must_use]
    pub fn spawn(
        self,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(threshold = %self.threshold, ?interval, "Expiration sweeper started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            tracing::error!(error = %e, "Sweep failed");
                        }
                    },
                }
            }
            tracing::info!("Expiration sweeper stopped");
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rentflow_core::reservation::{BookingPolicy, BookingRequest, ReservationStatus};
    use rentflow_core::types::{CustomerId, Money, VehicleId};
    use rentflow_testing::mocks::parse;
    use rentflow_testing::{InMemoryReservationStore, InMemoryVehicleCatalog, ManualClock};

    fn sweeper(
        clock: &ManualClock,
    ) -> (ExpirationSweeper, Arc<ReservationService>, InMemoryReservationStore) {
        let store = InMemoryReservationStore::new();
        let catalog =
            InMemoryVehicleCatalog::new().with_vehicle(VehicleId::new(1), Money::from_units(50));
        let reservations = Arc::new(ReservationService::new(
            Arc::new(store.clone()),
            Arc::new(catalog),
            Arc::new(clock.clone()),
            BookingPolicy::default(),
        ));
        let sweeper = ExpirationSweeper::new(
            Arc::clone(&reservations),
            Arc::new(clock.clone()),
            ChronoDuration::minutes(30),
            100,
        );
        (sweeper, reservations, store)
    }

    fn booking() -> BookingRequest {
        BookingRequest {
            customer_id: CustomerId::new("alice"),
            vehicle_id: VehicleId::new(1),
            pick_up: parse("2025-06-01T12:00:00Z"),
            drop_off: parse("2025-06-01T14:00:00Z"),
        }
    }

    #[tokio::test]
    async fn reservation_expires_at_the_threshold_and_not_before() {
        let clock = ManualClock::at("2025-06-01T10:00:00Z");
        let (sweeper, _, store) = sweeper(&clock);
        sweeper.reservations.create(booking()).await.unwrap();

        clock.set(parse("2025-06-01T10:29:59Z"));
        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);
        assert_eq!(store.all()[0].status, ReservationStatus::Pending);

        clock.set(parse("2025-06-01T10:30:00Z"));
        assert_eq!(sweeper.sweep_once().await.unwrap(), 1);
        assert_eq!(store.all()[0].status, ReservationStatus::Expired);

        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cancelled_reservation_is_left_alone() {
        let clock = ManualClock::at("2025-06-01T10:00:00Z");
        let (sweeper, reservations, store) = sweeper(&clock);
        let reservation = reservations.create(booking()).await.unwrap();
        reservations.cancel(reservation.id).await.unwrap();

        clock.advance(ChronoDuration::hours(1));
        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);
        assert_eq!(store.all()[0].status, ReservationStatus::Cancelled);
    }
}
