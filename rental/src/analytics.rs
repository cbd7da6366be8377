//! Analytics service: reservation replica and revenue ledger.

use crate::metrics;
use rentflow_core::error::RentalError;
use rentflow_core::lifecycle::TransitionOutcome;
use rentflow_core::messages::{PaymentCompleted, ReservationChanged};
use rentflow_core::ports::{AnalyticsStore, AnalyticsSummary, ConsumerCheckpoint, PaymentRecorded};
use std::sync::Arc;

/// Consumer name used for terminal-conflict metrics on the replica.
const REPLICA: &str = "analytics";

/// Analytics service.
pub struct AnalyticsService {
    store: Arc<dyn AnalyticsStore>,
}

impl AnalyticsService {
    /// Create a service over its store.
    #[must_use]
    pub fn new(store: Arc<dyn AnalyticsStore>) -> Self {
        Self { store }
    }

    /// Apply a reservation snapshot to the replica.
    ///
    /// # Errors
    ///
    /// Returns [`RentalError::Transient`] on storage failure.
    pub async fn record_snapshot(
        &self,
        change: ReservationChanged,
        checkpoint: ConsumerCheckpoint,
    ) -> Result<(), RentalError> {
        let id = change.reservation.id;
        let version = change.reservation.version;
        if self.store.upsert_snapshot(change, checkpoint).await? {
            tracing::debug!(reservation_id = %id, version, "Replica updated");
        }
        Ok(())
    }

    /// Book the revenue, once per payment, and confirm the replica reservation.
    ///
    /// The two Analytics consumers are not ordered against each other, so the payment
    /// may arrive before the first snapshot. The revenue is booked anyway and the
    /// replica catches up from `reservation.events`.
    ///
    /// # Errors
    ///
    /// Returns [`RentalError::Transient`] on storage failure.
    pub async fn record_payment(
        &self,
        payment: PaymentCompleted,
        checkpoint: ConsumerCheckpoint,
    ) -> Result<(), RentalError> {
        let id = payment.reservation_id;
        let token = payment.paypal_token.clone();
        match self.store.confirm(payment, checkpoint).await? {
            PaymentRecorded::Replica {
                outcome: TransitionOutcome::Conflict { current, .. },
                ..
            } => {
                metrics::record_terminal_conflict(REPLICA);
                tracing::warn!(
                    reservation_id = %id,
                    %token,
                    status = %current,
                    "Revenue recorded for a terminal reservation"
                );
            },
            PaymentRecorded::Replica { outcome, .. } => {
                tracing::debug!(reservation_id = %id, %token, ?outcome, "Payment recorded");
            },
            PaymentRecorded::ReplicaPending => {
                tracing::info!(
                    reservation_id = %id,
                    %token,
                    "Payment recorded before the reservation snapshot"
                );
            },
            PaymentRecorded::Replayed => {},
        }
        Ok(())
    }

    /// Counters per status and captured revenue.
    ///
    /// # Errors
    ///
    /// Returns [`RentalError::Transient`] on storage failure.
    pub async fn summary(&self) -> Result<AnalyticsSummary, RentalError> {
        Ok(self.store.summary().await?)
    }
}
