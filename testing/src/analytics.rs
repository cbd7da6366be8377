//! In-memory analytics replica and revenue ledger.

use crate::offsets::Offsets;
use rentflow_core::error::StoreError;
use rentflow_core::lifecycle::{self, ReservationEvent};
use rentflow_core::messages::{PaymentCompleted, ReservationChanged};
use rentflow_core::ports::{
    AnalyticsStore, AnalyticsSummary, ConsumerCheckpoint, PaymentRecorded, PortFuture,
};
use rentflow_core::reservation::Reservation;
use rentflow_core::types::{PaymentId, ReservationId};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct State {
    replicas: BTreeMap<ReservationId, Reservation>,
    revenue: BTreeMap<PaymentId, u64>,
    offsets: Offsets,
}

/// Analytics read replica kept in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAnalyticsStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryAnalyticsStore {
    /// Empty replica.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replica row, if present.
    #[must_use]
    pub fn replica(&self, id: ReservationId) -> Option<Reservation> {
        self.state.lock().unwrap().replicas.get(&id).cloned()
    }
}

impl AnalyticsStore for InMemoryAnalyticsStore {
    fn upsert_snapshot(
        &self,
        change: ReservationChanged,
        checkpoint: ConsumerCheckpoint,
    ) -> PortFuture<'_, bool> {
        let mut state = self.state.lock().unwrap();
        let applied = if state.offsets.is_replay(&checkpoint) {
            false
        } else {
            let snapshot = change.reservation;
            let newer = state
                .replicas
                .get(&snapshot.id)
                .is_none_or(|current| snapshot.version >= current.version);
            if newer {
                state.replicas.insert(snapshot.id, snapshot);
            }
            state.offsets.record(&checkpoint);
            newer
        };
        drop(state);
        Box::pin(async move { Ok(applied) })
    }

    fn confirm(
        &self,
        payment: PaymentCompleted,
        checkpoint: ConsumerCheckpoint,
    ) -> PortFuture<'_, PaymentRecorded> {
        let result = (|| -> Result<PaymentRecorded, StoreError> {
            let mut state = self.state.lock().unwrap();
            if state.offsets.is_replay(&checkpoint) {
                return Ok(PaymentRecorded::Replayed);
            }
            let recorded = match state.replicas.get(&payment.reservation_id).cloned() {
                Some(mut reservation) => {
                    let outcome = lifecycle::apply(&mut reservation, &ReservationEvent::Confirm)?;
                    if outcome.is_applied() {
                        state.replicas.insert(reservation.id, reservation.clone());
                    }
                    PaymentRecorded::Replica {
                        reservation,
                        outcome,
                    }
                },
                None => PaymentRecorded::ReplicaPending,
            };
            state
                .revenue
                .entry(payment.payment_id)
                .or_insert(payment.amount_cents);
            state.offsets.record(&checkpoint);
            Ok(recorded)
        })();
        Box::pin(async move { result })
    }

    fn summary(&self) -> PortFuture<'_, AnalyticsSummary> {
        let state = self.state.lock().unwrap();
        let mut summary = AnalyticsSummary::default();
        for reservation in state.replicas.values() {
            *summary
                .reservations_by_status
                .entry(reservation.status.as_str().to_string())
                .or_default() += 1;
        }
        summary.payments_captured = state.revenue.len() as u64;
        summary.revenue_cents = state.revenue.values().sum();
        drop(state);
        Box::pin(async move { Ok(summary) })
    }
}
