//! In-memory reservation store with its outbox.

use crate::offsets::Offsets;
use chrono::{DateTime, Utc};
use rentflow_core::error::StoreError;
use rentflow_core::lifecycle::{self, ReservationEvent};
use rentflow_core::messages::{RESERVATION_EVENTS_TOPIC, ReservationChanged, StreamPayload};
use rentflow_core::overlap;
use rentflow_core::ports::{
    ConsumerCheckpoint, OutboxRecord, OutboxSource, PortFuture, ReservationDirectory,
    ReservationStore, TransitionResult,
};
use rentflow_core::reservation::{NewReservation, Reservation, ReservationStatus};
use rentflow_core::types::ReservationId;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default)]
struct State {
    next_id: i64,
    reservations: BTreeMap<ReservationId, Reservation>,
    next_outbox_id: i64,
    outbox: Vec<(OutboxRecord, Option<DateTime<Utc>>)>,
    offsets: Offsets,
}

impl State {
    fn append_snapshot(
        &mut self,
        reservation: &Reservation,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let change = ReservationChanged {
            reservation: reservation.clone(),
            occurred_at: at,
        };
        let payload = change
            .encode()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.next_outbox_id += 1;
        self.outbox.push((
            OutboxRecord {
                id: self.next_outbox_id,
                topic: RESERVATION_EVENTS_TOPIC.to_string(),
                key: change.key(),
                payload,
                created_at: change.occurred_at,
            },
            None,
        ));
        Ok(())
    }
}

/// Reservation store whose operations stage a copy of the state and swap it in on
/// commit, so an injected commit failure leaves nothing behind.
///
/// The whole store is one critical section; that is what serializes the overlap
/// guard here.
#[derive(Debug, Clone, Default)]
pub struct InMemoryReservationStore {
    state: Arc<Mutex<State>>,
    failing_commits: Arc<AtomicUsize>,
}

impl InMemoryReservationStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail with [`StoreError::Unavailable`].
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// All reservations, by id.
    #[must_use]
    pub fn all(&self) -> Vec<Reservation> {
        self.state.lock().unwrap().reservations.values().cloned().collect()
    }

    /// Outbox rows, relayed or not.
    #[must_use]
    pub fn outbox_len(&self) -> usize {
        self.state.lock().unwrap().outbox.len()
    }

    fn write<T>(
        &self,
        operation: impl FnOnce(&mut State) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.state.lock().unwrap();
        let mut staged = guard.clone();
        let result = operation(&mut staged)?;
        let injected = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected commit failure".to_string()));
        }
        *guard = staged;
        Ok(result)
    }
}

impl ReservationStore for InMemoryReservationStore {
    fn insert_guarded(&self, reservation: NewReservation) -> PortFuture<'_, Reservation> {
        let result = self.write(|state| {
            let window = reservation.window();
            let conflicts =
                overlap::count_conflicts(state.reservations.values(), reservation.vehicle_id, &window);
            overlap::ensure_available(conflicts, reservation.vehicle_id, &window)?;

            state.next_id += 1;
            let stored = reservation.into_reservation(ReservationId::new(state.next_id));
            state.reservations.insert(stored.id, stored.clone());
            state.append_snapshot(&stored, stored.created_at)?;
            Ok(stored)
        });
        Box::pin(async move { result })
    }

    fn get(&self, id: ReservationId) -> PortFuture<'_, Reservation> {
        let result = self
            .state
            .lock()
            .unwrap()
            .reservations
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("reservation", id));
        Box::pin(async move { result })
    }

    fn transition(
        &self,
        id: ReservationId,
        event: ReservationEvent,
        at: DateTime<Utc>,
        checkpoint: Option<ConsumerCheckpoint>,
    ) -> PortFuture<'_, TransitionResult> {
        let result = self.write(|state| {
            if checkpoint.as_ref().is_some_and(|cp| state.offsets.is_replay(cp)) {
                return Ok(TransitionResult::Replayed);
            }

            let mut reservation = state
                .reservations
                .get(&id)
                .cloned()
                .ok_or_else(|| StoreError::not_found("reservation", id))?;
            let outcome = lifecycle::apply(&mut reservation, &event)?;
            if outcome.is_applied() {
                state.reservations.insert(id, reservation.clone());
                state.append_snapshot(&reservation, at)?;
            }
            if let Some(checkpoint) = &checkpoint {
                state.offsets.record(checkpoint);
            }
            Ok(TransitionResult::Done {
                reservation,
                outcome,
            })
        });
        Box::pin(async move { result })
    }

    fn find_expirable(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> PortFuture<'_, Vec<Reservation>> {
        let mut pending: Vec<Reservation> = self
            .state
            .lock()
            .unwrap()
            .reservations
            .values()
            .filter(|r| r.status == ReservationStatus::Pending && r.created_at <= created_before)
            .cloned()
            .collect();
        pending.sort_by_key(|r| (r.created_at, r.id));
        pending.truncate(limit);
        Box::pin(async move { Ok(pending) })
    }

    fn delete(&self, id: ReservationId) -> PortFuture<'_, ()> {
        let result = self.write(|state| {
            state
                .reservations
                .remove(&id)
                .map(|_| ())
                .ok_or_else(|| StoreError::not_found("reservation", id))
        });
        Box::pin(async move { result })
    }
}

impl ReservationDirectory for InMemoryReservationStore {
    fn reservation(&self, id: ReservationId) -> PortFuture<'_, Reservation> {
        self.get(id)
    }
}

impl OutboxSource for InMemoryReservationStore {
    fn fetch_unrelayed(&self, limit: usize) -> PortFuture<'_, Vec<OutboxRecord>> {
        let rows = unrelayed(&self.state.lock().unwrap().outbox, limit);
        Box::pin(async move { Ok(rows) })
    }

    fn mark_relayed(&self, ids: Vec<i64>, at: DateTime<Utc>) -> PortFuture<'_, ()> {
        mark(&mut self.state.lock().unwrap().outbox, &ids, at);
        Box::pin(async { Ok(()) })
    }

    fn purge_relayed(&self, older_than: DateTime<Utc>) -> PortFuture<'_, u64> {
        let purged = purge(&mut self.state.lock().unwrap().outbox, older_than);
        Box::pin(async move { Ok(purged) })
    }
}

pub(crate) fn unrelayed(
    outbox: &[(OutboxRecord, Option<DateTime<Utc>>)],
    limit: usize,
) -> Vec<OutboxRecord> {
    outbox
        .iter()
        .filter(|(_, relayed_at)| relayed_at.is_none())
        .take(limit)
        .map(|(record, _)| record.clone())
        .collect()
}

pub(crate) fn mark(
    outbox: &mut [(OutboxRecord, Option<DateTime<Utc>>)],
    ids: &[i64],
    at: DateTime<Utc>,
) {
    for (record, relayed_at) in outbox.iter_mut() {
        if relayed_at.is_none() && ids.contains(&record.id) {
            *relayed_at = Some(at);
        }
    }
}

pub(crate) fn purge(
    outbox: &mut Vec<(OutboxRecord, Option<DateTime<Utc>>)>,
    older_than: DateTime<Utc>,
) -> u64 {
    let before = outbox.len();
    outbox.retain(|(_, relayed_at)| relayed_at.is_none_or(|at| at >= older_than));
    (before - outbox.len()) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::parse;
    use rentflow_core::lifecycle::TransitionOutcome;
    use rentflow_core::types::{CustomerId, Money, VehicleId};
    use rentflow_core::stream::StreamPosition;

    fn booking(vehicle: i64, pick_up: &str, drop_off: &str) -> NewReservation {
        NewReservation {
            customer_id: CustomerId::new("cust-1"),
            vehicle_id: VehicleId::new(vehicle),
            created_at: parse("2025-06-01T10:00:00Z"),
            planned_pick_up: parse(pick_up),
            planned_drop_off: parse(drop_off),
            buffered_drop_off: parse(drop_off) + chrono::Duration::hours(1),
            total_amount: Money::from_units(50),
        }
    }

    fn confirmed_at() -> DateTime<Utc> {
        parse("2025-06-01T10:20:00Z")
    }

    fn checkpoint(offset: i64) -> ConsumerCheckpoint {
        ConsumerCheckpoint {
            consumer: "reservation-confirmation".to_string(),
            position: StreamPosition {
                topic: "payment.completed".to_string(),
                partition: 0,
                offset,
            },
        }
    }

    #[tokio::test]
    async fn overlapping_insert_is_a_conflict() {
        let store = InMemoryReservationStore::new();
        store
            .insert_guarded(booking(1, "2025-06-01T12:00:00Z", "2025-06-01T14:00:00Z"))
            .await
            .unwrap();

        let error = store
            .insert_guarded(booking(1, "2025-06-01T13:30:00Z", "2025-06-01T16:00:00Z"))
            .await
            .unwrap_err();

        assert!(matches!(error, StoreError::Conflict(_)));
        assert_eq!(store.all().len(), 1);
        assert_eq!(store.outbox_len(), 1);
    }

    #[tokio::test]
    async fn replayed_checkpoint_skips_the_state_machine() {
        let store = InMemoryReservationStore::new();
        let created = store
            .insert_guarded(booking(1, "2025-06-01T12:00:00Z", "2025-06-01T14:00:00Z"))
            .await
            .unwrap();

        let first = store
            .transition(created.id, ReservationEvent::Confirm, confirmed_at(), Some(checkpoint(4)))
            .await
            .unwrap();
        let again = store
            .transition(created.id, ReservationEvent::Confirm, confirmed_at(), Some(checkpoint(4)))
            .await
            .unwrap();

        assert!(matches!(
            first,
            TransitionResult::Done {
                outcome: TransitionOutcome::Applied { .. },
                ..
            }
        ));
        assert_eq!(again, TransitionResult::Replayed);
        assert_eq!(store.outbox_len(), 2);
    }

    #[tokio::test]
    async fn snapshots_carry_the_time_of_the_change() {
        let store = InMemoryReservationStore::new();
        let created = store
            .insert_guarded(booking(1, "2025-06-01T12:00:00Z", "2025-06-01T14:00:00Z"))
            .await
            .unwrap();
        store
            .transition(created.id, ReservationEvent::Confirm, confirmed_at(), None)
            .await
            .unwrap();

        let rows = store.fetch_unrelayed(10).await.unwrap();
        let stamps: Vec<_> = rows.iter().map(|row| row.created_at).collect();
        assert_eq!(stamps, vec![parse("2025-06-01T10:00:00Z"), confirmed_at()]);
        let confirmed = ReservationChanged::decode(&rows[1].payload).unwrap();
        assert_eq!(confirmed.occurred_at, confirmed_at());
    }

    #[tokio::test]
    async fn failed_commit_leaves_no_trace() {
        let store = InMemoryReservationStore::new();
        let created = store
            .insert_guarded(booking(1, "2025-06-01T12:00:00Z", "2025-06-01T14:00:00Z"))
            .await
            .unwrap();

        store.fail_next_commits(1);
        let error = store
            .transition(created.id, ReservationEvent::Confirm, confirmed_at(), Some(checkpoint(0)))
            .await
            .unwrap_err();

        assert!(matches!(error, StoreError::Unavailable(_)));
        assert_eq!(
            store.get(created.id).await.unwrap().status,
            ReservationStatus::Pending
        );
        assert_eq!(store.outbox_len(), 1);

        // The offset was not recorded either, so the retry applies.
        let retried = store
            .transition(created.id, ReservationEvent::Confirm, confirmed_at(), Some(checkpoint(0)))
            .await
            .unwrap();
        assert!(matches!(retried, TransitionResult::Done { .. }));
    }

    #[tokio::test]
    async fn relayed_rows_are_purged_after_retention() {
        let store = InMemoryReservationStore::new();
        store
            .insert_guarded(booking(1, "2025-06-01T12:00:00Z", "2025-06-01T14:00:00Z"))
            .await
            .unwrap();
        let rows = store.fetch_unrelayed(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].topic, RESERVATION_EVENTS_TOPIC);

        store
            .mark_relayed(vec![rows[0].id], parse("2025-06-01T10:00:00Z"))
            .await
            .unwrap();
        assert!(store.fetch_unrelayed(10).await.unwrap().is_empty());
        assert_eq!(
            store.purge_relayed(parse("2025-06-01T10:00:00Z")).await.unwrap(),
            0
        );
        assert_eq!(
            store.purge_relayed(parse("2025-06-02T10:00:00Z")).await.unwrap(),
            1
        );
    }
}
