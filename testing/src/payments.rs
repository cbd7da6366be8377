//! In-memory payment store with the capture-fact outbox.

use crate::offsets::Offsets;
use crate::reservations::{mark, purge, unrelayed};
use chrono::{DateTime, Utc};
use rentflow_core::error::StoreError;
use rentflow_core::messages::{CAPTURE_COMPLETED_TOPIC, CaptureCompleted, StreamPayload};
use rentflow_core::payment::{
    CaptureEvent, CaptureOutcome, NewPayment, PaymentRecord, PaymentStatus,
};
use rentflow_core::ports::{ConsumerCheckpoint, OutboxRecord, OutboxSource, PaymentStore, PortFuture};
use rentflow_core::types::{GatewayToken, PayerId, PaymentId, ReservationId};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default)]
struct State {
    next_id: i64,
    payments: BTreeMap<PaymentId, PaymentRecord>,
    next_event_id: i64,
    capture_events: Vec<CaptureEvent>,
    outbox: Vec<(OutboxRecord, Option<DateTime<Utc>>)>,
    offsets: Offsets,
}

impl State {
    fn by_token(&mut self, token: &GatewayToken) -> Result<&mut PaymentRecord, StoreError> {
        self.payments
            .values_mut()
            .find(|payment| &payment.token == token)
            .ok_or_else(|| StoreError::not_found("payment", token))
    }

    fn active_for(&mut self, reservation: ReservationId) -> Option<&mut PaymentRecord> {
        self.payments
            .values_mut()
            .find(|payment| payment.reservation_id == reservation && payment.status.is_active())
    }
}

fn conflict(payment: &PaymentRecord, action: &str) -> StoreError {
    StoreError::Conflict(format!(
        "cannot {action} payment {} in status {}",
        payment.token, payment.status
    ))
}

/// Payment store with the same staged-commit behavior as
/// [`InMemoryReservationStore`](crate::InMemoryReservationStore).
///
/// [`fail_next_commits`](Self::fail_next_commits) simulates a crash at the commit
/// boundary: neither the status change nor the capture fact become visible.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentStore {
    state: Arc<Mutex<State>>,
    failing_commits: Arc<AtomicUsize>,
}

impl InMemoryPaymentStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail with [`StoreError::Unavailable`].
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Every capture fact ever appended, relayed or purged included.
    #[must_use]
    pub fn capture_events(&self) -> Vec<CaptureEvent> {
        self.state.lock().unwrap().capture_events.clone()
    }

    /// All payment records.
    #[must_use]
    pub fn all(&self) -> Vec<PaymentRecord> {
        self.state.lock().unwrap().payments.values().cloned().collect()
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

impl PaymentStore for InMemoryPaymentStore {
    fn open(&self, payment: NewPayment) -> PortFuture<'_, PaymentRecord> {
        let result = self.write(|state| {
            if state.active_for(payment.reservation_id).is_some() {
                return Err(StoreError::Conflict(format!(
                    "reservation {} already has an active payment",
                    payment.reservation_id
                )));
            }
            if state.by_token(&payment.token).is_ok() {
                return Err(StoreError::Conflict(format!(
                    "gateway token {} already used",
                    payment.token
                )));
            }
            state.next_id += 1;
            let record = PaymentRecord {
                id: PaymentId::new(state.next_id),
                token: payment.token,
                reservation_id: payment.reservation_id,
                customer_id: payment.customer_id,
                amount: payment.amount,
                status: PaymentStatus::InProgress,
                payer_id: None,
                completion_published: false,
                created_at: payment.created_at,
                updated_at: payment.created_at,
            };
            state.payments.insert(record.id, record.clone());
            Ok(record)
        });
        Box::pin(async move { result })
    }

    fn get_by_token(&self, token: GatewayToken) -> PortFuture<'_, PaymentRecord> {
        let result = self
            .state
            .lock()
            .unwrap()
            .by_token(&token)
            .map(|payment| payment.clone());
        Box::pin(async move { result })
    }

    fn find_active_for_reservation(
        &self,
        reservation: ReservationId,
    ) -> PortFuture<'_, Option<PaymentRecord>> {
        let found = self
            .state
            .lock()
            .unwrap()
            .active_for(reservation)
            .map(|payment| payment.clone());
        Box::pin(async move { Ok(found) })
    }

    fn mark_paid(
        &self,
        token: GatewayToken,
        payer: PayerId,
        at: DateTime<Utc>,
    ) -> PortFuture<'_, PaymentRecord> {
        let result = self.write(|state| {
            let payment = state.by_token(&token)?;
            match payment.status {
                PaymentStatus::InProgress => {
                    payment.status = PaymentStatus::Paid;
                    payment.payer_id = Some(payer);
                    payment.updated_at = at;
                    Ok(payment.clone())
                },
                PaymentStatus::Paid => Ok(payment.clone()),
                PaymentStatus::Completed | PaymentStatus::Cancelled => {
                    Err(conflict(payment, "approve"))
                },
            }
        });
        Box::pin(async move { result })
    }

    fn complete_with_capture(
        &self,
        token: GatewayToken,
        payer: PayerId,
        at: DateTime<Utc>,
    ) -> PortFuture<'_, CaptureOutcome> {
        let result = self.write(|state| {
            let payment = state.by_token(&token)?;
            match payment.status {
                PaymentStatus::Completed => {
                    return Ok(CaptureOutcome::AlreadyCompleted(payment.clone()));
                },
                PaymentStatus::InProgress | PaymentStatus::Cancelled => {
                    return Err(conflict(payment, "complete"));
                },
                PaymentStatus::Paid => {},
            }
            payment.status = PaymentStatus::Completed;
            payment.payer_id = Some(payer.clone());
            payment.updated_at = at;
            let payment = payment.clone();

            state.next_event_id += 1;
            let event = CaptureEvent {
                id: state.next_event_id,
                payment_id: payment.id,
                gateway_token: payment.token.clone(),
                payer_id: payer,
                reservation_id: payment.reservation_id,
                created_at: at,
            };
            let message = CaptureCompleted::from(&event);
            let payload = message
                .encode()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            state.outbox.push((
                OutboxRecord {
                    id: event.id,
                    topic: CAPTURE_COMPLETED_TOPIC.to_string(),
                    key: message.key(),
                    payload,
                    created_at: at,
                },
                None,
            ));
            state.capture_events.push(event.clone());
            Ok(CaptureOutcome::Recorded { payment, event })
        });
        Box::pin(async move { result })
    }

    fn cancel(&self, token: GatewayToken, at: DateTime<Utc>) -> PortFuture<'_, PaymentRecord> {
        let result = self.write(|state| {
            let payment = state.by_token(&token)?;
            match payment.status {
                PaymentStatus::InProgress | PaymentStatus::Paid => {
                    payment.status = PaymentStatus::Cancelled;
                    payment.updated_at = at;
                    Ok(payment.clone())
                },
                PaymentStatus::Cancelled => Ok(payment.clone()),
                PaymentStatus::Completed => Err(conflict(payment, "cancel")),
            }
        });
        Box::pin(async move { result })
    }

    fn cancel_for_reservation(
        &self,
        reservation: ReservationId,
        at: DateTime<Utc>,
        checkpoint: Option<ConsumerCheckpoint>,
    ) -> PortFuture<'_, Option<PaymentRecord>> {
        let result = self.write(|state| {
            if checkpoint.as_ref().is_some_and(|cp| state.offsets.is_replay(cp)) {
                return Ok(None);
            }
            let cancelled = state.active_for(reservation).map(|payment| {
                if payment.status.is_open() {
                    payment.status = PaymentStatus::Cancelled;
                    payment.updated_at = at;
                }
                payment.clone()
            });
            if let Some(checkpoint) = &checkpoint {
                state.offsets.record(checkpoint);
            }
            Ok(cancelled)
        });
        Box::pin(async move { result })
    }

    fn mark_completion_published(
        &self,
        token: GatewayToken,
        checkpoint: ConsumerCheckpoint,
    ) -> PortFuture<'_, bool> {
        let result = self.write(|state| {
            if state.offsets.is_replay(&checkpoint) {
                return Ok(false);
            }
            state.by_token(&token)?.completion_published = true;
            state.offsets.record(&checkpoint);
            Ok(true)
        });
        Box::pin(async move { result })
    }
}

impl OutboxSource for InMemoryPaymentStore {
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
