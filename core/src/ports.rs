//! Persistence and integration ports.
//!
//! Services depend on these traits only; adapters live in `rentflow-postgres`
//! (production) and `rentflow-testing` (in-memory). Like [`ChangeStream`], every
//! method returns a boxed future so the traits stay dyn-compatible.
//!
//! # Atomicity contract
//!
//! Each method is one local transaction. In particular:
//!
//! - [`ReservationStore::insert_guarded`] evaluates the overlap guard and inserts under
//!   a lock scoped to the vehicle
//! - [`ReservationStore::transition`] locks the row, runs
//!   [`lifecycle::apply`](crate::lifecycle::apply), writes the result, appends the
//!   snapshot to the reservation outbox and records the consumer checkpoint, all or
//!   nothing
//! - [`PaymentStore::complete_with_capture`] marks the payment COMPLETED and appends
//!   the capture fact, all or nothing
//!
//! [`ChangeStream`]: crate::stream::ChangeStream

use crate::error::StoreError;
use crate::lifecycle::{ReservationEvent, TransitionOutcome};
use crate::messages::{PaymentCompleted, ReservationChanged};
use crate::payment::{CaptureOutcome, NewPayment, PaymentRecord};
use crate::reservation::{NewReservation, Reservation};
use crate::stream::{StreamMessage, StreamPosition};
use crate::types::{GatewayToken, Money, PayerId, ReservationId, VehicleId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by port methods.
pub type PortFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Stream position a consumer commits together with its local change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerCheckpoint {
    /// Consumer name (one per service and topic)
    pub consumer: String,
    /// Position of the message being applied
    pub position: StreamPosition,
}

impl ConsumerCheckpoint {
    /// Checkpoint for `consumer` at the position of `message`.
    pub fn new(consumer: impl Into<String>, message: &StreamMessage) -> Self {
        Self {
            consumer: consumer.into(),
            position: message.position.clone(),
        }
    }
}

/// Result of [`ReservationStore::transition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// The state machine ran; `reservation` is the state after it.
    Done {
        /// Reservation after the call
        reservation: Reservation,
        /// What the state machine decided
        outcome: TransitionOutcome,
    },
    /// The checkpoint shows this message was already applied; nothing ran.
    Replayed,
}

/// Rental rates per vehicle.
pub trait VehicleCatalog: Send + Sync {
    /// Daily rate of a vehicle.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown vehicle.
    fn daily_rate(&self, vehicle: VehicleId) -> PortFuture<'_, Money>;
}

/// Authoritative reservation storage (Reservation service).
pub trait ReservationStore: Send + Sync {
    /// Run the overlap guard and insert as PENDING, atomically per vehicle.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] when a live reservation of the same vehicle
    /// overlaps the new window.
    fn insert_guarded(&self, reservation: NewReservation) -> PortFuture<'_, Reservation>;

    /// Load by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if absent.
    fn get(&self, id: ReservationId) -> PortFuture<'_, Reservation>;

    /// Apply `event` under the row lock. With a checkpoint, a message at or below the
    /// consumer's committed offset yields [`TransitionResult::Replayed`]. The snapshot
    /// appended for an applied event is stamped `at`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if absent and [`StoreError::Lifecycle`] if the
    /// state machine refuses the event.
    fn transition(
        &self,
        id: ReservationId,
        event: ReservationEvent,
        at: DateTime<Utc>,
        checkpoint: Option<ConsumerCheckpoint>,
    ) -> PortFuture<'_, TransitionResult>;

    /// PENDING reservations created at or before `created_before`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on storage failure.
    fn find_expirable(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> PortFuture<'_, Vec<Reservation>>;

    /// Staff deletion, any status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if absent.
    fn delete(&self, id: ReservationId) -> PortFuture<'_, ()>;
}

/// Read access to reservations owned by the Reservation service.
pub trait ReservationDirectory: Send + Sync {
    /// Current state of a reservation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if absent and [`StoreError::Unavailable`] when
    /// the owner cannot be reached.
    fn reservation(&self, id: ReservationId) -> PortFuture<'_, Reservation>;
}

/// Payment storage (Payment service).
pub trait PaymentStore: Send + Sync {
    /// Insert IN_PROGRESS.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if the reservation already has an active
    /// payment or the token is taken.
    fn open(&self, payment: NewPayment) -> PortFuture<'_, PaymentRecord>;

    /// Load by gateway token.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if absent.
    fn get_by_token(&self, token: GatewayToken) -> PortFuture<'_, PaymentRecord>;

    /// The reservation's non-cancelled payment, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on storage failure.
    fn find_active_for_reservation(
        &self,
        reservation: ReservationId,
    ) -> PortFuture<'_, Option<PaymentRecord>>;

    /// IN_PROGRESS → PAID with the approving payer; PAID is left as is.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if the payment is COMPLETED or CANCELLED.
    fn mark_paid(
        &self,
        token: GatewayToken,
        payer: PayerId,
        at: DateTime<Utc>,
    ) -> PortFuture<'_, PaymentRecord>;

    /// PAID → COMPLETED and append the capture fact, in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if the payment is not PAID or COMPLETED.
    fn complete_with_capture(
        &self,
        token: GatewayToken,
        payer: PayerId,
        at: DateTime<Utc>,
    ) -> PortFuture<'_, CaptureOutcome>;

    /// Open payment → CANCELLED; already CANCELLED is left as is.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if the payment is COMPLETED.
    fn cancel(&self, token: GatewayToken, at: DateTime<Utc>) -> PortFuture<'_, PaymentRecord>;

    /// Cancel the reservation's open payment, if any.
    ///
    /// Returns the cancelled record; a COMPLETED payment is left untouched and returned
    /// as is.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on storage failure.
    fn cancel_for_reservation(
        &self,
        reservation: ReservationId,
        at: DateTime<Utc>,
        checkpoint: Option<ConsumerCheckpoint>,
    ) -> PortFuture<'_, Option<PaymentRecord>>;

    /// Record that `payment.completed` was published for `token`, with the consumer
    /// checkpoint. Returns `false` when the checkpoint shows a replay.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the token is unknown.
    fn mark_completion_published(
        &self,
        token: GatewayToken,
        checkpoint: ConsumerCheckpoint,
    ) -> PortFuture<'_, bool>;
}

/// Row of an outbox waiting for the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRecord {
    /// Outbox row id, increases in commit order
    pub id: i64,
    /// Destination topic
    pub topic: String,
    /// Partition key
    pub key: String,
    /// JSON payload
    pub payload: Vec<u8>,
    /// Appended at
    pub created_at: DateTime<Utc>,
}

/// An outbox the relay drains.
pub trait OutboxSource: Send + Sync {
    /// Oldest unrelayed rows, in id order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on storage failure.
    fn fetch_unrelayed(&self, limit: usize) -> PortFuture<'_, Vec<OutboxRecord>>;

    /// Mark rows as published.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on storage failure.
    fn mark_relayed(&self, ids: Vec<i64>, at: DateTime<Utc>) -> PortFuture<'_, ()>;

    /// Delete rows relayed before `older_than`. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on storage failure.
    fn purge_relayed(&self, older_than: DateTime<Utc>) -> PortFuture<'_, u64>;
}

/// Counters exposed by the Analytics service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticsSummary {
    /// Replica reservations per status
    pub reservations_by_status: BTreeMap<String, u64>,
    /// Payments recorded in the revenue ledger
    pub payments_captured: u64,
    /// Sum of captured payments
    pub revenue_cents: u64,
}

/// Result of [`AnalyticsStore::confirm`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentRecorded {
    /// Revenue booked and `Confirm` run against the replica.
    Replica {
        /// Replica after the call
        reservation: Reservation,
        /// What the state machine decided
        outcome: TransitionOutcome,
    },
    /// Revenue booked; the replica has not seen the reservation yet. Its CONFIRMED
    /// snapshot follows on `reservation.events`.
    ReplicaPending,
    /// The checkpoint shows this message was already applied; nothing ran.
    Replayed,
}

/// Read replica of the Analytics service.
pub trait AnalyticsStore: Send + Sync {
    /// Upsert a reservation snapshot. An older version than the stored one is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on storage failure.
    fn upsert_snapshot(
        &self,
        change: ReservationChanged,
        checkpoint: ConsumerCheckpoint,
    ) -> PortFuture<'_, bool>;

    /// Record the payment in the revenue ledger, once per payment, and apply `Confirm`
    /// to the replica if it holds the reservation. Revenue never waits for the replica.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on storage failure.
    fn confirm(
        &self,
        payment: PaymentCompleted,
        checkpoint: ConsumerCheckpoint,
    ) -> PortFuture<'_, PaymentRecorded>;

    /// Current counters.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on storage failure.
    fn summary(&self) -> PortFuture<'_, AnalyticsSummary>;
}

/// Storage for messages a consumer gave up on.
pub trait DeadLetterSink: Send + Sync {
    /// Persist `message` with the reason it was rejected.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on storage failure.
    fn dead_letter<'a>(
        &'a self,
        consumer: &'a str,
        message: &'a StreamMessage,
        reason: &'a str,
    ) -> PortFuture<'a, ()>;
}

/// Order created at the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayOrder {
    /// Order token
    pub token: GatewayToken,
    /// Where to redirect the customer for approval
    pub approval_url: String,
}

/// Order status after a capture call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    /// Funds captured
    Completed,
    /// Provider declined the capture
    Declined,
}

/// Errors from the payment gateway.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// No answer within the configured timeout
    #[error("gateway timed out")]
    Timeout,

    /// Provider refused the request
    #[error("gateway rejected the request: {0}")]
    Rejected(String),

    /// Network failure
    #[error("gateway transport error: {0}")]
    Transport(String),

    /// Answer could not be understood
    #[error("unexpected gateway response: {0}")]
    InvalidResponse(String),
}

/// Client of the external payment provider.
///
/// Implementations bound every call by a timeout and never retry a capture.
pub trait PaymentGateway: Send + Sync {
    /// Open an order for `amount`, referencing `reservation`.
    ///
    /// # Errors
    ///
    /// Returns a [`GatewayError`] if the provider cannot be reached or refuses.
    fn create_order(
        &self,
        amount: Money,
        reservation: ReservationId,
    ) -> Pin<Box<dyn Future<Output = Result<GatewayOrder, GatewayError>> + Send + '_>>;

    /// Capture an approved order.
    ///
    /// # Errors
    ///
    /// Returns a [`GatewayError`] if the provider cannot be reached or refuses.
    fn capture_order<'a>(
        &'a self,
        token: &'a GatewayToken,
        payer: &'a PayerId,
    ) -> Pin<Box<dyn Future<Output = Result<CaptureStatus, GatewayError>> + Send + 'a>>;
}
