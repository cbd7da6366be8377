//! Messages carried on the change stream.
//!
//! Payloads are JSON. Field names of [`CaptureCompleted`] are fixed by the downstream
//! consumers and must not change.

use crate::payment::{CaptureEvent, PaymentRecord};
use crate::reservation::Reservation;
use crate::types::{GatewayToken, PayerId, PaymentId, ReservationId};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Topic of relayed capture facts, keyed by gateway token.
pub const CAPTURE_COMPLETED_TOPIC: &str = "payment.capture-completed";

/// Topic of payments durably marked COMPLETED, keyed by gateway token.
pub const PAYMENT_COMPLETED_TOPIC: &str = "payment.completed";

/// Topic of reservation snapshots, keyed by reservation id.
pub const RESERVATION_EVENTS_TOPIC: &str = "reservation.events";

/// Payload that could not be encoded or decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed {message} payload: {reason}")]
pub struct PayloadError {
    /// Message type
    pub message: &'static str,
    /// Decoder error
    pub reason: String,
}

/// A message type with a fixed topic and partition key.
pub trait StreamPayload: Serialize + DeserializeOwned {
    /// Short name used in errors and logs.
    const NAME: &'static str;

    /// Partition key; all messages for one saga instance share it.
    fn key(&self) -> String;

    /// Encode as JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError`] if serialization fails.
    fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        serde_json::to_vec(self).map_err(|e| PayloadError {
            message: Self::NAME,
            reason: e.to_string(),
        })
    }

    /// Decode from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError`] if the bytes are not a valid payload.
    fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        serde_json::from_slice(bytes).map_err(|e| PayloadError {
            message: Self::NAME,
            reason: e.to_string(),
        })
    }
}

/// `payment.capture-completed`: one per successful capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureCompleted {
    /// Gateway order token
    pub paypal_token: GatewayToken,
    /// Payer who approved
    pub payer_id: PayerId,
    /// Paid reservation
    pub reservation_id: ReservationId,
    /// When the fact was recorded
    pub created_at: DateTime<Utc>,
}

impl From<&CaptureEvent> for CaptureCompleted {
    fn from(event: &CaptureEvent) -> Self {
        Self {
            paypal_token: event.gateway_token.clone(),
            payer_id: event.payer_id.clone(),
            reservation_id: event.reservation_id,
            created_at: event.created_at,
        }
    }
}

impl StreamPayload for CaptureCompleted {
    const NAME: &'static str = "capture-completed";

    fn key(&self) -> String {
        self.paypal_token.to_string()
    }
}

/// `payment.completed`: derived once the Payment service confirmed its COMPLETED state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCompleted {
    /// Gateway order token
    pub paypal_token: GatewayToken,
    /// Completed payment
    pub payment_id: PaymentId,
    /// Paid reservation
    pub reservation_id: ReservationId,
    /// Captured amount
    pub amount_cents: u64,
    /// When the payment completed
    pub completed_at: DateTime<Utc>,
}

impl From<&PaymentRecord> for PaymentCompleted {
    fn from(payment: &PaymentRecord) -> Self {
        Self {
            paypal_token: payment.token.clone(),
            payment_id: payment.id,
            reservation_id: payment.reservation_id,
            amount_cents: payment.amount.cents(),
            completed_at: payment.updated_at,
        }
    }
}

impl StreamPayload for PaymentCompleted {
    const NAME: &'static str = "payment-completed";

    fn key(&self) -> String {
        self.paypal_token.to_string()
    }
}

/// `reservation.events`: full snapshot after every applied change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationChanged {
    /// Snapshot; `version` orders snapshots of one reservation
    pub reservation: Reservation,
    /// When the change was committed
    pub occurred_at: DateTime<Utc>,
}

impl StreamPayload for ReservationChanged {
    const NAME: &'static str = "reservation-changed";

    fn key(&self) -> String {
        self.reservation.id.to_string()
    }
}
