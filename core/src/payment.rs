//! Payment records and capture facts, owned by the Payment service.

use crate::error::RentalError;
use crate::types::{CustomerId, GatewayToken, Money, PayerId, PaymentId, ReservationId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a payment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    /// Gateway order opened, customer redirected
    InProgress,
    /// Customer approved at the gateway, capture pending
    Paid,
    /// Captured, capture fact recorded
    Completed,
    /// Aborted by the customer or released by reservation expiry
    Cancelled,
}

impl PaymentStatus {
    /// All statuses.
    pub const ALL: [Self; 4] = [Self::InProgress, Self::Paid, Self::Completed, Self::Cancelled];

    /// Database / wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Paid => "PAID",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Counts against the one-active-payment-per-reservation rule.
    #[must_use]
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Cancelled)
    }

    /// Can still be cancelled.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::InProgress | Self::Paid)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = RentalError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| RentalError::Validation(format!("unknown payment status '{value}'")))
    }
}

/// A payment for one reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    /// Surrogate id
    pub id: PaymentId,
    /// Gateway order token (unique)
    pub token: GatewayToken,
    /// Paid reservation
    pub reservation_id: ReservationId,
    /// Paying customer
    pub customer_id: CustomerId,
    /// Amount charged
    pub amount: Money,
    /// Lifecycle status
    pub status: PaymentStatus,
    /// Set when the customer approves
    pub payer_id: Option<PayerId>,
    /// The derived `payment.completed` message has been published
    pub completion_published: bool,
    /// Opened at
    pub created_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
}

/// Input for opening a payment after the gateway order exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPayment {
    /// Token returned by the gateway
    pub token: GatewayToken,
    /// Paid reservation
    pub reservation_id: ReservationId,
    /// Paying customer
    pub customer_id: CustomerId,
    /// Amount charged
    pub amount: Money,
    /// Opened at
    pub created_at: DateTime<Utc>,
}

/// Outbox row written in the same transaction that completes a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureEvent {
    /// Surrogate id, increases in commit order
    pub id: i64,
    /// Completed payment
    pub payment_id: PaymentId,
    /// Gateway token, the stream key
    pub gateway_token: GatewayToken,
    /// Payer who approved
    pub payer_id: PayerId,
    /// Paid reservation
    pub reservation_id: ReservationId,
    /// Written at
    pub created_at: DateTime<Utc>,
}

/// Result of recording a successful capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Payment moved to COMPLETED and the fact was appended.
    Recorded {
        /// Updated record
        payment: PaymentRecord,
        /// Appended outbox fact
        event: CaptureEvent,
    },
    /// Payment was already COMPLETED; nothing written.
    AlreadyCompleted(PaymentRecord),
}

impl CaptureOutcome {
    /// The payment record after the call.
    #[must_use]
    pub const fn payment(&self) -> &PaymentRecord {
        match self {
            Self::Recorded { payment, .. } | Self::AlreadyCompleted(payment) => payment,
        }
    }
}
