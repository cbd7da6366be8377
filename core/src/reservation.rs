//! Reservation aggregate and booking rules.

use crate::error::RentalError;
use crate::overlap::BookingWindow;
use crate::types::{CustomerId, Money, ReservationId, VehicleId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    /// Created, waiting for payment
    Pending,
    /// Payment captured
    Confirmed,
    /// Customer has the vehicle
    PickedUp,
    /// Vehicle returned and inspected
    Completed,
    /// Cancelled by staff or customer
    Cancelled,
    /// Never paid, expired by the sweeper
    Expired,
}

impl ReservationStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 6] = [
        Self::Pending,
        Self::Confirmed,
        Self::PickedUp,
        Self::Completed,
        Self::Cancelled,
        Self::Expired,
    ];

    /// Database / wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Confirmed => "CONFIRMED",
            Self::PickedUp => "PICKED_UP",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::Expired => "EXPIRED",
        }
    }

    /// No business transition leaves this state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Expired)
    }

    /// Whether a reservation in this state still claims its vehicle window.
    #[must_use]
    pub const fn blocks_vehicle(self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed | Self::PickedUp)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = RentalError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| RentalError::Validation(format!("unknown reservation status '{value}'")))
    }
}

/// Damage found at drop-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DamageLevel {
    /// No damage
    #[default]
    None,
    /// Scratches
    Minor,
    /// Dents, broken lights
    Moderate,
    /// Not drivable
    Severe,
}

/// Cleanliness found at drop-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DirtinessLevel {
    /// As handed over
    #[default]
    Clean,
    /// Usual wear
    Normal,
    /// Needs cleaning
    Dirty,
    /// Needs professional cleaning
    VeryDirty,
}

/// What staff record when the vehicle comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropOffFacts {
    /// Actual drop-off time
    pub dropped_off_at: DateTime<Utc>,
    /// Damage level
    #[serde(default)]
    pub damage: DamageLevel,
    /// Dirtiness level
    #[serde(default)]
    pub dirtiness: DirtinessLevel,
    /// Vehicle was involved in an accident
    #[serde(default)]
    pub accident: bool,
}

/// Post-return condition report, persisted only at finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionReport {
    /// Damage level
    pub damage: DamageLevel,
    /// Dirtiness level
    pub dirtiness: DirtinessLevel,
    /// Returned after the planned drop-off
    pub late_delivery: bool,
    /// An extra fee applies (past the grace period, damage, dirt or accident)
    pub fee_due: bool,
    /// Vehicle was involved in an accident
    pub accident: bool,
}

/// A booking of one vehicle for one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Surrogate id
    pub id: ReservationId,
    /// Who booked
    pub customer_id: CustomerId,
    /// Booked vehicle
    pub vehicle_id: VehicleId,
    /// Creation time, drives expiry
    pub created_at: DateTime<Utc>,
    /// Planned pick-up
    pub planned_pick_up: DateTime<Utc>,
    /// Planned drop-off
    pub planned_drop_off: DateTime<Utc>,
    /// Planned drop-off plus the grace period
    pub buffered_drop_off: DateTime<Utc>,
    /// Recorded by staff at pick-up
    pub actual_pick_up: Option<DateTime<Utc>>,
    /// Recorded by staff at finalization
    pub actual_drop_off: Option<DateTime<Utc>>,
    /// Lifecycle status
    pub status: ReservationStatus,
    /// Daily rate times rental days
    pub total_amount: Money,
    /// Set only by finalization
    pub condition: Option<ConditionReport>,
    /// Incremented on every applied transition
    pub version: i64,
}

impl Reservation {
    /// Window this reservation claims on its vehicle.
    #[must_use]
    pub const fn window(&self) -> BookingWindow {
        BookingWindow::from_bounds(self.planned_pick_up, self.buffered_drop_off)
    }
}

/// Customer input for a booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    /// Who books
    pub customer_id: CustomerId,
    /// Vehicle to book
    pub vehicle_id: VehicleId,
    /// Planned pick-up
    pub pick_up: DateTime<Utc>,
    /// Planned drop-off
    pub drop_off: DateTime<Utc>,
}

/// Booking rules configured per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingPolicy {
    /// Added to the planned drop-off for overlap checks
    pub grace_period: Duration,
    /// Longest rental accepted
    pub max_rental_days: i64,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            grace_period: Duration::hours(1),
            max_rental_days: 90,
        }
    }
}

/// A validated reservation that has not been stored yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    /// Who booked
    pub customer_id: CustomerId,
    /// Booked vehicle
    pub vehicle_id: VehicleId,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Planned pick-up
    pub planned_pick_up: DateTime<Utc>,
    /// Planned drop-off
    pub planned_drop_off: DateTime<Utc>,
    /// Planned drop-off plus the grace period
    pub buffered_drop_off: DateTime<Utc>,
    /// Daily rate times rental days
    pub total_amount: Money,
}

impl NewReservation {
    /// Validate a booking request and price it.
    ///
    /// # Errors
    ///
    /// Returns [`RentalError::Validation`] if the window is empty or inverted, starts in
    /// the past, exceeds the policy's maximum length, or the price overflows.
    pub fn from_request(
        request: BookingRequest,
        daily_rate: Money,
        policy: &BookingPolicy,
        now: DateTime<Utc>,
    ) -> Result<Self, RentalError> {
        if request.drop_off <= request.pick_up {
            return Err(RentalError::Validation(
                "drop-off must be after pick-up".to_string(),
            ));
        }
        if request.pick_up < now {
            return Err(RentalError::Validation(
                "pick-up must not be in the past".to_string(),
            ));
        }

        let days = rental_days(request.pick_up, request.drop_off);
        if days > policy.max_rental_days {
            return Err(RentalError::Validation(format!(
                "rental of {days} days exceeds the maximum of {}",
                policy.max_rental_days
            )));
        }

        let total_amount = u64::try_from(days)
            .ok()
            .and_then(|days| daily_rate.checked_mul(days))
            .ok_or_else(|| RentalError::Validation("total amount overflows".to_string()))?;

        Ok(Self {
            customer_id: request.customer_id,
            vehicle_id: request.vehicle_id,
            created_at: now,
            planned_pick_up: request.pick_up,
            planned_drop_off: request.drop_off,
            buffered_drop_off: request.drop_off + policy.grace_period,
            total_amount,
        })
    }

    /// Window the new reservation will claim.
    #[must_use]
    pub const fn window(&self) -> BookingWindow {
        BookingWindow::from_bounds(self.planned_pick_up, self.buffered_drop_off)
    }

    /// Materialize with the id assigned by the store.
    #[must_use]
    pub fn into_reservation(self, id: ReservationId) -> Reservation {
        Reservation {
            id,
            customer_id: self.customer_id,
            vehicle_id: self.vehicle_id,
            created_at: self.created_at,
            planned_pick_up: self.planned_pick_up,
            planned_drop_off: self.planned_drop_off,
            buffered_drop_off: self.buffered_drop_off,
            actual_pick_up: None,
            actual_drop_off: None,
            status: ReservationStatus::Pending,
            total_amount: self.total_amount,
            condition: None,
            version: 1,
        }
    }
}

/// Started 24 hour periods between pick-up and drop-off, at least one.
#[must_use]
pub fn rental_days(pick_up: DateTime<Utc>, drop_off: DateTime<Utc>) -> i64 {
    let minutes = (drop_off - pick_up).num_minutes().max(1);
    ((minutes + 1439) / 1440).max(1)
}
