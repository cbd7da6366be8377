//! Booking-overlap guard.
//!
//! A vehicle may not carry two live reservations whose
//! `[planned_pick_up, buffered_drop_off)` windows intersect. The predicate lives here;
//! stores evaluate it inside the same transaction as the insert, serialized per
//! vehicle, so two concurrent requests cannot both observe an empty calendar.

use crate::error::{RentalError, StoreError};
use crate::reservation::Reservation;
use crate::types::VehicleId;
use chrono::{DateTime, Utc};

/// Half-open time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl BookingWindow {
    /// Build a window, rejecting empty or inverted ones.
    ///
    /// # Errors
    ///
    /// Returns [`RentalError::Validation`] if `end <= start`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, RentalError> {
        if end <= start {
            return Err(RentalError::Validation(format!(
                "window end {end} is not after start {start}"
            )));
        }
        Ok(Self { start, end })
    }

    pub(crate) const fn from_bounds(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Inclusive start.
    #[must_use]
    pub const fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Exclusive end.
    #[must_use]
    pub const fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Whether two half-open windows share at least one instant.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Count live reservations of `vehicle` that collide with `window`.
pub fn count_conflicts<'a>(
    reservations: impl IntoIterator<Item = &'a Reservation>,
    vehicle: VehicleId,
    window: &BookingWindow,
) -> usize {
    reservations
        .into_iter()
        .filter(|existing| {
            existing.vehicle_id == vehicle
                && existing.status.blocks_vehicle()
                && existing.window().overlaps(window)
        })
        .count()
}

/// Fail with a conflict when `count` collisions were found.
///
/// # Errors
///
/// Returns [`StoreError::Conflict`] when `count > 0`.
pub fn ensure_available(
    count: usize,
    vehicle: VehicleId,
    window: &BookingWindow,
) -> Result<(), StoreError> {
    if count == 0 {
        Ok(())
    } else {
        Err(StoreError::Conflict(format!(
            "vehicle {vehicle} already has {count} active reservation(s) overlapping [{}, {})",
            window.start, window.end
        )))
    }
}
