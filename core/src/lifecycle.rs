//! Reservation state machine.
//!
//! [`apply`] is the single entry point for every status change: the saga (payment
//! confirmed), staff actions (pick-up, finalize, cancel) and the expiration sweeper all
//! go through it, so the rules below hold no matter who is writing.
//!
//! ```text
//! PENDING ──Confirm──► CONFIRMED ──PickUp──► PICKED_UP ──Finalize──► COMPLETED
//!    │                     │
//!    ├──Expire──► EXPIRED  └──Cancel──► CANCELLED
//!    └──Cancel──► CANCELLED
//! ```
//!
//! The table is total. Every (status, event) pair yields exactly one of:
//!
//! - [`TransitionOutcome::Applied`]: the reservation was mutated and its version bumped
//! - [`TransitionOutcome::AlreadyApplied`]: redelivery of something already reflected,
//!   nothing to write
//! - [`TransitionOutcome::Conflict`]: a different terminal transition won first
//! - [`LifecycleError::Illegal`]: the request makes no sense in this state

use crate::reservation::{
    ConditionReport, DamageLevel, DirtinessLevel, DropOffFacts, Reservation, ReservationStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Something that may move a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReservationEvent {
    /// Payment captured (saga)
    Confirm,
    /// Customer collected the vehicle (staff)
    PickUp {
        /// Actual pick-up time
        at: DateTime<Utc>,
    },
    /// Vehicle returned and inspected (staff)
    Finalize(DropOffFacts),
    /// Cancelled (staff or customer)
    Cancel,
    /// Never paid in time (sweeper)
    Expire,
}

impl ReservationEvent {
    /// Discriminant without payload.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Confirm => EventKind::Confirm,
            Self::PickUp { .. } => EventKind::PickUp,
            Self::Finalize(_) => EventKind::Finalize,
            Self::Cancel => EventKind::Cancel,
            Self::Expire => EventKind::Expire,
        }
    }
}

/// [`ReservationEvent`] without its payload, for logs and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// See [`ReservationEvent::Confirm`]
    Confirm,
    /// See [`ReservationEvent::PickUp`]
    PickUp,
    /// See [`ReservationEvent::Finalize`]
    Finalize,
    /// See [`ReservationEvent::Cancel`]
    Cancel,
    /// See [`ReservationEvent::Expire`]
    Expire,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Confirm => "confirm",
            Self::PickUp => "pick-up",
            Self::Finalize => "finalize",
            Self::Cancel => "cancel",
            Self::Expire => "expire",
        };
        f.write_str(name)
    }
}

/// Result of feeding an event to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The reservation changed.
    Applied {
        /// Status before
        from: ReservationStatus,
        /// Status after
        to: ReservationStatus,
    },
    /// Already reflected; nothing changed.
    AlreadyApplied {
        /// Current status
        status: ReservationStatus,
    },
    /// A terminal transition already won; nothing changed.
    Conflict {
        /// Current (sticky) status
        current: ReservationStatus,
        /// Event that lost
        attempted: EventKind,
    },
}

impl TransitionOutcome {
    /// Whether the reservation was mutated and must be written.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Transitions the state machine refuses outright.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// Event makes no sense in the current status.
    #[error("cannot {event} a {current} reservation")]
    Illegal {
        /// Current status
        current: ReservationStatus,
        /// Refused event
        event: EventKind,
    },

    /// Event payload contradicts recorded facts.
    #[error("invalid facts: {0}")]
    InvalidFacts(String),
}

/// Apply `event` to `reservation`.
///
/// On [`TransitionOutcome::Applied`] the reservation is mutated in place and its
/// `version` incremented; in every other case it is left untouched.
///
/// # Errors
///
/// Returns [`LifecycleError::Illegal`] for staff requests that do not fit the current
/// status, and [`LifecycleError::InvalidFacts`] for a drop-off before the pick-up.
pub fn apply(
    reservation: &mut Reservation,
    event: &ReservationEvent,
) -> Result<TransitionOutcome, LifecycleError> {
    use ReservationStatus::{Cancelled, Completed, Confirmed, Expired, Pending, PickedUp};

    let current = reservation.status;
    let illegal = || LifecycleError::Illegal {
        current,
        event: event.kind(),
    };
    let conflict = TransitionOutcome::Conflict {
        current,
        attempted: event.kind(),
    };
    let already = TransitionOutcome::AlreadyApplied { status: current };

    let next = match (event, current) {
        (ReservationEvent::Confirm, Pending) => Confirmed,
        (ReservationEvent::Confirm, Confirmed | PickedUp | Completed) => return Ok(already),
        (ReservationEvent::Confirm, Cancelled | Expired) => return Ok(conflict),

        (ReservationEvent::PickUp { at }, Confirmed) => {
            reservation.actual_pick_up = Some(*at);
            PickedUp
        },
        (ReservationEvent::PickUp { .. }, PickedUp | Completed) => return Ok(already),
        (ReservationEvent::PickUp { .. }, Pending | Cancelled | Expired) => return Err(illegal()),

        (ReservationEvent::Finalize(facts), PickedUp) => {
            if let Some(picked_up) = reservation.actual_pick_up {
                if facts.dropped_off_at < picked_up {
                    return Err(LifecycleError::InvalidFacts(format!(
                        "drop-off {} precedes pick-up {picked_up}",
                        facts.dropped_off_at
                    )));
                }
            }
            reservation.actual_drop_off = Some(facts.dropped_off_at);
            reservation.condition = Some(assess(reservation, facts));
            Completed
        },
        (ReservationEvent::Finalize(_), Completed) => return Ok(already),
        (ReservationEvent::Finalize(_), Pending | Confirmed | Cancelled | Expired) => {
            return Err(illegal());
        },

        (ReservationEvent::Cancel, Pending | Confirmed) => Cancelled,
        (ReservationEvent::Cancel, Cancelled) => return Ok(already),
        (ReservationEvent::Cancel, Expired) => return Ok(conflict),
        (ReservationEvent::Cancel, PickedUp | Completed) => return Err(illegal()),

        (ReservationEvent::Expire, Pending) => Expired,
        (ReservationEvent::Expire, Expired) => return Ok(already),
        (ReservationEvent::Expire, Confirmed | PickedUp | Completed | Cancelled) => {
            return Ok(conflict);
        },
    };

    reservation.status = next;
    reservation.version += 1;
    Ok(TransitionOutcome::Applied {
        from: current,
        to: next,
    })
}

/// Derive the condition report from what staff observed.
#[must_use]
pub fn assess(reservation: &Reservation, facts: &DropOffFacts) -> ConditionReport {
    let late_delivery = facts.dropped_off_at > reservation.planned_drop_off;
    let past_grace = facts.dropped_off_at > reservation.buffered_drop_off;
    let fee_due = past_grace
        || facts.damage >= DamageLevel::Moderate
        || facts.dirtiness >= DirtinessLevel::VeryDirty
        || facts.accident;

    ConditionReport {
        damage: facts.damage,
        dirtiness: facts.dirtiness,
        late_delivery,
        fee_due,
        accident: facts.accident,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{CustomerId, Money, ReservationId, VehicleId};
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, hour, minute, 0).unwrap()
    }

    fn pending() -> Reservation {
        Reservation {
            id: ReservationId::new(1),
            customer_id: CustomerId::new("cust-1"),
            vehicle_id: VehicleId::new(1),
            created_at: at(10, 0),
            planned_pick_up: at(12, 0),
            planned_drop_off: at(14, 0),
            buffered_drop_off: at(15, 0),
            actual_pick_up: None,
            actual_drop_off: None,
            status: ReservationStatus::Pending,
            total_amount: Money::from_units(50),
            condition: None,
            version: 1,
        }
    }

    fn in_status(status: ReservationStatus) -> Reservation {
        Reservation {
            status,
            ..pending()
        }
    }

    fn drop_off(at: DateTime<Utc>) -> DropOffFacts {
        DropOffFacts {
            dropped_off_at: at,
            damage: DamageLevel::None,
            dirtiness: DirtinessLevel::Normal,
            accident: false,
        }
    }

    #[test]
    fn happy_path_reaches_completed() {
        let mut reservation = pending();

        apply(&mut reservation, &ReservationEvent::Confirm).unwrap();
        apply(&mut reservation, &ReservationEvent::PickUp { at: at(12, 5) }).unwrap();
        let outcome = apply(
            &mut reservation,
            &ReservationEvent::Finalize(drop_off(at(13, 50))),
        )
        .unwrap();

        assert_eq!(
            outcome,
            TransitionOutcome::Applied {
                from: ReservationStatus::PickedUp,
                to: ReservationStatus::Completed
            }
        );
        assert_eq!(reservation.version, 4);
        assert_eq!(reservation.actual_pick_up, Some(at(12, 5)));
        assert_eq!(reservation.actual_drop_off, Some(at(13, 50)));
        let report = reservation.condition.unwrap();
        assert!(!report.late_delivery);
        assert!(!report.fee_due);
    }

    #[test]
    fn duplicate_confirmation_is_a_silent_success() {
        let mut reservation = pending();
        apply(&mut reservation, &ReservationEvent::Confirm).unwrap();
        let snapshot = reservation.clone();

        let outcome = apply(&mut reservation, &ReservationEvent::Confirm).unwrap();

        assert_eq!(
            outcome,
            TransitionOutcome::AlreadyApplied {
                status: ReservationStatus::Confirmed
            }
        );
        assert_eq!(reservation, snapshot);
    }

    #[test]
    fn late_confirmation_does_not_revive_expired_reservation() {
        let mut reservation = pending();
        apply(&mut reservation, &ReservationEvent::Expire).unwrap();

        let outcome = apply(&mut reservation, &ReservationEvent::Confirm).unwrap();

        assert_eq!(
            outcome,
            TransitionOutcome::Conflict {
                current: ReservationStatus::Expired,
                attempted: EventKind::Confirm
            }
        );
        assert_eq!(reservation.status, ReservationStatus::Expired);
    }

    #[test]
    fn expiry_loses_against_confirmation() {
        let mut reservation = in_status(ReservationStatus::Confirmed);
        let outcome = apply(&mut reservation, &ReservationEvent::Expire).unwrap();
        assert!(matches!(outcome, TransitionOutcome::Conflict { .. }));
        assert_eq!(reservation.status, ReservationStatus::Confirmed);
    }

    #[test]
    fn pick_up_requires_confirmation() {
        let mut reservation = pending();
        let error = apply(&mut reservation, &ReservationEvent::PickUp { at: at(12, 0) }).unwrap_err();
        assert_eq!(
            error,
            LifecycleError::Illegal {
                current: ReservationStatus::Pending,
                event: EventKind::PickUp
            }
        );
    }

    #[test]
    fn cancel_after_pick_up_is_illegal() {
        let mut reservation = in_status(ReservationStatus::PickedUp);
        assert!(apply(&mut reservation, &ReservationEvent::Cancel).is_err());
    }

    #[test]
    fn drop_off_before_pick_up_is_rejected() {
        let mut reservation = in_status(ReservationStatus::PickedUp);
        reservation.actual_pick_up = Some(at(12, 30));
        let error = apply(
            &mut reservation,
            &ReservationEvent::Finalize(drop_off(at(12, 0))),
        )
        .unwrap_err();
        assert!(matches!(error, LifecycleError::InvalidFacts(_)));
        assert_eq!(reservation.status, ReservationStatus::PickedUp);
    }

    #[test]
    fn assessment_distinguishes_late_from_fee() {
        let reservation = pending();

        let within_grace = assess(&reservation, &drop_off(at(14, 30)));
        assert!(within_grace.late_delivery);
        assert!(!within_grace.fee_due);

        let past_grace = assess(&reservation, &drop_off(at(15, 1)));
        assert!(past_grace.late_delivery);
        assert!(past_grace.fee_due);

        let damaged = assess(
            &reservation,
            &DropOffFacts {
                damage: DamageLevel::Moderate,
                ..drop_off(at(13, 0))
            },
        );
        assert!(!damaged.late_delivery);
        assert!(damaged.fee_due);

        let very_dirty = assess(
            &reservation,
            &DropOffFacts {
                dirtiness: DirtinessLevel::VeryDirty,
                ..drop_off(at(13, 0))
            },
        );
        assert!(very_dirty.fee_due);
    }

    fn any_status() -> impl Strategy<Value = ReservationStatus> {
        proptest::sample::select(ReservationStatus::ALL.to_vec())
    }

    fn any_event() -> impl Strategy<Value = ReservationEvent> {
        prop_oneof![
            Just(ReservationEvent::Confirm),
            (0i64..240).prop_map(|m| ReservationEvent::PickUp {
                at: at(12, 0) + Duration::minutes(m)
            }),
            (0i64..600).prop_map(|m| ReservationEvent::Finalize(drop_off(
                at(12, 0) + Duration::minutes(m)
            ))),
            Just(ReservationEvent::Cancel),
            Just(ReservationEvent::Expire),
        ]
    }

    proptest! {
        #[test]
        fn applying_twice_equals_applying_once(status in any_status(), event in any_event()) {
            let mut once = in_status(status);
            let first = apply(&mut once, &event);
            let mut twice = once.clone();
            let second = apply(&mut twice, &event);

            prop_assert_eq!(&once, &twice);
            if first.is_ok() {
                let applied_again = matches!(second, Ok(TransitionOutcome::Applied { .. }));
                prop_assert!(!applied_again);
            }
        }

        #[test]
        fn cancelled_and_expired_are_sticky(
            status in prop_oneof![Just(ReservationStatus::Cancelled), Just(ReservationStatus::Expired)],
            events in proptest::collection::vec(any_event(), 1..8),
        ) {
            let mut reservation = in_status(status);
            for event in &events {
                let _ = apply(&mut reservation, event);
            }
            prop_assert_eq!(reservation.status, status);
            prop_assert_eq!(reservation.version, 1);
        }

        #[test]
        fn version_moves_only_on_applied(status in any_status(), event in any_event()) {
            let mut reservation = in_status(status);
            let outcome = apply(&mut reservation, &event);
            let applied = matches!(outcome, Ok(TransitionOutcome::Applied { .. }));
            prop_assert_eq!(reservation.version, if applied { 2 } else { 1 });
        }
    }
}
