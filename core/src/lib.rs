//! # Rentflow Core
//!
//! Domain types, the reservation state machine, the overlap guard and the ports
//! (traits) that the Reservation, Payment and Analytics services are built from.
//!
//! Nothing in this crate performs I/O. Adapters live in sibling crates:
//!
//! - `rentflow-postgres`: durable stores (sqlx)
//! - `rentflow-redpanda`: the change stream (rdkafka)
//! - `rentflow-testing`: in-memory adapters for tests
//!
//! ## Saga at a glance
//!
//! ```text
//!  Reservation svc          Payment svc                    Stream
//!  ───────────────          ───────────                    ──────
//!  create (PENDING) ──►     open order (IN_PROGRESS)
//!                           approve  (PAID)
//!                           capture ─► tx { COMPLETED + capture fact }
//!                                           │ relay
//!                                           ▼
//!                                     payment.capture-completed
//!                                           │ completion consumer
//!                                           ▼
//!  confirm (CONFIRMED) ◄──────────── payment.completed ────► Analytics replica
//! ```
//!
//! ## Architecture Principles
//!
//! - Functional Core, Imperative Shell: [`lifecycle::apply`] and
//!   [`overlap::BookingWindow`] are pure, stores call them inside their transactions
//! - At-least-once delivery, exactly-once effect: every saga step is idempotent
//! - Dependency Injection via `Arc<dyn Port>`

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod environment;
pub mod error;
pub mod lifecycle;
pub mod messages;
pub mod overlap;
pub mod payment;
pub mod ports;
pub mod reservation;
pub mod stream;
pub mod types;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use error::{ErrorKind, RentalError, StoreError};
pub use types::{CustomerId, GatewayToken, Money, PayerId, PaymentId, ReservationId, VehicleId};
