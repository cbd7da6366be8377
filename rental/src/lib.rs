//! # Rentflow Services
//!
//! The three services of the car-rental platform, built on the ports in
//! `rentflow-core`:
//!
//! - **Reservation**: bookings, the overlap guard, staff transitions, the expiration
//!   sweeper and the reservation outbox
//! - **Payment**: gateway orders, capture, the capture-fact outbox and release of
//!   payments whose reservation ended
//! - **Analytics**: a replica of reservations fed by the change stream, and revenue
//!
//! Every service runs as its own binary against its own database. They talk only
//! through the change stream:
//!
//! ```text
//! capture ─► payment.capture-completed ─► payment-completion ─► payment.completed
//!                                                               ├─► reservation-confirmation
//!                                                               └─► analytics-payments
//! reservation outbox ─► reservation.events ─┬─► payment-release
//!                                           └─► analytics-reservations
//! ```
//!
//! [`bootstrap`] wires a service from its ports; the binaries pass the production
//! adapters and the tests pass in-memory ones.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod analytics;
pub mod api;
pub mod bootstrap;
pub mod config;
pub mod directory;
pub mod gateway;
pub mod metrics;
pub mod payments;
pub mod reservations;
pub mod runtime;
pub mod server;

pub use config::Config;
