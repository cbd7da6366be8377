//! HTTP handlers.
//!
//! Handlers only translate: they parse the request, call one service method and map
//! [`RentalError`](rentflow_core::error::RentalError) through [`AppError`].

pub mod analytics;
pub mod error;
pub mod payments;
pub mod reservations;

pub use error::AppError;
