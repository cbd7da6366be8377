//! Routers of the three services.

use super::health::health;
use crate::analytics::AnalyticsService;
use crate::api::{analytics, payments, reservations};
use crate::payments::PaymentService;
use crate::reservations::ReservationService;
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

/// Reservation service routes.
pub fn reservation_router(service: Arc<ReservationService>) -> Router {
    let api_routes = Router::new()
        .route("/reservations", post(reservations::create_reservation))
        .route(
            "/reservations/:id",
            get(reservations::get_reservation).delete(reservations::delete_reservation),
        )
        .route(
            "/reservations/:id/pickup",
            post(reservations::pickup_reservation),
        )
        .route(
            "/reservations/:id/finalize",
            post(reservations::finalize_reservation),
        )
        .route(
            "/reservations/:id/cancel",
            post(reservations::cancel_reservation),
        );

    Router::new()
        .route("/health", get(|| async { health("reservation") }))
        .nest("/api", api_routes)
        .with_state(service)
}

/// Payment service routes.
pub fn payment_router(service: Arc<PaymentService>) -> Router {
    let api_routes = Router::new()
        .route("/payments", post(payments::create_payment))
        .route("/payments/capture", get(payments::capture_payment))
        .route(
            "/payments/cancel",
            get(payments::cancel_payment).post(payments::cancel_payment),
        )
        .route("/payments/:token", get(payments::get_payment));

    Router::new()
        .route("/health", get(|| async { health("payment") }))
        .nest("/api", api_routes)
        .with_state(service)
}

/// Analytics service routes.
pub fn analytics_router(service: Arc<AnalyticsService>) -> Router {
    Router::new()
        .route("/health", get(|| async { health("analytics") }))
        .route("/api/analytics/summary", get(analytics::get_summary))
        .with_state(service)
}
