//! Reservation API endpoints.
//!
//! - POST /api/reservations - Book a vehicle
//! - GET /api/reservations/:id - Reservation details
//! - POST /api/reservations/:id/pickup - Staff: vehicle collected
//! - POST /api/reservations/:id/finalize - Staff: vehicle returned
//! - POST /api/reservations/:id/cancel - Cancel
//! - DELETE /api/reservations/:id - Staff: delete

use super::AppError;
use crate::reservations::ReservationService;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use rentflow_core::reservation::{BookingRequest, DropOffFacts, Reservation};
use rentflow_core::types::ReservationId;
use serde::Deserialize;
use std::sync::Arc;

/// Request to record a pick-up.
#[derive(Debug, Deserialize)]
pub struct PickupRequest {
    /// When the customer collected the vehicle
    pub picked_up_at: DateTime<Utc>,
}

/// Book a vehicle.
///
/// # Example
///
/// ```bash
/// curl -X POST http://localhost:8080/api/reservations \
///   -H "Content-Type: application/json" \
///   -d '{
///     "customer_id": "alice",
///     "vehicle_id": 1,
///     "pick_up": "2025-06-01T12:00:00Z",
///     "drop_off": "2025-06-01T14:00:00Z"
///   }'
/// ```
///
/// # Errors
///
/// 404 for an unknown vehicle, 409 if the vehicle is taken, 422 for an invalid window.
pub async fn create_reservation(
    State(service): State<Arc<ReservationService>>,
    Json(request): Json<BookingRequest>,
) -> Result<(StatusCode, Json<Reservation>), AppError> {
    let reservation = service.create(request).await?;
    Ok((StatusCode::CREATED, Json(reservation)))
}

/// Reservation details.
///
/// # Errors
///
/// 404 if absent.
pub async fn get_reservation(
    State(service): State<Arc<ReservationService>>,
    Path(id): Path<i64>,
) -> Result<Json<Reservation>, AppError> {
    Ok(Json(service.get(ReservationId::new(id)).await?))
}

/// Staff: the customer collected the vehicle.
///
/// # Errors
///
/// 422 unless the reservation is CONFIRMED.
pub async fn pickup_reservation(
    State(service): State<Arc<ReservationService>>,
    Path(id): Path<i64>,
    Json(request): Json<PickupRequest>,
) -> Result<Json<Reservation>, AppError> {
    let reservation = service
        .record_pickup(ReservationId::new(id), request.picked_up_at)
        .await?;
    Ok(Json(reservation))
}

/// Staff: the vehicle was returned and inspected.
///
/// # Errors
///
/// 422 unless the reservation is PICKED_UP.
pub async fn finalize_reservation(
    State(service): State<Arc<ReservationService>>,
    Path(id): Path<i64>,
    Json(facts): Json<DropOffFacts>,
) -> Result<Json<Reservation>, AppError> {
    Ok(Json(service.finalize(ReservationId::new(id), facts).await?))
}

/// Cancel a reservation.
///
/// # Errors
///
/// 409 if it already expired, 422 once picked up.
pub async fn cancel_reservation(
    State(service): State<Arc<ReservationService>>,
    Path(id): Path<i64>,
) -> Result<Json<Reservation>, AppError> {
    Ok(Json(service.cancel(ReservationId::new(id)).await?))
}

/// Staff: delete a reservation in any status.
///
/// # Errors
///
/// 404 if absent.
pub async fn delete_reservation(
    State(service): State<Arc<ReservationService>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    service.delete(ReservationId::new(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}
