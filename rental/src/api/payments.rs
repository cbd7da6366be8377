//! Payment API endpoints.
//!
//! - POST /api/payments - Open a gateway order
//! - GET /api/payments/capture?token=&PayerID= - Gateway return URL
//! - GET|POST /api/payments/cancel?token= - Gateway cancel URL
//! - GET /api/payments/:token - Payment details

use super::AppError;
use crate::payments::{OrderRequest, PaymentService};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use rentflow_core::payment::PaymentRecord;
use rentflow_core::types::{CustomerId, GatewayToken, Money, PayerId, ReservationId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Request to pay for a reservation.
#[derive(Debug, Deserialize)]
pub struct CreatePaymentRequest {
    /// Reservation being paid
    pub reservation_id: ReservationId,
    /// Paying customer
    pub customer_id: CustomerId,
    /// Amount in cents
    pub amount_cents: u64,
}

/// Response after opening a gateway order.
#[derive(Debug, Serialize)]
pub struct CreatePaymentResponse {
    /// Gateway order token
    pub token: GatewayToken,
    /// Where to send the customer
    pub approval_url: String,
}

/// Query the gateway appends to the return URL.
#[derive(Debug, Deserialize)]
pub struct CaptureQuery {
    /// Gateway order token
    pub token: String,
    /// Approving payer
    #[serde(rename = "PayerID")]
    pub payer_id: String,
}

/// Query the gateway appends to the cancel URL.
#[derive(Debug, Deserialize)]
pub struct CancelQuery {
    /// Gateway order token
    pub token: String,
}

/// Open a gateway order for a reservation.
///
/// # Errors
///
/// 409 if the reservation already has an active payment, 503 if the gateway is down.
pub async fn create_payment(
    State(service): State<Arc<PaymentService>>,
    Json(request): Json<CreatePaymentRequest>,
) -> Result<(StatusCode, Json<CreatePaymentResponse>), AppError> {
    let opened = service
        .open_order(OrderRequest {
            reservation_id: request.reservation_id,
            customer_id: request.customer_id,
            amount: Money::from_cents(request.amount_cents),
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreatePaymentResponse {
            token: opened.payment.token,
            approval_url: opened.approval_url,
        }),
    ))
}

/// Gateway return URL: capture the approved order.
///
/// # Errors
///
/// 404 for an unknown token, 409 if cancelled or declined, 503 on a gateway timeout.
pub async fn capture_payment(
    State(service): State<Arc<PaymentService>>,
    Query(query): Query<CaptureQuery>,
) -> Result<Json<PaymentRecord>, AppError> {
    let payment = service
        .capture(GatewayToken::new(query.token), PayerId::new(query.payer_id))
        .await?;
    Ok(Json(payment))
}

/// Gateway cancel URL: the customer aborted.
///
/// # Errors
///
/// 404 for an unknown token, 409 if the payment already completed.
pub async fn cancel_payment(
    State(service): State<Arc<PaymentService>>,
    Query(query): Query<CancelQuery>,
) -> Result<Json<PaymentRecord>, AppError> {
    Ok(Json(service.cancel(GatewayToken::new(query.token)).await?))
}

/// Payment details.
///
/// # Errors
///
/// 404 for an unknown token.
pub async fn get_payment(
    State(service): State<Arc<PaymentService>>,
    Path(token): Path<String>,
) -> Result<Json<PaymentRecord>, AppError> {
    Ok(Json(service.get(GatewayToken::new(token)).await?))
}
