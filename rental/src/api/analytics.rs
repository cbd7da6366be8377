//! Analytics API endpoints.

use super::AppError;
use crate::analytics::AnalyticsService;
use axum::{Json, extract::State};
use rentflow_core::ports::AnalyticsSummary;
use std::sync::Arc;

/// Reservations per status and captured revenue.
///
/// ```bash
/// curl http://localhost:8082/api/analytics/summary
/// # {"reservations_by_status":{"CONFIRMED":3,"PENDING":1},"payments_captured":3,"revenue_cents":45000}
/// ```
///
/// # Errors
///
/// 503 if the replica is unavailable.
pub async fn get_summary(
    State(service): State<Arc<AnalyticsService>>,
) -> Result<Json<AnalyticsSummary>, AppError> {
    Ok(Json(service.summary().await?))
}
