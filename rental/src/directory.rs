//! Reservation lookups over the Reservation service's HTTP API.
//!
//! The Payment service owns no reservation data; it reads the current state from
//! `GET /api/reservations/:id` before it opens or captures a payment.

use crate::config::DirectoryConfig;
use rentflow_core::error::StoreError;
use rentflow_core::ports::{PortFuture, ReservationDirectory};
use rentflow_core::reservation::Reservation;
use rentflow_core::types::ReservationId;
use reqwest::{Client, StatusCode};

fn transport(error: reqwest::Error) -> StoreError {
    StoreError::Unavailable(format!("reservation service: {error}"))
}

/// [`ReservationDirectory`] backed by the Reservation service.
pub struct HttpReservationDirectory {
    client: Client,
    base_url: String,
}

impl HttpReservationDirectory {
    /// Create a client for `config.base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the HTTP client cannot be built.
    pub fn new(config: &DirectoryConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(transport)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch(&self, id: ReservationId) -> Result<Reservation, StoreError> {
        let response = self
            .client
            .get(format!("{}/api/reservations/{id}", self.base_url))
            .send()
            .await
            .map_err(transport)?;

        match response.status() {
            StatusCode::OK => response
                .json::<Reservation>()
                .await
                .map_err(|e| StoreError::Corrupt(format!("reservation {id}: {e}"))),
            StatusCode::NOT_FOUND => Err(StoreError::not_found("reservation", id)),
            status => {
                tracing::warn!(reservation_id = %id, %status, "Reservation lookup failed");
                Err(StoreError::Unavailable(format!(
                    "reservation service answered {status}"
                )))
            },
        }
    }
}

impl ReservationDirectory for HttpReservationDirectory {
    fn reservation(&self, id: ReservationId) -> PortFuture<'_, Reservation> {
        Box::pin(self.fetch(id))
    }
}
