//! Payment service: gateway orders, capture and release.

use crate::metrics;
use rentflow_core::environment::Clock;
use rentflow_core::error::{RentalError, StoreError};
use rentflow_core::payment::{CaptureOutcome, NewPayment, PaymentRecord, PaymentStatus};
use rentflow_core::ports::{
    CaptureStatus, ConsumerCheckpoint, GatewayError, PaymentGateway, PaymentStore,
    ReservationDirectory,
};
use rentflow_core::reservation::{Reservation, ReservationStatus};
use rentflow_core::types::{CustomerId, GatewayToken, Money, PayerId, ReservationId};
use std::sync::Arc;

/// Customer request to pay for a reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRequest {
    /// Reservation being paid
    pub reservation_id: ReservationId,
    /// Paying customer
    pub customer_id: CustomerId,
    /// Amount to charge; must equal the reservation total
    pub amount: Money,
}

/// A payment opened at the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedOrder {
    /// Stored payment, IN_PROGRESS
    pub payment: PaymentRecord,
    /// Where to send the customer for approval
    pub approval_url: String,
}

fn gateway_error(error: GatewayError) -> RentalError {
    match error {
        GatewayError::Timeout | GatewayError::Transport(_) | GatewayError::InvalidResponse(_) => {
            RentalError::Transient(error.to_string())
        },
        GatewayError::Rejected(_) => RentalError::Conflict(error.to_string()),
    }
}

fn check_payable(reservation: &Reservation, request: &OrderRequest) -> Result<(), RentalError> {
    if reservation.status != ReservationStatus::Pending {
        return Err(RentalError::Validation(format!(
            "reservation {} is {} and cannot be paid",
            reservation.id, reservation.status
        )));
    }
    if reservation.customer_id != request.customer_id {
        return Err(RentalError::Validation(format!(
            "reservation {} belongs to another customer",
            reservation.id
        )));
    }
    if reservation.total_amount != request.amount {
        return Err(RentalError::Validation(format!(
            "amount {} does not match total {} of reservation {}",
            request.amount, reservation.total_amount, reservation.id
        )));
    }
    Ok(())
}

/// Payment service.
pub struct PaymentService {
    store: Arc<dyn PaymentStore>,
    reservations: Arc<dyn ReservationDirectory>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
}

impl PaymentService {
    /// Create a service over its collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn PaymentStore>,
        reservations: Arc<dyn ReservationDirectory>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            reservations,
            gateway,
            clock,
        }
    }

    /// Open a gateway order and store the payment as IN_PROGRESS.
    ///
    /// The reservation is read from its owner first; only a PENDING reservation of the
    /// same customer can be paid, and only for its total.
    ///
    /// # Errors
    ///
    /// - [`RentalError::NotFound`] for an unknown reservation
    /// - [`RentalError::Validation`] for a zero amount, a reservation that is not
    ///   PENDING or belongs to someone else, or an amount other than its total
    /// - [`RentalError::Conflict`] if the reservation already has an active payment
    /// - [`RentalError::Transient`] if the gateway or the Reservation service is
    ///   unreachable
    pub async fn open_order(&self, request: OrderRequest) -> Result<OpenedOrder, RentalError> {
        if request.amount == Money::default() {
            return Err(RentalError::Validation(
                "amount must be positive".to_string(),
            ));
        }
        let reservation = self.reservations.reservation(request.reservation_id).await?;
        check_payable(&reservation, &request)?;
        if let Some(active) = self
            .store
            .find_active_for_reservation(request.reservation_id)
            .await?
        {
            return Err(RentalError::Conflict(format!(
                "reservation {} already has payment {} in status {}",
                request.reservation_id, active.token, active.status
            )));
        }

        let order = self
            .gateway
            .create_order(request.amount, request.reservation_id)
            .await
            .map_err(gateway_error)?;

        // The unique index still refuses a concurrent second order.
        let payment = self
            .store
            .open(NewPayment {
                token: order.token,
                reservation_id: request.reservation_id,
                customer_id: request.customer_id,
                amount: request.amount,
                created_at: self.clock.now(),
            })
            .await?;

        metrics::record_payment_status(payment.status.as_str());
        tracing::info!(
            token = %payment.token,
            reservation_id = %payment.reservation_id,
            amount = %payment.amount,
            "Payment opened"
        );
        Ok(OpenedOrder {
            payment,
            approval_url: order.approval_url,
        })
    }

    /// Load a payment by gateway token.
    ///
    /// # Errors
    ///
    /// Returns [`RentalError::NotFound`] if absent.
    pub async fn get(&self, token: GatewayToken) -> Result<PaymentRecord, RentalError> {
        Ok(self.store.get_by_token(token).await?)
    }

    /// Handle the gateway return: record the approval, capture, then complete the
    /// payment together with its capture fact.
    ///
    /// A COMPLETED payment is returned as is without calling the gateway again.
    ///
    /// # Errors
    ///
    /// - [`RentalError::NotFound`] for an unknown token
    /// - [`RentalError::Conflict`] if the payment was cancelled, the reservation is no
    ///   longer PENDING (the payment is cancelled too) or the gateway declined
    /// - [`RentalError::Transient`] if the gateway timed out
    pub async fn capture(
        &self,
        token: GatewayToken,
        payer: PayerId,
    ) -> Result<PaymentRecord, RentalError> {
        let payment = self.store.get_by_token(token.clone()).await?;
        match payment.status {
            PaymentStatus::Completed => return Ok(payment),
            PaymentStatus::Cancelled => {
                return Err(RentalError::Conflict(format!(
                    "payment {token} was cancelled"
                )));
            },
            PaymentStatus::InProgress | PaymentStatus::Paid => {
                self.ensure_reservation_pending(&payment).await?;
            },
        }
        if payment.status == PaymentStatus::InProgress {
            self.store
                .mark_paid(token.clone(), payer.clone(), self.clock.now())
                .await?;
            metrics::record_payment_status(PaymentStatus::Paid.as_str());
        }

        match self.gateway.capture_order(&token, &payer).await {
            Ok(CaptureStatus::Completed) => {},
            Ok(CaptureStatus::Declined) => {
                tracing::warn!(%token, %payer, "Capture declined");
                return Err(RentalError::Conflict(format!(
                    "gateway declined the capture of {token}"
                )));
            },
            Err(error) => {
                tracing::error!(%token, error = %error, "Capture failed");
                return Err(gateway_error(error));
            },
        }

        match self
            .store
            .complete_with_capture(token.clone(), payer, self.clock.now())
            .await
        {
            Ok(CaptureOutcome::Recorded { payment, event }) => {
                metrics::record_payment_status(payment.status.as_str());
                metrics::record_payment_completed();
                tracing::info!(
                    %token,
                    reservation_id = %payment.reservation_id,
                    capture_event_id = event.id,
                    "Payment completed"
                );
                Ok(payment)
            },
            Ok(CaptureOutcome::AlreadyCompleted(payment)) => Ok(payment),
            Err(error) => {
                tracing::error!(
                    %token,
                    error = %error,
                    "Captured at the gateway but not completed locally"
                );
                Err(error.into())
            },
        }
    }

    /// Refuse to capture for a reservation that ended before its release reached this
    /// service, and cancel the payment on its behalf.
    async fn ensure_reservation_pending(
        &self,
        payment: &PaymentRecord,
    ) -> Result<(), RentalError> {
        let status = match self.reservations.reservation(payment.reservation_id).await {
            Ok(reservation) if reservation.status == ReservationStatus::Pending => return Ok(()),
            Ok(reservation) => reservation.status.to_string(),
            Err(StoreError::NotFound { .. }) => "deleted".to_string(),
            Err(error) => return Err(error.into()),
        };

        let cancelled = self
            .store
            .cancel(payment.token.clone(), self.clock.now())
            .await?;
        metrics::record_payment_status(cancelled.status.as_str());
        tracing::info!(
            token = %payment.token,
            reservation_id = %payment.reservation_id,
            %status,
            "Capture refused; reservation no longer pending"
        );
        Err(RentalError::Conflict(format!(
            "reservation {} is {status}; payment {} was cancelled",
            payment.reservation_id, payment.token
        )))
    }

    /// Customer abort: cancel an IN_PROGRESS or PAID payment.
    ///
    /// # Errors
    ///
    /// Returns [`RentalError::Conflict`] if the payment already completed.
    pub async fn cancel(&self, token: GatewayToken) -> Result<PaymentRecord, RentalError> {
        let before = self.store.get_by_token(token.clone()).await?;
        if before.status == PaymentStatus::Cancelled {
            return Ok(before);
        }

        let payment = self.store.cancel(token, self.clock.now()).await?;
        metrics::record_payment_status(payment.status.as_str());
        tracing::info!(token = %payment.token, "Payment cancelled by the customer");
        Ok(payment)
    }

    /// Release the open payment of an expired or cancelled reservation.
    ///
    /// # Errors
    ///
    /// Returns [`RentalError::Transient`] on storage failure.
    pub async fn release_for_reservation(
        &self,
        reservation: ReservationId,
        checkpoint: ConsumerCheckpoint,
    ) -> Result<Option<PaymentRecord>, RentalError> {
        let released = self
            .store
            .cancel_for_reservation(reservation, self.clock.now(), Some(checkpoint))
            .await?;

        match &released {
            Some(payment) if payment.status == PaymentStatus::Cancelled => {
                metrics::record_payment_status(payment.status.as_str());
                tracing::info!(
                    token = %payment.token,
                    reservation_id = %reservation,
                    "Payment released"
                );
            },
            Some(payment) => tracing::warn!(
                token = %payment.token,
                reservation_id = %reservation,
                status = %payment.status,
                "Reservation ended with a completed payment; no refund issued"
            ),
            None => {},
        }
        Ok(released)
    }

    /// The payment behind a capture fact. It must be COMPLETED: the fact is only ever
    /// written together with that status.
    ///
    /// # Errors
    ///
    /// Returns [`RentalError::NotFound`] for an unknown token and
    /// [`RentalError::Validation`] if the payment is not COMPLETED.
    pub async fn completed_payment(
        &self,
        token: GatewayToken,
    ) -> Result<PaymentRecord, RentalError> {
        let payment = self.store.get_by_token(token).await?;
        if payment.status == PaymentStatus::Completed {
            Ok(payment)
        } else {
            Err(RentalError::Validation(format!(
                "capture fact for payment {} in status {}",
                payment.token, payment.status
            )))
        }
    }

    /// Record that `payment.completed` went out for `token`. Returns `false` for a
    /// replayed capture fact.
    ///
    /// # Errors
    ///
    /// Returns [`RentalError::Transient`] on storage failure.
    pub async fn mark_completion_published(
        &self,
        token: GatewayToken,
        checkpoint: ConsumerCheckpoint,
    ) -> Result<bool, RentalError> {
        Ok(self
            .store
            .mark_completion_published(token, checkpoint)
            .await?)
    }
}
