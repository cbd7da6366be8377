//! Payment store and the capture-fact outbox.

use crate::{cents, db_error, money, offsets, sql_limit};
use chrono::{DateTime, Utc};
use rentflow_core::error::StoreError;
use rentflow_core::messages::{CAPTURE_COMPLETED_TOPIC, CaptureCompleted, StreamPayload};
use rentflow_core::payment::{
    CaptureEvent, CaptureOutcome, NewPayment, PaymentRecord, PaymentStatus,
};
use rentflow_core::ports::{
    ConsumerCheckpoint, OutboxRecord, OutboxSource, PaymentStore, PortFuture,
};
use rentflow_core::types::{CustomerId, GatewayToken, PayerId, PaymentId, ReservationId};
use sqlx::{FromRow, PgConnection, PgPool};

const PAYMENT_COLUMNS: &str = r"
    id, token, reservation_id, customer_id, amount_cents, status, payer_id,
    completion_published, created_at, updated_at
";

#[derive(Debug, FromRow)]
struct PaymentRow {
    id: i64,
    token: String,
    reservation_id: i64,
    customer_id: String,
    amount_cents: i64,
    status: String,
    payer_id: Option<String>,
    completion_published: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for PaymentRecord {
    type Error = StoreError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: PaymentId::new(row.id),
            token: GatewayToken::new(row.token),
            reservation_id: ReservationId::new(row.reservation_id),
            customer_id: CustomerId::new(row.customer_id),
            amount: money(row.amount_cents)?,
            status: row
                .status
                .parse::<PaymentStatus>()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            payer_id: row.payer_id.map(PayerId::new),
            completion_published: row.completion_published,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn conflict(payment: &PaymentRecord, action: &str) -> StoreError {
    StoreError::Conflict(format!(
        "cannot {action} payment {} in status {}",
        payment.token, payment.status
    ))
}

async fn lock_by_token(
    conn: &mut PgConnection,
    token: &GatewayToken,
) -> Result<PaymentRecord, StoreError> {
    let row: Option<PaymentRow> = sqlx::query_as(&format!(
        "SELECT {PAYMENT_COLUMNS} FROM payments WHERE token = $1 FOR UPDATE"
    ))
    .bind(token.as_str())
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error)?;

    row.ok_or_else(|| StoreError::not_found("payment", token))?
        .try_into()
}

async fn set_status(
    conn: &mut PgConnection,
    payment: &PaymentRecord,
) -> Result<(), StoreError> {
    sqlx::query(
        r"
        UPDATE payments
        SET status = $2, payer_id = $3, updated_at = $4
        WHERE id = $1
        ",
    )
    .bind(payment.id.get())
    .bind(payment.status.as_str())
    .bind(payment.payer_id.as_ref().map(PayerId::as_str))
    .bind(payment.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;
    Ok(())
}

/// `PostgreSQL` payment store.
///
/// Status changes lock the payment row by token. The partial unique index on
/// `reservation_id` backs the one-active-payment rule, so a concurrent second order
/// surfaces as [`StoreError::Conflict`].
#[derive(Debug, Clone)]
pub struct PostgresPaymentStore {
    pool: PgPool,
}

impl PostgresPaymentStore {
    /// Create a store from an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn open_row(&self, payment: NewPayment) -> Result<PaymentRecord, StoreError> {
        let row: PaymentRow = sqlx::query_as(&format!(
            r"
            INSERT INTO payments (
                token, reservation_id, customer_id, amount_cents, status,
                completion_published, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, FALSE, $6, $6)
            RETURNING {PAYMENT_COLUMNS}
            "
        ))
        .bind(payment.token.as_str())
        .bind(payment.reservation_id.get())
        .bind(payment.customer_id.as_str())
        .bind(cents(payment.amount)?)
        .bind(PaymentStatus::InProgress.as_str())
        .bind(payment.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        row.try_into()
    }

    async fn get_row(&self, token: GatewayToken) -> Result<PaymentRecord, StoreError> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE token = $1"
        ))
        .bind(token.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.ok_or_else(|| StoreError::not_found("payment", &token))?
            .try_into()
    }

    async fn active_row(
        &self,
        reservation: ReservationId,
    ) -> Result<Option<PaymentRecord>, StoreError> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE reservation_id = $1 AND status <> 'CANCELLED'"
        ))
        .bind(reservation.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(PaymentRecord::try_from).transpose()
    }

    async fn mark_paid_tx(
        &self,
        token: GatewayToken,
        payer: PayerId,
        at: DateTime<Utc>,
    ) -> Result<PaymentRecord, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let mut payment = lock_by_token(&mut tx, &token).await?;

        match payment.status {
            PaymentStatus::InProgress => {
                payment.status = PaymentStatus::Paid;
                payment.payer_id = Some(payer);
                payment.updated_at = at;
                set_status(&mut tx, &payment).await?;
            },
            PaymentStatus::Paid => {},
            PaymentStatus::Completed | PaymentStatus::Cancelled => {
                return Err(conflict(&payment, "approve"));
            },
        }

        tx.commit().await.map_err(db_error)?;
        Ok(payment)
    }

    async fn complete_tx(
        &self,
        token: GatewayToken,
        payer: PayerId,
        at: DateTime<Utc>,
    ) -> Result<CaptureOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let mut payment = lock_by_token(&mut tx, &token).await?;

        match payment.status {
            PaymentStatus::Completed => return Ok(CaptureOutcome::AlreadyCompleted(payment)),
            PaymentStatus::InProgress | PaymentStatus::Cancelled => {
                return Err(conflict(&payment, "complete"));
            },
            PaymentStatus::Paid => {},
        }

        payment.status = PaymentStatus::Completed;
        payment.payer_id = Some(payer.clone());
        payment.updated_at = at;
        set_status(&mut tx, &payment).await?;

        let (event_id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO capture_events (payment_id, gateway_token, payer_id, reservation_id, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            ",
        )
        .bind(payment.id.get())
        .bind(payment.token.as_str())
        .bind(payer.as_str())
        .bind(payment.reservation_id.get())
        .bind(at)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;

        let event = CaptureEvent {
            id: event_id,
            payment_id: payment.id,
            gateway_token: payment.token.clone(),
            payer_id: payer,
            reservation_id: payment.reservation_id,
            created_at: at,
        };
        Ok(CaptureOutcome::Recorded { payment, event })
    }

    async fn cancel_tx(
        &self,
        token: GatewayToken,
        at: DateTime<Utc>,
    ) -> Result<PaymentRecord, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let mut payment = lock_by_token(&mut tx, &token).await?;

        match payment.status {
            PaymentStatus::InProgress | PaymentStatus::Paid => {
                payment.status = PaymentStatus::Cancelled;
                payment.updated_at = at;
                set_status(&mut tx, &payment).await?;
            },
            PaymentStatus::Cancelled => {},
            PaymentStatus::Completed => return Err(conflict(&payment, "cancel")),
        }

        tx.commit().await.map_err(db_error)?;
        Ok(payment)
    }

    async fn cancel_for_reservation_tx(
        &self,
        reservation: ReservationId,
        at: DateTime<Utc>,
        checkpoint: Option<ConsumerCheckpoint>,
    ) -> Result<Option<PaymentRecord>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        if let Some(checkpoint) = &checkpoint {
            if offsets::is_replay(&mut tx, checkpoint).await? {
                tx.commit().await.map_err(db_error)?;
                return Ok(None);
            }
        }

        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            r"
            SELECT {PAYMENT_COLUMNS}
            FROM payments
            WHERE reservation_id = $1 AND status <> 'CANCELLED'
            FOR UPDATE
            "
        ))
        .bind(reservation.get())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;

        let mut payment = row.map(PaymentRecord::try_from).transpose()?;
        if let Some(payment) = payment.as_mut().filter(|p| p.status.is_open()) {
            payment.status = PaymentStatus::Cancelled;
            payment.updated_at = at;
            set_status(&mut tx, payment).await?;
            tracing::info!(
                reservation_id = %reservation,
                token = %payment.token,
                "Open payment cancelled with its reservation"
            );
        }
        if let Some(checkpoint) = &checkpoint {
            offsets::record(&mut tx, checkpoint).await?;
        }

        tx.commit().await.map_err(db_error)?;
        Ok(payment)
    }

    async fn mark_published_tx(
        &self,
        token: GatewayToken,
        checkpoint: ConsumerCheckpoint,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        if offsets::is_replay(&mut tx, &checkpoint).await? {
            tx.commit().await.map_err(db_error)?;
            return Ok(false);
        }

        let result = sqlx::query("UPDATE payments SET completion_published = TRUE WHERE token = $1")
            .bind(token.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("payment", &token));
        }
        offsets::record(&mut tx, &checkpoint).await?;

        tx.commit().await.map_err(db_error)?;
        Ok(true)
    }
}

impl PaymentStore for PostgresPaymentStore {
    fn open(&self, payment: NewPayment) -> PortFuture<'_, PaymentRecord> {
        Box::pin(self.open_row(payment))
    }

    fn get_by_token(&self, token: GatewayToken) -> PortFuture<'_, PaymentRecord> {
        Box::pin(self.get_row(token))
    }

    fn find_active_for_reservation(
        &self,
        reservation: ReservationId,
    ) -> PortFuture<'_, Option<PaymentRecord>> {
        Box::pin(self.active_row(reservation))
    }

    fn mark_paid(
        &self,
        token: GatewayToken,
        payer: PayerId,
        at: DateTime<Utc>,
    ) -> PortFuture<'_, PaymentRecord> {
        Box::pin(self.mark_paid_tx(token, payer, at))
    }

    fn complete_with_capture(
        &self,
        token: GatewayToken,
        payer: PayerId,
        at: DateTime<Utc>,
    ) -> PortFuture<'_, CaptureOutcome> {
        Box::pin(self.complete_tx(token, payer, at))
    }

    fn cancel(&self, token: GatewayToken, at: DateTime<Utc>) -> PortFuture<'_, PaymentRecord> {
        Box::pin(self.cancel_tx(token, at))
    }

    fn cancel_for_reservation(
        &self,
        reservation: ReservationId,
        at: DateTime<Utc>,
        checkpoint: Option<ConsumerCheckpoint>,
    ) -> PortFuture<'_, Option<PaymentRecord>> {
        Box::pin(self.cancel_for_reservation_tx(reservation, at, checkpoint))
    }

    fn mark_completion_published(
        &self,
        token: GatewayToken,
        checkpoint: ConsumerCheckpoint,
    ) -> PortFuture<'_, bool> {
        Box::pin(self.mark_published_tx(token, checkpoint))
    }
}

#[derive(Debug, FromRow)]
struct CaptureEventRow {
    id: i64,
    payment_id: i64,
    gateway_token: String,
    payer_id: String,
    reservation_id: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<CaptureEventRow> for OutboxRecord {
    type Error = StoreError;

    fn try_from(row: CaptureEventRow) -> Result<Self, Self::Error> {
        let event = CaptureEvent {
            id: row.id,
            payment_id: PaymentId::new(row.payment_id),
            gateway_token: GatewayToken::new(row.gateway_token),
            payer_id: PayerId::new(row.payer_id),
            reservation_id: ReservationId::new(row.reservation_id),
            created_at: row.created_at,
        };
        let message = CaptureCompleted::from(&event);
        Ok(Self {
            id: event.id,
            topic: CAPTURE_COMPLETED_TOPIC.to_string(),
            key: message.key(),
            payload: message
                .encode()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            created_at: event.created_at,
        })
    }
}

impl OutboxSource for PostgresPaymentStore {
    fn fetch_unrelayed(&self, limit: usize) -> PortFuture<'_, Vec<OutboxRecord>> {
        Box::pin(async move {
            let rows: Vec<CaptureEventRow> = sqlx::query_as(
                r"
                SELECT id, payment_id, gateway_token, payer_id, reservation_id, created_at
                FROM capture_events
                WHERE relayed_at IS NULL
                ORDER BY id ASC
                LIMIT $1
                ",
            )
            .bind(sql_limit(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
            rows.into_iter().map(OutboxRecord::try_from).collect()
        })
    }

    fn mark_relayed(&self, ids: Vec<i64>, at: DateTime<Utc>) -> PortFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query("UPDATE capture_events SET relayed_at = $2 WHERE id = ANY($1)")
                .bind(ids)
                .bind(at)
                .execute(&self.pool)
                .await
                .map_err(db_error)?;
            Ok(())
        })
    }

    fn purge_relayed(&self, older_than: DateTime<Utc>) -> PortFuture<'_, u64> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM capture_events WHERE relayed_at < $1")
                .bind(older_than)
                .execute(&self.pool)
                .await
                .map_err(db_error)?;
            Ok(result.rows_affected())
        })
    }
}
