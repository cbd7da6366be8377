//! Analytics read replica and revenue ledger.

use crate::{db_error, offsets};
use rentflow_core::error::StoreError;
use rentflow_core::lifecycle::{self, ReservationEvent};
use rentflow_core::messages::{PaymentCompleted, ReservationChanged};
use rentflow_core::ports::{
    AnalyticsStore, AnalyticsSummary, ConsumerCheckpoint, PaymentRecorded, PortFuture,
};
use rentflow_core::reservation::Reservation;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};

/// `PostgreSQL` analytics store.
///
/// Replica rows hold the whole reservation snapshot as JSON next to the indexed
/// `status` and `version` columns.
#[derive(Debug, Clone)]
pub struct PostgresAnalyticsStore {
    pool: PgPool,
}

async fn write_replica(
    conn: &mut PgConnection,
    reservation: &Reservation,
) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r"
        INSERT INTO analytics_reservations (id, status, version, snapshot, updated_at)
        VALUES ($1, $2, $3, $4, NOW())
        ON CONFLICT (id) DO UPDATE
        SET status = EXCLUDED.status,
            version = EXCLUDED.version,
            snapshot = EXCLUDED.snapshot,
            updated_at = NOW()
        WHERE analytics_reservations.version <= EXCLUDED.version
        ",
    )
    .bind(reservation.id.get())
    .bind(reservation.status.as_str())
    .bind(reservation.version)
    .bind(Json(reservation))
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;
    Ok(result.rows_affected())
}

impl PostgresAnalyticsStore {
    /// Create a store from an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn upsert_tx(
        &self,
        change: ReservationChanged,
        checkpoint: ConsumerCheckpoint,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        if offsets::is_replay(&mut tx, &checkpoint).await? {
            tx.commit().await.map_err(db_error)?;
            return Ok(false);
        }

        let written = write_replica(&mut tx, &change.reservation).await?;
        offsets::record(&mut tx, &checkpoint).await?;
        tx.commit().await.map_err(db_error)?;

        if written == 0 {
            tracing::debug!(
                reservation_id = %change.reservation.id,
                version = change.reservation.version,
                "Ignoring stale snapshot"
            );
        }
        Ok(written > 0)
    }

    async fn confirm_tx(
        &self,
        payment: PaymentCompleted,
        checkpoint: ConsumerCheckpoint,
    ) -> Result<PaymentRecorded, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        if offsets::is_replay(&mut tx, &checkpoint).await? {
            tx.commit().await.map_err(db_error)?;
            return Ok(PaymentRecorded::Replayed);
        }

        let row: Option<(Json<Reservation>,)> = sqlx::query_as(
            "SELECT snapshot FROM analytics_reservations WHERE id = $1 FOR UPDATE",
        )
        .bind(payment.reservation_id.get())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;

        let recorded = match row {
            Some((Json(mut reservation),)) => {
                let outcome = lifecycle::apply(&mut reservation, &ReservationEvent::Confirm)?;
                if outcome.is_applied() {
                    write_replica(&mut tx, &reservation).await?;
                }
                PaymentRecorded::Replica {
                    reservation,
                    outcome,
                }
            },
            // The snapshot consumer has not caught up; the CONFIRMED snapshot will
            // create the row.
            None => PaymentRecorded::ReplicaPending,
        };

        sqlx::query(
            r"
            INSERT INTO analytics_revenue (payment_id, reservation_id, amount_cents, completed_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (payment_id) DO NOTHING
            ",
        )
        .bind(payment.payment_id.get())
        .bind(payment.reservation_id.get())
        .bind(i64::try_from(payment.amount_cents).unwrap_or(i64::MAX))
        .bind(payment.completed_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        offsets::record(&mut tx, &checkpoint).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(recorded)
    }

    async fn summary_rows(&self) -> Result<AnalyticsSummary, StoreError> {
        let by_status: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM analytics_reservations GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        let (captured, revenue): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(amount_cents), 0)::BIGINT FROM analytics_revenue",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(AnalyticsSummary {
            reservations_by_status: by_status
                .into_iter()
                .map(|(status, count)| (status, u64::try_from(count).unwrap_or(0)))
                .collect(),
            payments_captured: u64::try_from(captured).unwrap_or(0),
            revenue_cents: u64::try_from(revenue).unwrap_or(0),
        })
    }
}

impl AnalyticsStore for PostgresAnalyticsStore {
    fn upsert_snapshot(
        &self,
        change: ReservationChanged,
        checkpoint: ConsumerCheckpoint,
    ) -> PortFuture<'_, bool> {
        Box::pin(self.upsert_tx(change, checkpoint))
    }

    fn confirm(
        &self,
        payment: PaymentCompleted,
        checkpoint: ConsumerCheckpoint,
    ) -> PortFuture<'_, PaymentRecorded> {
        Box::pin(self.confirm_tx(payment, checkpoint))
    }

    fn summary(&self) -> PortFuture<'_, AnalyticsSummary> {
        Box::pin(self.summary_rows())
    }
}
