//! Reservation store, vehicle catalog and reservation outbox.

use crate::{cents, db_error, money, offsets, sql_limit};
use chrono::{DateTime, Utc};
use rentflow_core::error::StoreError;
use rentflow_core::lifecycle::{self, ReservationEvent};
use rentflow_core::messages::{RESERVATION_EVENTS_TOPIC, ReservationChanged, StreamPayload};
use rentflow_core::overlap;
use rentflow_core::ports::{
    ConsumerCheckpoint, OutboxRecord, OutboxSource, PortFuture, ReservationStore,
    TransitionResult, VehicleCatalog,
};
use rentflow_core::reservation::{
    ConditionReport, NewReservation, Reservation, ReservationStatus,
};
use rentflow_core::types::{CustomerId, Money, ReservationId, VehicleId};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool};

const RESERVATION_COLUMNS: &str = r"
    id, customer_id, vehicle_id, created_at, planned_pick_up, planned_drop_off,
    buffered_drop_off, actual_pick_up, actual_drop_off, status, total_amount_cents,
    condition, version
";

#[derive(Debug, FromRow)]
struct ReservationRow {
    id: i64,
    customer_id: String,
    vehicle_id: i64,
    created_at: DateTime<Utc>,
    planned_pick_up: DateTime<Utc>,
    planned_drop_off: DateTime<Utc>,
    buffered_drop_off: DateTime<Utc>,
    actual_pick_up: Option<DateTime<Utc>>,
    actual_drop_off: Option<DateTime<Utc>>,
    status: String,
    total_amount_cents: i64,
    condition: Option<Json<ConditionReport>>,
    version: i64,
}

impl TryFrom<ReservationRow> for Reservation {
    type Error = StoreError;

    fn try_from(row: ReservationRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: ReservationId::new(row.id),
            customer_id: CustomerId::new(row.customer_id),
            vehicle_id: VehicleId::new(row.vehicle_id),
            created_at: row.created_at,
            planned_pick_up: row.planned_pick_up,
            planned_drop_off: row.planned_drop_off,
            buffered_drop_off: row.buffered_drop_off,
            actual_pick_up: row.actual_pick_up,
            actual_drop_off: row.actual_drop_off,
            status: row
                .status
                .parse::<ReservationStatus>()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            total_amount: money(row.total_amount_cents)?,
            condition: row.condition.map(|Json(report)| report),
            version: row.version,
        })
    }
}

/// Statuses that claim a vehicle window, as stored.
fn blocking_statuses() -> Vec<String> {
    ReservationStatus::ALL
        .into_iter()
        .filter(|status| status.blocks_vehicle())
        .map(|status| status.as_str().to_string())
        .collect()
}

/// `PostgreSQL` reservation store.
///
/// Creation takes a transaction-scoped advisory lock keyed by the vehicle id before
/// counting overlaps, so concurrent bookings of one vehicle are serialized across
/// every service instance while bookings of different vehicles proceed in parallel.
#[derive(Debug, Clone)]
pub struct PostgresReservationStore {
    pool: PgPool,
}

impl PostgresReservationStore {
    /// Create a store from an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_guarded_tx(&self, new: NewReservation) -> Result<Reservation, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(new.vehicle_id.get())
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        let window = new.window();
        // Only non-terminal statuses claim the vehicle. COMPLETED means it was
        // returned, so like CANCELLED and EXPIRED it never blocks a new booking.
        let (conflicts,): (i64,) = sqlx::query_as(
            r"
            SELECT COUNT(*)
            FROM reservations
            WHERE vehicle_id = $1
              AND status = ANY($2)
              AND planned_pick_up < $4
              AND buffered_drop_off > $3
            ",
        )
        .bind(new.vehicle_id.get())
        .bind(blocking_statuses())
        .bind(window.start())
        .bind(window.end())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;

        overlap::ensure_available(
            usize::try_from(conflicts).unwrap_or(usize::MAX),
            new.vehicle_id,
            &window,
        )?;

        let row: ReservationRow = sqlx::query_as(&format!(
            r"
            INSERT INTO reservations (
                customer_id, vehicle_id, created_at, planned_pick_up, planned_drop_off,
                buffered_drop_off, status, total_amount_cents, version
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 1)
            RETURNING {RESERVATION_COLUMNS}
            "
        ))
        .bind(new.customer_id.as_str())
        .bind(new.vehicle_id.get())
        .bind(new.created_at)
        .bind(new.planned_pick_up)
        .bind(new.planned_drop_off)
        .bind(new.buffered_drop_off)
        .bind(ReservationStatus::Pending.as_str())
        .bind(cents(new.total_amount)?)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;
        let reservation = Reservation::try_from(row)?;

        append_snapshot(&mut tx, &reservation, reservation.created_at).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(reservation)
    }

    async fn get_row(&self, id: ReservationId) -> Result<Reservation, StoreError> {
        let row: Option<ReservationRow> = sqlx::query_as(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = $1"
        ))
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.ok_or_else(|| StoreError::not_found("reservation", id))?
            .try_into()
    }

    async fn transition_tx(
        &self,
        id: ReservationId,
        event: ReservationEvent,
        at: DateTime<Utc>,
        checkpoint: Option<ConsumerCheckpoint>,
    ) -> Result<TransitionResult, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        if let Some(checkpoint) = &checkpoint {
            if offsets::is_replay(&mut tx, checkpoint).await? {
                tx.commit().await.map_err(db_error)?;
                return Ok(TransitionResult::Replayed);
            }
        }

        let row: Option<ReservationRow> = sqlx::query_as(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.get())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;
        let mut reservation: Reservation = row
            .ok_or_else(|| StoreError::not_found("reservation", id))?
            .try_into()?;

        let outcome = lifecycle::apply(&mut reservation, &event)?;
        if outcome.is_applied() {
            sqlx::query(
                r"
                UPDATE reservations
                SET status = $2,
                    actual_pick_up = $3,
                    actual_drop_off = $4,
                    condition = $5,
                    version = $6
                WHERE id = $1
                ",
            )
            .bind(id.get())
            .bind(reservation.status.as_str())
            .bind(reservation.actual_pick_up)
            .bind(reservation.actual_drop_off)
            .bind(reservation.condition.map(Json))
            .bind(reservation.version)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
            append_snapshot(&mut tx, &reservation, at).await?;
        }
        if let Some(checkpoint) = &checkpoint {
            offsets::record(&mut tx, checkpoint).await?;
        }

        tx.commit().await.map_err(db_error)?;
        Ok(TransitionResult::Done {
            reservation,
            outcome,
        })
    }

    async fn find_expirable_rows(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reservation>, StoreError> {
        let rows: Vec<ReservationRow> = sqlx::query_as(&format!(
            r"
            SELECT {RESERVATION_COLUMNS}
            FROM reservations
            WHERE status = 'PENDING' AND created_at <= $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "
        ))
        .bind(created_before)
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(Reservation::try_from).collect()
    }

    async fn delete_row(&self, id: ReservationId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM reservations WHERE id = $1")
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("reservation", id));
        }
        tracing::info!(reservation_id = %id, "Reservation deleted");
        Ok(())
    }
}

async fn append_snapshot(
    conn: &mut PgConnection,
    reservation: &Reservation,
    at: DateTime<Utc>,
) -> Result<(), StoreError> {
    let change = ReservationChanged {
        reservation: reservation.clone(),
        occurred_at: at,
    };
    let payload =
        serde_json::to_value(&change).map_err(|e| StoreError::Corrupt(e.to_string()))?;

    sqlx::query(
        r"
        INSERT INTO reservation_outbox (topic, message_key, payload, created_at)
        VALUES ($1, $2, $3, $4)
        ",
    )
    .bind(RESERVATION_EVENTS_TOPIC)
    .bind(change.key())
    .bind(payload)
    .bind(change.occurred_at)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;
    Ok(())
}

impl ReservationStore for PostgresReservationStore {
    fn insert_guarded(&self, reservation: NewReservation) -> PortFuture<'_, Reservation> {
        Box::pin(self.insert_guarded_tx(reservation))
    }

    fn get(&self, id: ReservationId) -> PortFuture<'_, Reservation> {
        Box::pin(self.get_row(id))
    }

    fn transition(
        &self,
        id: ReservationId,
        event: ReservationEvent,
        at: DateTime<Utc>,
        checkpoint: Option<ConsumerCheckpoint>,
    ) -> PortFuture<'_, TransitionResult> {
        Box::pin(self.transition_tx(id, event, at, checkpoint))
    }

    fn find_expirable(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> PortFuture<'_, Vec<Reservation>> {
        Box::pin(self.find_expirable_rows(created_before, limit))
    }

    fn delete(&self, id: ReservationId) -> PortFuture<'_, ()> {
        Box::pin(self.delete_row(id))
    }
}

#[derive(Debug, FromRow)]
struct OutboxRow {
    id: i64,
    topic: String,
    message_key: String,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<OutboxRow> for OutboxRecord {
    type Error = StoreError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            topic: row.topic,
            key: row.message_key,
            payload: serde_json::to_vec(&row.payload)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            created_at: row.created_at,
        })
    }
}

impl OutboxSource for PostgresReservationStore {
    fn fetch_unrelayed(&self, limit: usize) -> PortFuture<'_, Vec<OutboxRecord>> {
        Box::pin(async move {
            let rows: Vec<OutboxRow> = sqlx::query_as(
                r"
                SELECT id, topic, message_key, payload, created_at
                FROM reservation_outbox
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
            sqlx::query("UPDATE reservation_outbox SET relayed_at = $2 WHERE id = ANY($1)")
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
            let result = sqlx::query("DELETE FROM reservation_outbox WHERE relayed_at < $1")
                .bind(older_than)
                .execute(&self.pool)
                .await
                .map_err(db_error)?;
            Ok(result.rows_affected())
        })
    }
}

/// Daily rates read from the `vehicles` table.
#[derive(Debug, Clone)]
pub struct PostgresVehicleCatalog {
    pool: PgPool,
}

impl PostgresVehicleCatalog {
    /// Create a catalog from an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Register a vehicle, returning its id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the insert fails.
    pub async fn add_vehicle(&self, name: &str, daily_rate: Money) -> Result<VehicleId, StoreError> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO vehicles (name, daily_rate_cents) VALUES ($1, $2) RETURNING id",
        )
        .bind(name)
        .bind(cents(daily_rate)?)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(VehicleId::new(id))
    }
}

impl VehicleCatalog for PostgresVehicleCatalog {
    fn daily_rate(&self, vehicle: VehicleId) -> PortFuture<'_, Money> {
        Box::pin(async move {
            let rate: Option<(i64,)> =
                sqlx::query_as("SELECT daily_rate_cents FROM vehicles WHERE id = $1")
                    .bind(vehicle.get())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(db_error)?;
            let (cents,) = rate.ok_or_else(|| StoreError::not_found("vehicle", vehicle))?;
            money(cents)
        })
    }
}
