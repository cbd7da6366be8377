//! Saga consumer offsets, read and written inside the caller's transaction.

use crate::db_error;
use rentflow_core::error::StoreError;
use rentflow_core::ports::ConsumerCheckpoint;
use sqlx::PgConnection;

/// Whether the checkpoint's message was already applied. Locks the offset row so
/// a concurrent redelivery waits for this transaction.
pub(crate) async fn is_replay(
    conn: &mut PgConnection,
    checkpoint: &ConsumerCheckpoint,
) -> Result<bool, StoreError> {
    let applied: Option<(i64,)> = sqlx::query_as(
        r"
        SELECT applied_offset
        FROM consumer_offsets
        WHERE consumer = $1 AND topic = $2 AND partition = $3
        FOR UPDATE
        ",
    )
    .bind(&checkpoint.consumer)
    .bind(&checkpoint.position.topic)
    .bind(checkpoint.position.partition)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error)?;

    let replay = applied.is_some_and(|(offset,)| offset >= checkpoint.position.offset);
    if replay {
        tracing::debug!(
            consumer = %checkpoint.consumer,
            position = %checkpoint.position,
            "Skipping already applied message"
        );
    }
    Ok(replay)
}

/// Advance the consumer's offset; never moves it backwards.
pub(crate) async fn record(
    conn: &mut PgConnection,
    checkpoint: &ConsumerCheckpoint,
) -> Result<(), StoreError> {
    sqlx::query(
        r"
        INSERT INTO consumer_offsets (consumer, topic, partition, applied_offset)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (consumer, topic, partition) DO UPDATE
        SET applied_offset = GREATEST(consumer_offsets.applied_offset, EXCLUDED.applied_offset),
            updated_at = NOW()
        ",
    )
    .bind(&checkpoint.consumer)
    .bind(&checkpoint.position.topic)
    .bind(checkpoint.position.partition)
    .bind(checkpoint.position.offset)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;
    Ok(())
}
