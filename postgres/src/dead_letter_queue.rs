//! Dead letter queue for saga messages a consumer could not apply.
//!
//! Entries keep the raw payload and stream position so an operator can inspect,
//! replay by hand, and then resolve or discard them.

use crate::{db_error, sql_limit};
use chrono::{DateTime, Utc};
use rentflow_core::error::StoreError;
use rentflow_core::ports::{DeadLetterSink, PortFuture};
use rentflow_core::stream::{StreamMessage, StreamPosition};
use serde::Serialize;
use sqlx::{PgPool, Row};

/// Status of a dead-lettered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DLQStatus {
    /// Waiting for an operator
    Pending,
    /// Fixed and replayed
    Resolved,
    /// Dropped for good
    Discarded,
}

impl DLQStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse the database representation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] for an unknown status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(StoreError::Corrupt(format!("invalid DLQ status: {s}"))),
        }
    }
}

/// A dead-lettered message with its failure metadata.
#[derive(Debug, Clone, Serialize)]
pub struct FailedMessage {
    /// Entry id
    pub id: i64,
    /// Consumer that gave up
    pub consumer: String,
    /// Where the message sat in the stream
    #[serde(serialize_with = "serialize_position")]
    pub position: StreamPosition,
    /// Partition key
    pub key: Option<String>,
    /// Raw payload, lossily decoded as UTF-8 when serialized
    #[serde(serialize_with = "serialize_payload")]
    pub payload: Vec<u8>,
    /// Why the consumer rejected it
    pub error_message: String,
    /// When it was dead-lettered
    pub first_failed_at: DateTime<Utc>,
    /// Current status
    pub status: DLQStatus,
    /// When it left the pending state
    pub resolved_at: Option<DateTime<Utc>>,
    /// Operator who resolved it
    pub resolved_by: Option<String>,
    /// Operator notes
    pub resolution_notes: Option<String>,
}

fn serialize_position<S: serde::Serializer>(
    position: &StreamPosition,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(position)
}

fn serialize_payload<S: serde::Serializer>(
    payload: &[u8],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(payload))
}

const SELECT_COLUMNS: &str = r"
    SELECT id, consumer, topic, partition, message_offset, message_key, payload,
           error_message, first_failed_at, status, resolved_at, resolved_by, resolution_notes
    FROM failed_messages
";

/// `PostgreSQL` dead letter queue.
///
/// # Example
///
/// ```no_run
/// use rentflow_postgres::DeadLetterQueue;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = DeadLetterQueue::new(pool);
/// for entry in dlq.list_unresolved(50).await? {
///     println!("{} {}: {}", entry.consumer, entry.position, entry.error_message);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DeadLetterQueue {
    pool: PgPool,
}

impl DeadLetterQueue {
    /// Create a queue from an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Store a message the consumer gave up on. Returns the entry id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the insert fails.
    pub async fn add_entry(
        &self,
        consumer: &str,
        message: &StreamMessage,
        error_message: &str,
    ) -> Result<i64, StoreError> {
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO failed_messages (
                consumer, topic, partition, message_offset, message_key, payload, error_message
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            ",
        )
        .bind(consumer)
        .bind(&message.position.topic)
        .bind(message.position.partition)
        .bind(message.position.offset)
        .bind(message.key.as_deref())
        .bind(&message.payload)
        .bind(error_message)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        tracing::warn!(
            dlq_id = id,
            consumer,
            position = %message.position,
            error = error_message,
            "Message added to dead letter queue"
        );

        metrics::counter!("rentflow_dead_letters_total", "consumer" => consumer.to_string())
            .increment(1);

        Ok(id)
    }

    /// Pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the query fails.
    pub async fn list_unresolved(&self, limit: usize) -> Result<Vec<FailedMessage>, StoreError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE status = 'pending' ORDER BY first_failed_at ASC, id ASC LIMIT $1"
        ))
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(Self::row_to_failed_message).collect()
    }

    /// Load one entry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if there is no such entry.
    pub async fn get_by_id(&self, id: i64) -> Result<FailedMessage, StoreError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .ok_or_else(|| StoreError::not_found("dead letter", id))?;

        Self::row_to_failed_message(&row)
    }

    /// Mark a pending entry resolved.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no pending entry has this id.
    pub async fn resolve(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), StoreError> {
        self.close(id, DLQStatus::Resolved, Some(resolved_by), notes)
            .await?;
        tracing::info!(dlq_id = id, resolved_by, "Dead letter resolved");
        metrics::counter!("rentflow_dead_letters_resolved_total").increment(1);
        Ok(())
    }

    /// Mark a pending entry discarded.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no pending entry has this id.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), StoreError> {
        self.close(id, DLQStatus::Discarded, None, Some(reason)).await?;
        tracing::warn!(dlq_id = id, reason, "Dead letter discarded");
        Ok(())
    }

    /// Number of pending entries.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the query fails.
    pub async fn count_unresolved(&self) -> Result<u64, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM failed_messages WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(db_error)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn close(
        &self,
        id: i64,
        status: DLQStatus,
        resolved_by: Option<&str>,
        notes: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"
            UPDATE failed_messages
            SET status = $2, resolved_at = NOW(), resolved_by = $3, resolution_notes = $4
            WHERE id = $1 AND status = 'pending'
            ",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(resolved_by)
        .bind(notes)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("pending dead letter", id));
        }
        Ok(())
    }

    fn row_to_failed_message(row: &sqlx::postgres::PgRow) -> Result<FailedMessage, StoreError> {
        let status: String = row.try_get("status").map_err(db_error)?;
        Ok(FailedMessage {
            id: row.try_get("id").map_err(db_error)?,
            consumer: row.try_get("consumer").map_err(db_error)?,
            position: StreamPosition {
                topic: row.try_get("topic").map_err(db_error)?,
                partition: row.try_get("partition").map_err(db_error)?,
                offset: row.try_get("message_offset").map_err(db_error)?,
            },
            key: row.try_get("message_key").map_err(db_error)?,
            payload: row.try_get("payload").map_err(db_error)?,
            error_message: row.try_get("error_message").map_err(db_error)?,
            first_failed_at: row.try_get("first_failed_at").map_err(db_error)?,
            status: DLQStatus::parse(&status)?,
            resolved_at: row.try_get("resolved_at").map_err(db_error)?,
            resolved_by: row.try_get("resolved_by").map_err(db_error)?,
            resolution_notes: row.try_get("resolution_notes").map_err(db_error)?,
        })
    }
}

impl DeadLetterSink for DeadLetterQueue {
    fn dead_letter<'a>(
        &'a self,
        consumer: &'a str,
        message: &'a StreamMessage,
        reason: &'a str,
    ) -> PortFuture<'a, ()> {
        Box::pin(async move {
            self.add_entry(consumer, message, reason).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_its_own_representation() {
        for status in [DLQStatus::Pending, DLQStatus::Resolved, DLQStatus::Discarded] {
            assert_eq!(DLQStatus::parse(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn unknown_status_is_corrupt() {
        assert!(matches!(
            DLQStatus::parse("processing"),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn entry_serializes_position_and_payload_as_text() {
        let entry = FailedMessage {
            id: 7,
            consumer: "reservation-confirmation".to_string(),
            position: StreamPosition {
                topic: "payment.completed".to_string(),
                partition: 2,
                offset: 41,
            },
            key: Some("EC-1".to_string()),
            payload: b"{\"bad\":true}".to_vec(),
            error_message: "missing field".to_string(),
            first_failed_at: DateTime::parse_from_rfc3339("2025-06-01T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            status: DLQStatus::Pending,
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
        };

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["position"], "payment.completed[2]@41");
        assert_eq!(json["payload"], "{\"bad\":true}");
        assert_eq!(json["status"], "pending");
    }
}
