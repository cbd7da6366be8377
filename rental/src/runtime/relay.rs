//! Outbox relay.
//!
//! Drains an outbox in id order onto the change stream. Rows are marked relayed only
//! after the broker accepted them, and a failed publish stops the batch so later rows
//! never overtake it. A crash between publish and mark republishes; consumers dedupe.

use crate::metrics;
use chrono::Duration as ChronoDuration;
use rentflow_core::environment::Clock;
use rentflow_core::error::RentalError;
use rentflow_core::ports::OutboxSource;
use rentflow_core::stream::ChangeStream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// What one relay pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    /// Rows published and marked
    pub published: usize,
    /// Relayed rows removed by retention
    pub purged: u64,
}

/// Publishes outbox rows on the change stream.
pub struct OutboxRelay {
    name: &'static str,
    source: Arc<dyn OutboxSource>,
    stream: Arc<dyn ChangeStream>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    retention: ChronoDuration,
}

impl OutboxRelay {
    /// Relay for the outbox `name` with a batch of 100 and a retention of 7 days.
    #[must_use]
    pub fn new(
        name: &'static str,
        source: Arc<dyn OutboxSource>,
        stream: Arc<dyn ChangeStream>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name,
            source,
            stream,
            clock,
            batch_size: 100,
            retention: ChronoDuration::days(7),
        }
    }

    /// Rows published per pass at most.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// How long relayed rows are kept.
    #[must_use]
    pub const fn with_retention(mut self, retention: ChronoDuration) -> Self {
        self.retention = retention;
        self
    }

    /// Publish the oldest unrelayed rows, then purge rows past retention.
    ///
    /// # Errors
    ///
    /// Returns [`RentalError::Transient`] if the outbox or the stream is unavailable.
    /// Rows published before a failing one are still marked.
    pub async fn relay_once(&self) -> Result<RelayReport, RentalError> {
        let batch = self.source.fetch_unrelayed(self.batch_size).await?;

        let mut relayed = Vec::with_capacity(batch.len());
        let mut failure = None;
        for record in &batch {
            match self
                .stream
                .publish(&record.topic, &record.key, &record.payload)
                .await
            {
                Ok(()) => {
                    metrics::record_outbox_relayed(&record.topic);
                    relayed.push(record.id);
                },
                Err(e) => {
                    failure = Some(e);
                    break;
                },
            }
        }

        let now = self.clock.now();
        let published = relayed.len();
        if !relayed.is_empty() {
            self.source.mark_relayed(relayed, now).await?;
            tracing::debug!(outbox = self.name, published, "Outbox rows relayed");
        }

        if let Some(e) = failure {
            return Err(RentalError::Transient(e.to_string()));
        }

        let purged = self.source.purge_relayed(now - self.retention).await?;
        if purged > 0 {
            metrics::record_outbox_purged(purged);
            tracing::info!(outbox = self.name, purged, "Relayed outbox rows purged");
        }

        Ok(RelayReport { published, purged })
    }

    /// Spawn the relay loop. A full batch is followed immediately by the next pass;
    /// otherwise the relay waits `poll_interval`.
    #[must_use]
    pub fn spawn(
        self,
        poll_interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(outbox = self.name, "Outbox relay started");
            loop {
                let drained = match self.relay_once().await {
                    Ok(report) => report.published < self.batch_size,
                    Err(e) => {
                        tracing::error!(outbox = self.name, error = %e, "Outbox relay failed");
                        true
                    },
                };

                if drained {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        () = tokio::time::sleep(poll_interval) => {},
                    }
                } else if shutdown.try_recv().is_ok() {
                    break;
                }
            }
            tracing::info!(outbox = self.name, "Outbox relay stopped");
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rentflow_core::messages::{CAPTURE_COMPLETED_TOPIC, CaptureCompleted, StreamPayload};
    use rentflow_core::payment::NewPayment;
    use rentflow_core::ports::PaymentStore;
    use rentflow_core::types::{CustomerId, GatewayToken, Money, PayerId, ReservationId};
    use rentflow_testing::{InMemoryChangeStream, InMemoryPaymentStore, ManualClock};

    async fn completed_payment(store: &InMemoryPaymentStore, clock: &ManualClock, n: i64) {
        let token = GatewayToken::new(format!("EC-{n}"));
        store
            .open(NewPayment {
                token: token.clone(),
                reservation_id: ReservationId::new(n),
                customer_id: CustomerId::new("alice"),
                amount: Money::from_units(50),
                created_at: clock.now(),
            })
            .await
            .unwrap();
        store
            .mark_paid(token.clone(), PayerId::new("PAYER"), clock.now())
            .await
            .unwrap();
        store
            .complete_with_capture(token, PayerId::new("PAYER"), clock.now())
            .await
            .unwrap();
    }

    fn relay(
        store: &InMemoryPaymentStore,
        stream: &InMemoryChangeStream,
        clock: &ManualClock,
    ) -> OutboxRelay {
        OutboxRelay::new(
            "capture_events",
            Arc::new(store.clone()),
            Arc::new(stream.clone()),
            Arc::new(clock.clone()),
        )
    }

    #[tokio::test]
    async fn facts_are_published_once_in_commit_order() {
        let clock = ManualClock::at("2025-06-01T10:00:00Z");
        let store = InMemoryPaymentStore::new();
        let stream = InMemoryChangeStream::new();
        for n in 1..=3 {
            completed_payment(&store, &clock, n).await;
        }
        let relay = relay(&store, &stream, &clock);

        assert_eq!(relay.relay_once().await.unwrap().published, 3);
        assert_eq!(relay.relay_once().await.unwrap().published, 0);

        let tokens: Vec<_> = stream
            .published(CAPTURE_COMPLETED_TOPIC)
            .iter()
            .map(|message| {
                CaptureCompleted::decode(&message.payload)
                    .unwrap()
                    .paypal_token
                    .to_string()
            })
            .collect();
        assert_eq!(tokens, vec!["EC-1", "EC-2", "EC-3"]);
    }

    #[tokio::test]
    async fn failed_publish_keeps_the_row_for_the_next_pass() {
        let clock = ManualClock::at("2025-06-01T10:00:00Z");
        let store = InMemoryPaymentStore::new();
        let stream = InMemoryChangeStream::new();
        completed_payment(&store, &clock, 1).await;
        let relay = relay(&store, &stream, &clock);

        stream.fail_next_publishes(1);
        assert!(relay.relay_once().await.unwrap_err().is_transient());
        assert!(stream.published(CAPTURE_COMPLETED_TOPIC).is_empty());

        assert_eq!(relay.relay_once().await.unwrap().published, 1);
        assert_eq!(stream.published(CAPTURE_COMPLETED_TOPIC).len(), 1);
    }

    #[tokio::test]
    async fn relayed_rows_are_purged_after_retention() {
        let clock = ManualClock::at("2025-06-01T10:00:00Z");
        let store = InMemoryPaymentStore::new();
        let stream = InMemoryChangeStream::new();
        completed_payment(&store, &clock, 1).await;
        let relay = relay(&store, &stream, &clock).with_retention(ChronoDuration::hours(1));

        assert_eq!(relay.relay_once().await.unwrap().purged, 0);

        clock.advance(ChronoDuration::hours(2));
        assert_eq!(relay.relay_once().await.unwrap().purged, 1);
    }
}
