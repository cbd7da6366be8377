//! Redpanda change stream for Rentflow.
//!
//! Implements [`ChangeStream`] from `rentflow-core` on rdkafka, so it works against
//! Redpanda or any other Kafka-compatible broker.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  Local tx       │  state change + outbox row
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  Outbox relay   │  publish(topic, key, payload)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │   Redpanda      │  one partition per key
//! └────────┬────────┘
//!          │
//!     ┌────┴────┐
//!     ▼         ▼
//! ┌───────┐ ┌──────────┐
//! │ Saga  │ │ Analytics│  one consumer group each
//! └───────┘ └──────────┘
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once, ack-gated**:
//! - Offsets are committed manually, only after the consumer acknowledged the
//!   [`Delivery`], i.e. after its local transaction committed
//! - The next message is handed out only once the previous one was acknowledged
//! - A delivery dropped without an ack ends the subscription without committing;
//!   the message comes back when the group resubscribes
//! - Ordering holds per key (the partition key)
//!
//! # Example
//!
//! ```no_run
//! use rentflow_redpanda::RedpandaChangeStream;
//! use rentflow_core::stream::ChangeStream;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let stream = RedpandaChangeStream::new("localhost:9092")?;
//! stream.publish("payment.completed", "EC-1", b"{}").await?;
//!
//! let mut deliveries = stream.subscribe("reservation-confirmation", &["payment.completed"]).await?;
//! while let Some(delivery) = deliveries.next().await {
//!     let delivery = delivery?;
//!     println!("{}", delivery.message().position);
//!     delivery.ack();
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rentflow_core::stream::{
    ChangeStream, Delivery, DeliveryStream, StreamError, StreamMessage, StreamPosition,
};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Redpanda change stream.
///
/// Holds one producer; each [`subscribe`](ChangeStream::subscribe) call creates its own
/// consumer in the requested group.
///
/// # Example
///
/// ```no_run
/// use rentflow_redpanda::RedpandaChangeStream;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let stream = RedpandaChangeStream::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .compression("lz4")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaChangeStream {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    auto_offset_reset: String,
    session_timeout: Duration,
}

impl RedpandaChangeStream {
    /// Connect with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, StreamError> {
        Self::builder().brokers(brokers).build()
    }

    /// Start configuring a change stream.
    #[must_use]
    pub fn builder() -> RedpandaChangeStreamBuilder {
        RedpandaChangeStreamBuilder::default()
    }

    /// Bootstrap servers.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }
}

/// Builder for [`RedpandaChangeStream`].
#[derive(Default)]
pub struct RedpandaChangeStreamBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    auto_offset_reset: Option<String>,
    session_timeout: Option<Duration>,
}

impl RedpandaChangeStreamBuilder {
    /// Comma-separated broker addresses.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acknowledgment mode: `"1"` or `"all"`.
    ///
    /// Default: `"all"`; the relay marks outbox rows only after this ack.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"`, `"zstd"`.
    ///
    /// Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Where a group without committed offsets starts reading.
    ///
    /// Default: `"earliest"`, so a new consumer group sees every retained fact.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Consumer session timeout.
    ///
    /// Default: 6 seconds
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Build the change stream.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::ConnectionFailed`] if brokers are missing or the producer
    /// cannot be created.
    pub fn build(self) -> Result<RedpandaChangeStream, StreamError> {
        let brokers = self
            .brokers
            .ok_or_else(|| StreamError::ConnectionFailed("Brokers not configured".to_string()))?;
        let acks = self.producer_acks.unwrap_or_else(|| "all".to_string());
        let compression = self.compression.unwrap_or_else(|| "none".to_string());
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", &acks)
            .set("enable.idempotence", if acks == "all" { "true" } else { "false" })
            .set("compression.type", &compression)
            .create()
            .map_err(|e| StreamError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());

        tracing::info!(
            brokers = %brokers,
            acks = %acks,
            compression = %compression,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaChangeStream created"
        );

        Ok(RedpandaChangeStream {
            producer,
            brokers,
            timeout,
            auto_offset_reset,
            session_timeout: self.session_timeout.unwrap_or(Duration::from_secs(6)),
        })
    }
}

fn to_stream_message(message: &BorrowedMessage<'_>) -> StreamMessage {
    StreamMessage {
        position: StreamPosition {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
        },
        key: message
            .key()
            .map(|key| String::from_utf8_lossy(key).into_owned()),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
    }
}

impl ChangeStream for RedpandaChangeStream {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        key: &'a str,
        payload: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), StreamError>> + Send + 'a>> {
        Box::pin(async move {
            let record = FutureRecord::to(topic).payload(payload).key(key);

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(topic, key, partition, offset, "Message published");
                    Ok(())
                },
                Err((kafka_error, _)) => {
                    tracing::error!(topic, key, error = %kafka_error, "Failed to publish message");
                    Err(StreamError::PublishFailed {
                        topic: topic.to_string(),
                        reason: kafka_error.to_string(),
                    })
                },
            }
        })
    }

    fn subscribe<'a>(
        &'a self,
        group: &'a str,
        topics: &'a [&'a str],
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, StreamError>> + Send + 'a>> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();
        let group = group.to_string();

        Box::pin(async move {
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &group)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &self.auto_offset_reset)
                .set("session.timeout.ms", self.session_timeout.as_millis().to_string())
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| StreamError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| StreamError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to subscribe to topics: {e}"),
                })?;

            tracing::info!(topics = ?topics, group = %group, "Subscribed to topics");

            // Capacity 1: the next message waits for the previous ack anyway.
            let (tx, mut rx) = tokio::sync::mpsc::channel(1);

            tokio::spawn(async move {
                use futures::StreamExt;
                use rdkafka::consumer::CommitMode;

                let mut stream = consumer.stream();

                while let Some(received) = stream.next().await {
                    let message = match received {
                        Ok(message) => message,
                        Err(e) => {
                            let error =
                                StreamError::TransportError(format!("Failed to receive message: {e}"));
                            if tx.send(Err(error)).await.is_err() {
                                break;
                            }
                            continue;
                        },
                    };

                    let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
                    let delivery = Delivery::new(to_stream_message(&message), ack_tx);
                    if tx.send(Ok(delivery)).await.is_err() {
                        tracing::debug!(group = %group, "Subscriber dropped, exiting consumer task");
                        break;
                    }

                    if ack_rx.await.is_err() {
                        tracing::debug!(
                            group = %group,
                            topic = message.topic(),
                            partition = message.partition(),
                            offset = message.offset(),
                            "Delivery dropped without ack, ending subscription"
                        );
                        break;
                    }

                    if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                        // The local transaction already recorded the position; a
                        // redelivery after this is detected as a replay.
                        tracing::warn!(
                            topic = message.topic(),
                            partition = message.partition(),
                            offset = message.offset(),
                            error = %e,
                            "Failed to commit offset (message may be redelivered)"
                        );
                    }
                }

                tracing::debug!(group = %group, "Consumer task exiting");
            });

            let stream = async_stream::stream! {
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}
