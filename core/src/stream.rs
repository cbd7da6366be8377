//! Change stream abstraction.
//!
//! The change stream carries facts between services: capture facts relayed from the
//! Payment outbox, derived `payment.completed` messages and reservation snapshots.
//!
//! # Delivery contract
//!
//! - **At-least-once**: a message is redelivered until its consumer acknowledges it
//! - **Ordered per key**: messages with the same key land on one partition and are
//!   delivered in publish order
//! - **Ack-gated**: an implementation hands out the next [`Delivery`] of a subscription
//!   only after the previous one was acknowledged; a delivery dropped without
//!   [`Delivery::ack`] ends the subscription without committing, so the message is
//!   delivered again after resubscribing
//!
//! # Implementations
//!
//! - `InMemoryChangeStream` in `rentflow-testing`
//! - `RedpandaChangeStream` in `rentflow-redpanda`
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` so services can hold `Arc<dyn ChangeStream>`.

use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors that can occur during change stream operations.
#[derive(Error, Debug, Clone)]
pub enum StreamError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Failed to commit a consumed offset
    #[error("Commit failed: {0}")]
    CommitFailed(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Where a message sits in the log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamPosition {
    /// Topic name
    pub topic: String,
    /// Partition within the topic
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
}

impl fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// A message read from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Log position
    pub position: StreamPosition,
    /// Partition key
    pub key: Option<String>,
    /// JSON payload
    pub payload: Vec<u8>,
}

/// A message plus the handle that acknowledges it.
#[derive(Debug)]
pub struct Delivery {
    message: StreamMessage,
    ack: Option<oneshot::Sender<()>>,
}

impl Delivery {
    /// Pair a message with the acknowledgement channel its producer waits on.
    #[must_use]
    pub const fn new(message: StreamMessage, ack: oneshot::Sender<()>) -> Self {
        Self {
            message,
            ack: Some(ack),
        }
    }

    /// The delivered message.
    #[must_use]
    pub const fn message(&self) -> &StreamMessage {
        &self.message
    }

    /// Acknowledge: the consumer's effect is durable, the position may be committed.
    pub fn ack(mut self) {
        if let Some(ack) = self.ack.take() {
            // Receiver gone means the subscription already ended; nothing to commit.
            let _ = ack.send(());
        }
    }
}

/// Stream of deliveries from a subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, StreamError>> + Send>>;

/// Trait for change stream implementations.
pub trait ChangeStream: Send + Sync {
    /// Publish `payload` on `topic` under partition `key`.
    ///
    /// Resolves once the broker has durably accepted the message.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::PublishFailed`] if the broker rejects the message.
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        key: &'a str,
        payload: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), StreamError>> + Send + 'a>>;

    /// Subscribe consumer `group` to `topics`.
    ///
    /// Each group receives every message; within a group, committed positions survive
    /// resubscription.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::SubscriptionFailed`] if the subscription cannot be set up.
    fn subscribe<'a>(
        &'a self,
        group: &'a str,
        topics: &'a [&'a str],
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, StreamError>> + Send + 'a>>;
}
