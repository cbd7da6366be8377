//! Saga consumer with automatic reconnection.
//!
//! # Pattern: Subscribe-Process-Reconnect Loop
//!
//! ```text
//! loop {
//!     subscribe(group, topics)
//!     for each delivery:
//!         loop {
//!             match handler.handle(message) {
//!                 Applied       => ack, next delivery
//!                 DeadLetter(r) => store in the sink, ack, next delivery
//!                 Retry(r)      => wait retry_delay, handle the same delivery again
//!             }
//!         }
//!     stream ended or failed => wait retry_delay, resubscribe
//! }
//! ```
//!
//! A delivery is acknowledged only after its effect is durable. Shutdown drops the
//! current delivery without acknowledging it, so the message is delivered again after
//! the restart.

use super::{Outcome, SagaHandler};
use crate::metrics;
use futures::StreamExt;
use rentflow_core::ports::DeadLetterSink;
use rentflow_core::stream::{ChangeStream, DeliveryStream};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Why a subscription stopped.
enum Flow {
    Shutdown,
    Reconnect,
}

/// Change stream consumer running one [`SagaHandler`].
pub struct SagaConsumer {
    /// Consumer name (checkpoints, dead letters, logs)
    name: String,

    /// Consumer group on the stream
    group: String,

    /// Topics to subscribe to
    topics: Vec<String>,

    stream: Arc<dyn ChangeStream>,
    handler: Arc<dyn SagaHandler>,
    dead_letters: Arc<dyn DeadLetterSink>,
    shutdown: broadcast::Receiver<()>,

    /// Backoff for transient failures and reconnects (default: 5 seconds)
    retry_delay: Duration,
}

impl SagaConsumer {
    /// Create a consumer with the default retry delay.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        group: impl Into<String>,
        topics: &[&str],
        stream: Arc<dyn ChangeStream>,
        handler: Arc<dyn SagaHandler>,
        dead_letters: Arc<dyn DeadLetterSink>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
            topics: topics.iter().map(ToString::to_string).collect(),
            stream,
            handler,
            dead_letters,
            shutdown,
            retry_delay: Duration::from_secs(5),
        }
    }

    /// Set custom retry delay.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Spawn the consumer as a background task.
    #[must_use]
    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Run until the shutdown signal.
    pub async fn run(&mut self) {
        info!(consumer = %self.name, group = %self.group, "Saga consumer started");

        loop {
            let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();
            let subscription = tokio::select! {
                _ = self.shutdown.recv() => break,
                subscription = self.stream.subscribe(&self.group, &topics) => subscription,
            };

            match subscription {
                Ok(mut deliveries) => {
                    info!(consumer = %self.name, topics = ?self.topics, "Subscribed to change stream");
                    if matches!(self.process(&mut deliveries).await, Flow::Shutdown) {
                        break;
                    }
                    warn!(
                        consumer = %self.name,
                        "Subscription ended, reconnecting in {:?}",
                        self.retry_delay
                    );
                },
                Err(e) => {
                    error!(
                        consumer = %self.name,
                        error = %e,
                        "Failed to subscribe, retrying in {:?}",
                        self.retry_delay
                    );
                },
            }

            tokio::select! {
                _ = self.shutdown.recv() => break,
                () = tokio::time::sleep(self.retry_delay) => {},
            }
        }

        info!(consumer = %self.name, "Saga consumer stopped");
    }

    async fn process(&mut self, deliveries: &mut DeliveryStream) -> Flow {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.recv() => return Flow::Shutdown,
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    error!(consumer = %self.name, error = %e, "Error receiving from change stream");
                    return Flow::Reconnect;
                },
                None => return Flow::Reconnect,
            };

            loop {
                let outcome = self.handler.handle(&self.name, delivery.message()).await;
                metrics::record_saga_outcome(&self.name, outcome.label());

                match outcome {
                    Outcome::Applied => {
                        delivery.ack();
                        break;
                    },
                    Outcome::DeadLetter(reason) => {
                        let stored = self
                            .dead_letters
                            .dead_letter(&self.name, delivery.message(), &reason)
                            .await;
                        match stored {
                            Ok(()) => {
                                warn!(
                                    consumer = %self.name,
                                    position = %delivery.message().position,
                                    reason = %reason,
                                    "Message dead-lettered"
                                );
                                delivery.ack();
                                break;
                            },
                            Err(e) => error!(
                                consumer = %self.name,
                                position = %delivery.message().position,
                                error = %e,
                                "Failed to dead-letter message, retrying in {:?}",
                                self.retry_delay
                            ),
                        }
                    },
                    Outcome::Retry(reason) => error!(
                        consumer = %self.name,
                        position = %delivery.message().position,
                        reason = %reason,
                        "Transient failure, retrying in {:?}",
                        self.retry_delay
                    ),
                }

                tokio::select! {
                    _ = self.shutdown.recv() => return Flow::Shutdown,
                    () = tokio::time::sleep(self.retry_delay) => {},
                }
            }
        }
    }
}
