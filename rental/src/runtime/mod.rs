//! Background tasks of the services.
//!
//! - **`consumer`**: subscribe-process-reconnect loop driving a [`SagaHandler`]
//! - **`handlers`**: the saga steps of each service
//! - **`relay`**: publishes outbox rows on the change stream
//! - **`sweeper`**: expires reservations that were never paid

pub mod consumer;
pub mod handlers;
pub mod relay;
pub mod sweeper;

pub use consumer::SagaConsumer;
pub use relay::OutboxRelay;
pub use sweeper::ExpirationSweeper;

use async_trait::async_trait;
use rentflow_core::error::RentalError;
use rentflow_core::stream::StreamMessage;

/// What the consumer does with a message after its handler ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The effect is committed (or was already); acknowledge.
    Applied,
    /// Transient failure; keep the message and handle it again after the backoff.
    Retry(String),
    /// Permanent failure; park the message in the dead-letter sink and acknowledge.
    DeadLetter(String),
}

impl Outcome {
    /// Classify a service error: transient errors are retried, everything else is
    /// permanent.
    #[must_use]
    pub fn from_error(error: &RentalError) -> Self {
        if error.is_transient() {
            Self::Retry(error.to_string())
        } else {
            Self::DeadLetter(error.to_string())
        }
    }

    /// Metric label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Retry(_) => "retry",
            Self::DeadLetter(_) => "dead_letter",
        }
    }
}

impl<E: Into<RentalError>> From<Result<(), E>> for Outcome {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::Applied,
            Err(error) => Self::from_error(&error.into()),
        }
    }
}

/// One saga step.
///
/// A handler parses the message, applies its effect and commits the consumer
/// checkpoint with it. It must be idempotent: the same message may arrive again
/// after a crash or a retry.
#[async_trait]
pub trait SagaHandler: Send + Sync {
    /// Handle one message on behalf of `consumer`.
    async fn handle(&self, consumer: &str, message: &StreamMessage) -> Outcome;
}
