use rentflow_core::ports::{DeadLetterSink, PortFuture};
use rentflow_core::stream::StreamMessage;
use std::sync::{Arc, Mutex};

/// A message some consumer gave up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedDeadLetter {
    /// Consumer that rejected it
    pub consumer: String,
    /// The message
    pub message: StreamMessage,
    /// Why
    pub reason: String,
}

/// Dead-letter sink that keeps everything in a `Vec`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDeadLetters {
    entries: Arc<Mutex<Vec<RecordedDeadLetter>>>,
}

impl InMemoryDeadLetters {
    /// Empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything dead-lettered so far.
    #[must_use]
    pub fn entries(&self) -> Vec<RecordedDeadLetter> {
        self.entries.lock().unwrap().clone()
    }

    /// Number of dead letters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Nothing dead-lettered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

impl DeadLetterSink for InMemoryDeadLetters {
    fn dead_letter<'a>(
        &'a self,
        consumer: &'a str,
        message: &'a StreamMessage,
        reason: &'a str,
    ) -> PortFuture<'a, ()> {
        self.entries.lock().unwrap().push(RecordedDeadLetter {
            consumer: consumer.to_string(),
            message: message.clone(),
            reason: reason.to_string(),
        });
        Box::pin(async { Ok(()) })
    }
}
