//! Saga consumer loop tests.
//!
//! A scripted handler stands in for the saga steps so the tests can observe what the
//! loop does with each outcome: acknowledge, retry the same delivery, or dead-letter.

#![allow(clippy::unwrap_used)]

use async_trait::async_trait;
use rental::runtime::{Outcome, SagaConsumer, SagaHandler};
use rentflow_core::stream::{ChangeStream, StreamMessage};
use rentflow_testing::{InMemoryChangeStream, InMemoryDeadLetters, init_test_tracing};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

const TOPIC: &str = "payment.completed";
const GROUP: &str = "test-group";

/// Returns scripted outcomes in order, then `Applied`.
#[derive(Default)]
struct ScriptedHandler {
    script: Mutex<VecDeque<Outcome>>,
    seen: Mutex<Vec<StreamMessage>>,
}

impl ScriptedHandler {
    fn with(outcomes: impl IntoIterator<Item = Outcome>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(outcomes.into_iter().collect()),
            seen: Mutex::default(),
        })
    }

    fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl SagaHandler for ScriptedHandler {
    async fn handle(&self, _consumer: &str, message: &StreamMessage) -> Outcome {
        self.seen.lock().unwrap().push(message.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Outcome::Applied)
    }
}

struct Harness {
    stream: InMemoryChangeStream,
    dead_letters: InMemoryDeadLetters,
    shutdown: broadcast::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl Harness {
    fn start(handler: Arc<ScriptedHandler>) -> Self {
        init_test_tracing();
        let stream = InMemoryChangeStream::with_partitions(1);
        let dead_letters = InMemoryDeadLetters::new();
        let (shutdown, _) = broadcast::channel(1);

        let task = SagaConsumer::new(
            "test-consumer",
            GROUP,
            &[TOPIC],
            Arc::new(stream.clone()),
            handler,
            Arc::new(dead_letters.clone()),
            shutdown.subscribe(),
        )
        .with_retry_delay(Duration::from_millis(10))
        .spawn();

        Self {
            stream,
            dead_letters,
            shutdown,
            task,
        }
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .unwrap()
            .unwrap();
    }
}

async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn applied_message_is_committed() {
    let handler = ScriptedHandler::with([]);
    let harness = Harness::start(Arc::clone(&handler));

    harness.stream.publish(TOPIC, "EC-1", b"{}").await.unwrap();
    harness.stream.publish(TOPIC, "EC-1", b"{}").await.unwrap();

    let stream = harness.stream.clone();
    eventually(move || stream.committed(GROUP, TOPIC, 0) == 2).await;
    assert_eq!(handler.calls(), 2);
    assert!(harness.dead_letters.is_empty());
    harness.stop().await;
}

#[tokio::test]
async fn transient_failure_retries_the_same_delivery() {
    let handler = ScriptedHandler::with([
        Outcome::Retry("database unavailable".to_string()),
        Outcome::Retry("database unavailable".to_string()),
    ]);
    let harness = Harness::start(Arc::clone(&handler));

    harness.stream.publish(TOPIC, "EC-1", b"first").await.unwrap();
    harness.stream.publish(TOPIC, "EC-1", b"second").await.unwrap();

    let stream = harness.stream.clone();
    eventually(move || stream.committed(GROUP, TOPIC, 0) == 2).await;

    // The first message was handled three times before the second was delivered.
    let payloads: Vec<Vec<u8>> = handler
        .seen
        .lock()
        .unwrap()
        .iter()
        .map(|message| message.payload.clone())
        .collect();
    assert_eq!(
        payloads,
        vec![
            b"first".to_vec(),
            b"first".to_vec(),
            b"first".to_vec(),
            b"second".to_vec()
        ]
    );
    harness.stop().await;
}

#[tokio::test]
async fn permanent_failure_is_parked_and_acknowledged() {
    let handler = ScriptedHandler::with([Outcome::DeadLetter("unparseable".to_string())]);
    let harness = Harness::start(Arc::clone(&handler));

    harness.stream.publish(TOPIC, "EC-1", b"garbage").await.unwrap();
    harness.stream.publish(TOPIC, "EC-2", b"{}").await.unwrap();

    let stream = harness.stream.clone();
    eventually(move || stream.committed(GROUP, TOPIC, 0) == 2).await;

    let parked = harness.dead_letters.entries();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].consumer, "test-consumer");
    assert_eq!(parked[0].reason, "unparseable");
    assert_eq!(parked[0].message.payload, b"garbage".to_vec());
    harness.stop().await;
}

#[tokio::test]
async fn shutdown_during_retry_leaves_the_message_uncommitted() {
    let handler = ScriptedHandler::with(
        std::iter::repeat_n(Outcome::Retry("gateway timeout".to_string()), 1_000),
    );
    let harness = Harness::start(Arc::clone(&handler));

    harness.stream.publish(TOPIC, "EC-1", b"{}").await.unwrap();
    let retried = Arc::clone(&handler);
    eventually(move || retried.calls() >= 2).await;

    let stream = harness.stream.clone();
    harness.stop().await;
    assert_eq!(stream.committed(GROUP, TOPIC, 0), 0);
}
