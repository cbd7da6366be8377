//! In-memory change stream.
//!
//! Mimics the parts of a Kafka-compatible log the services rely on: keyed
//! partitioning, per-group committed offsets, ack-gated delivery and redelivery of
//! anything not acknowledged.

use rentflow_core::stream::{
    ChangeStream, Delivery, DeliveryStream, StreamError, StreamMessage, StreamPosition,
};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};

const DEFAULT_PARTITIONS: i32 = 3;

#[derive(Debug, Default)]
struct Log {
    partitions: HashMap<String, Vec<Vec<StreamMessage>>>,
    history: Vec<StreamMessage>,
    // (group, topic, partition) -> next offset to deliver
    committed: HashMap<(String, String, i32), i64>,
    failing_publishes: usize,
}

impl Log {
    fn next_for(&self, group: &str, topics: &[String]) -> Option<StreamMessage> {
        topics.iter().find_map(|topic| {
            let partitions = self.partitions.get(topic)?;
            partitions.iter().enumerate().find_map(|(partition, messages)| {
                let partition = i32::try_from(partition).ok()?;
                let next = self
                    .committed
                    .get(&(group.to_string(), topic.clone(), partition))
                    .copied()
                    .unwrap_or(0);
                messages.get(usize::try_from(next).ok()?).cloned()
            })
        })
    }
}

/// Change stream living in process memory.
///
/// Clones share the same log.
#[derive(Debug, Clone)]
pub struct InMemoryChangeStream {
    partition_count: i32,
    log: Arc<Mutex<Log>>,
    appended: Arc<watch::Sender<u64>>,
}

impl Default for InMemoryChangeStream {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryChangeStream {
    /// Stream with three partitions per topic.
    #[must_use]
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    /// Stream with `count` partitions per topic.
    #[must_use]
    pub fn with_partitions(count: i32) -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            partition_count: count.max(1),
            log: Arc::new(Mutex::new(Log::default())),
            appended: Arc::new(appended),
        }
    }

    /// Messages published on `topic`, in publish order.
    #[must_use]
    pub fn published(&self, topic: &str) -> Vec<StreamMessage> {
        self.log
            .lock()
            .unwrap()
            .history
            .iter()
            .filter(|message| message.position.topic == topic)
            .cloned()
            .collect()
    }

    /// Make the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: usize) {
        self.log.lock().unwrap().failing_publishes = count;
    }

    /// Forget what `group` committed on `topic`, so everything is delivered again.
    pub fn rewind(&self, group: &str, topic: &str) {
        self.log
            .lock()
            .unwrap()
            .committed
            .retain(|(g, t, _), _| !(g == group && t == topic));
        self.appended.send_modify(|n| *n += 1);
    }

    /// Next offset `group` will receive on a partition.
    #[must_use]
    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> i64 {
        self.log
            .lock()
            .unwrap()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
            .unwrap_or(0)
    }

    fn partition_for(&self, key: &str) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let count = u64::try_from(self.partition_count).unwrap_or(1);
        i32::try_from(hasher.finish() % count).unwrap_or(0)
    }
}

impl ChangeStream for InMemoryChangeStream {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        key: &'a str,
        payload: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), StreamError>> + Send + 'a>> {
        let partition = self.partition_for(key);
        let result = {
            let mut log = self.log.lock().unwrap();
            if log.failing_publishes > 0 {
                log.failing_publishes -= 1;
                Err(StreamError::PublishFailed {
                    topic: topic.to_string(),
                    reason: "injected publish failure".to_string(),
                })
            } else {
                let partition_count = usize::try_from(self.partition_count).unwrap_or(1);
                let partitions = log
                    .partitions
                    .entry(topic.to_string())
                    .or_insert_with(|| vec![Vec::new(); partition_count]);
                let messages = &mut partitions[usize::try_from(partition).unwrap_or(0)];
                let message = StreamMessage {
                    position: StreamPosition {
                        topic: topic.to_string(),
                        partition,
                        offset: i64::try_from(messages.len()).unwrap_or(i64::MAX),
                    },
                    key: Some(key.to_string()),
                    payload: payload.to_vec(),
                };
                messages.push(message.clone());
                log.history.push(message);
                Ok(())
            }
        };
        if result.is_ok() {
            self.appended.send_modify(|n| *n += 1);
        }
        Box::pin(async move { result })
    }

    fn subscribe<'a>(
        &'a self,
        group: &'a str,
        topics: &'a [&'a str],
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, StreamError>> + Send + 'a>> {
        let log = Arc::clone(&self.log);
        let mut appended = self.appended.subscribe();
        let group = group.to_string();
        let topics: Vec<String> = topics.iter().map(ToString::to_string).collect();

        Box::pin(async move {
            let (tx, mut rx) = mpsc::channel::<Result<Delivery, StreamError>>(1);

            tokio::spawn(async move {
                loop {
                    appended.borrow_and_update();
                    let next = log.lock().unwrap().next_for(&group, &topics);
                    let Some(message) = next else {
                        tokio::select! {
                            changed = appended.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            },
                            () = tx.closed() => break,
                        }
                        continue;
                    };

                    let position = message.position.clone();
                    let (ack_tx, ack_rx) = oneshot::channel();
                    if tx.send(Ok(Delivery::new(message, ack_tx))).await.is_err() {
                        break;
                    }
                    if ack_rx.await.is_err() {
                        tracing::debug!(%group, %position, "Delivery dropped without ack, ending subscription");
                        break;
                    }
                    log.lock().unwrap().committed.insert(
                        (group.clone(), position.topic.clone(), position.partition),
                        position.offset + 1,
                    );
                }
            });

            let stream = async_stream::stream! {
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            };
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}
