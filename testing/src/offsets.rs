//! Consumer offsets kept next to in-memory state, committed with it.

use rentflow_core::ports::ConsumerCheckpoint;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub(crate) struct Offsets {
    applied: HashMap<(String, String, i32), i64>,
}

impl Offsets {
    /// The checkpoint's message was applied already.
    pub(crate) fn is_replay(&self, checkpoint: &ConsumerCheckpoint) -> bool {
        self.applied
            .get(&Self::key(checkpoint))
            .is_some_and(|applied| *applied >= checkpoint.position.offset)
    }

    pub(crate) fn record(&mut self, checkpoint: &ConsumerCheckpoint) {
        let offset = checkpoint.position.offset;
        self.applied
            .entry(Self::key(checkpoint))
            .and_modify(|applied| *applied = (*applied).max(offset))
            .or_insert(offset);
    }

    fn key(checkpoint: &ConsumerCheckpoint) -> (String, String, i32) {
        (
            checkpoint.consumer.clone(),
            checkpoint.position.topic.clone(),
            checkpoint.position.partition,
        )
    }
}
