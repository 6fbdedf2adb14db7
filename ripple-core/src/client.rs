//! Interfaces of the broker collaborators. The engine only talks to the broker through these
//! traits, the rdkafka backed implementations live in the `ripple-kafka` extension.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;

use crate::Result;
use crate::message::{Batch, TopicPartition};

/// How an offset commit is flushed to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Store the offset and let the client flush it in the background.
    Async,
    /// Flush and wait for the broker to acknowledge. Blocks the calling worker.
    Sync,
}

/// Offset and flow-control operations on assigned partitions.
///
/// Called from worker tasks while user code may be running on other partitions, so every
/// operation has to be safe to call concurrently.
pub trait Client: Send + Sync {
    /// Commits `offset` (the next offset to consume) for `partition`. Returns `false` when the
    /// partition is no longer assigned to this consumer.
    fn commit(
        &self,
        partition: &TopicPartition,
        offset: i64,
        metadata: Option<&str>,
        mode: CommitMode,
    ) -> Result<bool>;

    /// Stops fetching `partition`; fetching continues from `offset` once resumed. `timeout` is the
    /// pause length the engine tracks, the client does not have to enforce it.
    fn pause(&self, partition: &TopicPartition, offset: i64, timeout: Duration) -> Result<()>;

    fn resume(&self, partition: &TopicPartition) -> Result<()>;

    fn seek(&self, partition: &TopicPartition, offset: i64) -> Result<()>;
}

/// A message on its way to a dead-letter topic.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Bytes,
    pub headers: HashMap<String, String>,
}

/// Fire-and-forget producer used for dead-letter dispatch.
pub trait Producer: Send + Sync {
    fn produce(&self, record: DeadLetter) -> Result<()>;
}

/// Everything one poll cycle observed.
#[derive(Debug, Default)]
pub struct Polled {
    pub batches: Vec<Batch>,
    pub assigned: Vec<TopicPartition>,
    pub revoked: Vec<TopicPartition>,
}

/// Source of batches and rebalance notifications, driven by the listener loop.
#[trait_variant::make(Send)]
pub trait Poller {
    async fn poll(&mut self) -> Result<Polled>;
}
