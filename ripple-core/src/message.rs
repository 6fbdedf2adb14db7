use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// A partition of a topic, the unit of assignment and of offset commits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: Arc<str>,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<Arc<str>>, partition: i32) -> Self {
        TopicPartition {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// A message fetched from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: Arc<str>,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    /// Raw (not deserialized) payload.
    pub payload: Bytes,
    pub headers: HashMap<String, String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition {
            topic: Arc::clone(&self.topic),
            partition: self.partition,
        }
    }
}

/// The messages fetched for one partition in one poll cycle, ordered by offset.
#[derive(Debug, Clone)]
pub struct Batch {
    pub partition: TopicPartition,
    pub messages: Vec<Arc<Message>>,
    /// Offset of the next message the broker will write to the partition.
    pub high_watermark: i64,
}

impl Batch {
    pub fn new(partition: TopicPartition, messages: Vec<Message>, high_watermark: i64) -> Self {
        Batch {
            partition,
            messages: messages.into_iter().map(Arc::new).collect(),
            high_watermark,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn first_offset(&self) -> Option<i64> {
        self.messages.first().map(|m| m.offset)
    }

    pub fn last_offset(&self) -> Option<i64> {
        self.messages.last().map(|m| m.offset)
    }

    /// Messages the consumer still has to catch up on after this batch.
    pub fn lag(&self) -> i64 {
        self.last_offset()
            .map_or(0, |last| (self.high_watermark - last - 1).max(0))
    }
}
