//! Lifecycle instrumentation. A [`Monitor`] is handed to every component that emits events;
//! emitting never blocks and never fails, slow subscribers simply miss events.

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::debug;

use crate::message::TopicPartition;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    BeforeScheduleConsume {
        partition: TopicPartition,
        messages: usize,
    },
    Consume {
        partition: TopicPartition,
        segment: usize,
        messages: usize,
    },
    Consumed {
        partition: TopicPartition,
        segment: usize,
        messages: usize,
    },
    ConsumeFailed {
        partition: TopicPartition,
        segment: usize,
        error: String,
    },
    Retrying {
        partition: TopicPartition,
        offset: i64,
        attempt: u32,
    },
    Paused {
        partition: TopicPartition,
        offset: i64,
        timeout: Duration,
        attempt: u32,
        manual: bool,
    },
    Resumed {
        partition: TopicPartition,
    },
    Seek {
        partition: TopicPartition,
        offset: i64,
    },
    MarkedAsConsumed {
        partition: TopicPartition,
        offset: i64,
    },
    DeadLetterDispatched {
        partition: TopicPartition,
        offset: i64,
        topic: String,
    },
    Throttled {
        partition: TopicPartition,
        offset: i64,
        timeout: Duration,
    },
    Revoked {
        partition: TopicPartition,
    },
    BeforeScheduleTick {
        partition: TopicPartition,
    },
    Tick {
        partition: TopicPartition,
    },
    Error {
        partition: Option<TopicPartition>,
        error: String,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::BeforeScheduleConsume { .. } => "consumer.before_schedule_consume",
            Event::Consume { .. } => "consumer.consume",
            Event::Consumed { .. } => "consumer.consumed",
            Event::ConsumeFailed { .. } => "consumer.consume.failed",
            Event::Retrying { .. } => "consumer.consuming.retry",
            Event::Paused { .. } => "consumer.consuming.pause",
            Event::Resumed { .. } => "consumer.consuming.resume",
            Event::Seek { .. } => "consumer.consuming.seek",
            Event::MarkedAsConsumed { .. } => "consumer.marked_as_consumed",
            Event::DeadLetterDispatched { .. } => "dead_letter_queue.dispatched",
            Event::Throttled { .. } => "filtering.throttled",
            Event::Revoked { .. } => "consumer.revoked",
            Event::BeforeScheduleTick { .. } => "consumer.before_schedule_tick",
            Event::Tick { .. } => "consumer.tick",
            Event::Error { .. } => "error.occurred",
        }
    }

    pub fn partition(&self) -> Option<&TopicPartition> {
        match self {
            Event::BeforeScheduleConsume { partition, .. }
            | Event::Consume { partition, .. }
            | Event::Consumed { partition, .. }
            | Event::ConsumeFailed { partition, .. }
            | Event::Retrying { partition, .. }
            | Event::Paused { partition, .. }
            | Event::Resumed { partition }
            | Event::Seek { partition, .. }
            | Event::MarkedAsConsumed { partition, .. }
            | Event::DeadLetterDispatched { partition, .. }
            | Event::Throttled { partition, .. }
            | Event::Revoked { partition }
            | Event::BeforeScheduleTick { partition }
            | Event::Tick { partition } => Some(partition),
            Event::Error { partition, .. } => partition.as_ref(),
        }
    }
}

/// Cloneable handle to the instrumentation bus.
#[derive(Clone, Debug)]
pub struct Monitor {
    tx: broadcast::Sender<Event>,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Monitor {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Monitor { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publishes `event` to all current subscribers.
    pub fn instrument(&self, event: Event) {
        debug!(event = event.name(), partition = ?event.partition(), ?event);
        // no subscribers is fine
        let _ = self.tx.send(event);
    }
}
