//! Processing coordination engine of a Kafka consumer group.
//!
//! Batches fetched by a [`Listener`] are split into jobs, run by a pool of workers against the
//! user [`Handler`], and every outcome is turned into offset commits and pause/resume decisions
//! according to the strategy resolved from the topic's features:
//! - one in-flight job per partition (or per virtual partition), FIFO across partitions
//! - retries with exponential backoff, dead-letter dispatch after `max_retries`
//! - long-running jobs that keep the partition paused while they run
//! - virtual partitions with commits limited to the contiguous confirmed prefix
//! - throttling, periodic ticks and manual offset management

pub use crate::error::{Error, HandlerError, HandlerResult, Result};

mod error;

/// Broker collaborator interfaces.
pub mod client;

pub mod config;

pub mod context;

pub mod handler;

pub mod listener;

pub mod message;

pub mod metrics;

/// Lifecycle events.
pub mod monitor;

pub mod processing;

pub mod routing;

pub mod runtime;

pub mod strategy;

#[cfg(test)]
mod test_utils;

pub use crate::client::{Client, CommitMode, DeadLetter, Polled, Poller, Producer};
pub use crate::config::{Settings, TopicSettings};
pub use crate::context::{ConsumeContext, SeekTarget, Transaction};
pub use crate::handler::{ActiveJobHandler, Handler, Perform};
pub use crate::listener::Listener;
pub use crate::message::{Batch, Message, TopicPartition};
pub use crate::monitor::{Event, Monitor};
pub use crate::routing::{DlqEnhancer, Routes, Topic};
pub use crate::runtime::Runtime;
