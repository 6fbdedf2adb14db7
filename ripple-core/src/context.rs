//! What user code sees of the batch it is processing.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::{Client, CommitMode};
use crate::message::{Message, TopicPartition};
use crate::monitor::Monitor;
use crate::processing::coordinator::Coordinator;
use crate::routing::Topic;
use crate::strategy::actions::Actions;
use crate::{Error, Result};

/// Target of a user requested seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekTarget {
    /// Continue from `offset`; it also becomes the first unprocessed offset of the partition.
    Offset(i64),
    /// Continue from `offset` without tracking a position: nothing is committed until the next
    /// batch starts.
    Reset(i64),
}

/// A mark issued inside an open transaction.
#[derive(Debug)]
struct BufferedMark {
    offset: i64,
    metadata: Option<String>,
    mode: CommitMode,
}

#[derive(Debug, Default)]
struct TransactionState {
    active: bool,
    /// Latest mark issued inside the open transaction.
    marked: Option<BufferedMark>,
}

/// Handed to [`crate::Handler`] for every job.
pub struct ConsumeContext<'a> {
    messages: &'a [Arc<Message>],
    segment: usize,
    topic: &'a Topic,
    coordinator: &'a Coordinator,
    client: &'a dyn Client,
    monitor: &'a Monitor,
    stop: &'a CancellationToken,
    transaction: Mutex<TransactionState>,
}

impl<'a> ConsumeContext<'a> {
    pub(crate) fn new(
        messages: &'a [Arc<Message>],
        segment: usize,
        topic: &'a Topic,
        coordinator: &'a Coordinator,
        client: &'a dyn Client,
        monitor: &'a Monitor,
        stop: &'a CancellationToken,
    ) -> Self {
        ConsumeContext {
            messages,
            segment,
            topic,
            coordinator,
            client,
            monitor,
            stop,
            transaction: Mutex::new(TransactionState::default()),
        }
    }

    fn actions(&self) -> Actions<'a> {
        Actions::new(self.coordinator, self.client, self.monitor)
    }

    /// Messages of this job, in offset order. Empty for ticks.
    pub fn messages(&self) -> &[Arc<Message>] {
        self.messages
    }

    pub fn partition(&self) -> &TopicPartition {
        self.coordinator.partition()
    }

    /// Virtual partition of this job, `0` without virtual partitions.
    pub fn segment(&self) -> usize {
        self.segment
    }

    pub fn topic(&self) -> &Topic {
        self.topic
    }

    /// Processing attempt of the current batch, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.coordinator.pause_tracker().attempt()
    }

    /// Whether the partition was taken away. Long running work should check it regularly and
    /// stop early.
    pub fn is_revoked(&self) -> bool {
        self.coordinator.is_revoked()
    }

    /// Whether the process is shutting down.
    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Marks `message` and everything before it as processed. The offset is stored and flushed
    /// in the background. Returns `false` when the partition is no longer assigned.
    pub fn mark_as_consumed(&self, message: &Message, metadata: Option<&str>) -> Result<bool> {
        self.mark(message, metadata, CommitMode::Async)
    }

    /// Like [`ConsumeContext::mark_as_consumed`] but waits for the broker to acknowledge.
    pub fn mark_as_consumed_sync(&self, message: &Message, metadata: Option<&str>) -> Result<bool> {
        self.mark(message, metadata, CommitMode::Sync)
    }

    fn mark(&self, message: &Message, metadata: Option<&str>, mode: CommitMode) -> Result<bool> {
        {
            let mut transaction = self.transaction.lock();
            if transaction.active {
                transaction.marked = Some(BufferedMark {
                    offset: message.offset,
                    metadata: metadata.map(str::to_string),
                    mode,
                });
                return Ok(true);
            }
        }
        self.actions().mark(message.offset, metadata, mode)
    }

    /// Pauses the partition at `offset`, for the configured backoff when no `timeout` is given.
    /// A user pause replaces the automatic offset handling of the batch.
    pub fn pause(&self, offset: i64, timeout: Option<Duration>) -> Result<()> {
        self.actions().pause(offset, timeout, true)
    }

    /// Moves the fetch position of the partition. The seek replaces the automatic offset
    /// handling of the batch.
    pub fn seek(&self, target: SeekTarget) -> Result<()> {
        if self.coordinator.is_revoked() {
            return Ok(());
        }
        let offset = match target {
            SeekTarget::Offset(offset) => {
                self.coordinator.reset_seek_offset(Some(offset));
                offset
            }
            SeekTarget::Reset(offset) => {
                self.coordinator.reset_seek_offset(None);
                offset
            }
        };
        self.actions().seek(offset, true)
    }

    /// Opens a transaction. Marks issued while it is open are buffered and only applied on
    /// [`Transaction::commit`]; dropping the guard discards them.
    pub fn transaction(&self) -> Result<Transaction<'_, 'a>> {
        let mut transaction = self.transaction.lock();
        if transaction.active {
            return Err(Error::TransactionAlreadyInitialized);
        }
        transaction.active = true;
        transaction.marked = None;
        Ok(Transaction {
            ctx: self,
            finished: false,
        })
    }
}

/// Open transaction of a [`ConsumeContext`].
#[must_use = "dropping the transaction discards its marks"]
pub struct Transaction<'c, 'a> {
    ctx: &'c ConsumeContext<'a>,
    finished: bool,
}

impl Transaction<'_, '_> {
    /// Closes the transaction and applies the latest buffered mark, in the commit mode it was
    /// issued with.
    pub fn commit(mut self) -> Result<bool> {
        self.finished = true;
        let marked = {
            let mut transaction = self.ctx.transaction.lock();
            transaction.active = false;
            transaction.marked.take()
        };
        match marked {
            Some(mark) => {
                self.ctx
                    .actions()
                    .mark(mark.offset, mark.metadata.as_deref(), mark.mode)
            }
            None => Ok(true),
        }
    }
}

impl Drop for Transaction<'_, '_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut transaction = self.ctx.transaction.lock();
        if transaction.marked.take().is_some() {
            debug!(partition = %self.ctx.partition(), "Discarding marks of an aborted transaction");
        }
        transaction.active = false;
    }
}
