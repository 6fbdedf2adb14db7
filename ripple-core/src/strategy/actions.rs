use std::time::Duration;

use tracing::{debug, warn};

use crate::Result;
use crate::client::{Client, CommitMode};
use crate::monitor::{Event, Monitor};
use crate::processing::coordinator::Coordinator;

/// Broker side effects on the partition of one coordinator.
///
/// Every action is a silent no-op once the coordinator is revoked.
#[derive(Clone, Copy)]
pub(crate) struct Actions<'a> {
    pub(crate) coordinator: &'a Coordinator,
    pub(crate) client: &'a dyn Client,
    pub(crate) monitor: &'a Monitor,
}

impl<'a> Actions<'a> {
    pub(crate) fn new(
        coordinator: &'a Coordinator,
        client: &'a dyn Client,
        monitor: &'a Monitor,
    ) -> Self {
        Actions {
            coordinator,
            client,
            monitor,
        }
    }

    /// Marks the message at `offset` as consumed. Virtual batches only record the mark, it is
    /// committed once the batch finished. Returns `false` when the partition is gone.
    pub(crate) fn mark(&self, offset: i64, metadata: Option<&str>, mode: CommitMode) -> Result<bool> {
        if self.coordinator.is_virtual() {
            self.coordinator.mark_virtual(offset);
            return Ok(!self.coordinator.is_revoked());
        }
        self.commit(offset, metadata, mode)
    }

    /// Commits `offset + 1` and moves the seek offset past `offset`. Offsets below the seek
    /// offset are already committed and nothing happens after a seek reset. The committed
    /// position never moves backwards.
    pub(crate) fn commit(
        &self,
        offset: i64,
        metadata: Option<&str>,
        mode: CommitMode,
    ) -> Result<bool> {
        match self.coordinator.seek_offset() {
            None => return Ok(true),
            Some(seek_offset) if seek_offset > offset => return Ok(true),
            Some(_) => {}
        }
        if self.coordinator.is_revoked() {
            return Ok(false);
        }

        // redelivered after a seek back, the broker already holds a later position
        if self.coordinator.committed().is_some_and(|committed| committed > offset) {
            self.coordinator.advance_seek_offset(offset + 1);
            return Ok(true);
        }

        let partition = self.coordinator.partition();
        if !self.client.commit(partition, offset + 1, metadata, mode)? {
            debug!(%partition, offset, "Assignment lost while marking");
            self.coordinator.revoke();
            return Ok(false);
        }
        self.coordinator.record_commit(offset + 1);
        self.coordinator.advance_seek_offset(offset + 1);
        self.monitor.instrument(Event::MarkedAsConsumed {
            partition: partition.clone(),
            offset,
        });
        Ok(true)
    }

    /// Pauses the partition at `offset`. Without a `timeout` the pause tracker's backoff is used.
    pub(crate) fn pause(&self, offset: i64, timeout: Option<Duration>, manual: bool) -> Result<()> {
        if self.coordinator.is_revoked() {
            return Ok(());
        }
        let (timeout, attempt) = {
            let mut tracker = self.coordinator.pause_tracker();
            (tracker.pause(timeout), tracker.attempt())
        };

        let partition = self.coordinator.partition();
        self.client.pause(partition, offset, timeout)?;
        if manual {
            self.coordinator.set_manual_pause();
        }
        self.monitor.instrument(Event::Paused {
            partition: partition.clone(),
            offset,
            timeout,
            attempt,
            manual,
        });
        Ok(())
    }

    /// Pauses at the first unprocessed offset with backoff so the batch is redelivered.
    pub(crate) fn retry_after_pause(&self) -> Result<()> {
        let offset = self
            .coordinator
            .seek_offset()
            .or_else(|| self.coordinator.messages().first().map(|m| m.offset));
        let Some(offset) = offset else {
            warn!(partition = %self.coordinator.partition(), "Nothing to retry from");
            return Ok(());
        };

        self.pause(offset, None, false)?;
        self.monitor.instrument(Event::Retrying {
            partition: self.coordinator.partition().clone(),
            offset,
            attempt: self.coordinator.pause_tracker().attempt(),
        });
        Ok(())
    }

    /// Moves the fetch position of the partition to `offset`.
    pub(crate) fn seek(&self, offset: i64, manual: bool) -> Result<()> {
        if self.coordinator.is_revoked() {
            return Ok(());
        }
        if manual {
            self.coordinator.set_manual_seek();
        }
        let partition = self.coordinator.partition();
        self.client.seek(partition, offset)?;
        self.monitor.instrument(Event::Seek {
            partition: partition.clone(),
            offset,
        });
        Ok(())
    }

    /// Ends the current pause, if any.
    pub(crate) fn resume(&self) -> Result<()> {
        if self.coordinator.is_revoked() {
            return Ok(());
        }
        self.coordinator.pause_tracker().resume();
        let partition = self.coordinator.partition();
        self.client.resume(partition)?;
        self.monitor.instrument(Event::Resumed {
            partition: partition.clone(),
        });
        Ok(())
    }
}
