use std::sync::Arc;
use std::time::Duration;

use backoff::{PauseSettings, PauseTracker};
use parking_lot::{Mutex, MutexGuard};
use ripple_throttling::{RateLimit, WindowBounds};
use tokio::time::Instant;
use tracing::error;

use crate::message::{Message, TopicPartition};
use crate::processing::virtual_offsets::VirtualOffsetManager;
use crate::{Error, HandlerError, Result};

/// Lifecycle phase of the current batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Started,
    Enqueued,
    Consuming,
    Finished,
    Revoked,
}

/// Aggregated outcome of the jobs of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchResult {
    Pending,
    Success,
    Failure,
}

/// Messages of a partially admitted (throttled) batch start at `offset` and are deferred for
/// `timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttle {
    pub offset: i64,
    pub timeout: Duration,
}

/// Per batch bookkeeping, guarded by one lock.
#[derive(Debug)]
struct State {
    phase: Phase,
    messages: Arc<[Arc<Message>]>,
    jobs_remaining: usize,
    result: BatchResult,
    failure: Option<Arc<dyn std::error::Error + Send + Sync>>,
    seek_offset: Option<i64>,
    /// Highest offset committed to the broker for this assignment.
    committed: Option<i64>,
    manual_pause: bool,
    manual_seek: bool,
    revoked: bool,
    enqueued_fired: bool,
    started_fired: bool,
    finished_fired: bool,
    revoked_fired: bool,
    virtual_offsets: Option<VirtualOffsetManager>,
    throttle: Option<Throttle>,
    /// Batches up to this offset are processed without virtual partitions.
    collapse_until: Option<i64>,
    last_activity: Instant,
}

/// Coordinates the jobs of one assigned partition.
///
/// All jobs of a batch (several of them with virtual partitions) report into the same
/// coordinator. The `on_*` hooks run their callback at most once per batch and always outside
/// the lock, so callbacks are free to talk to the broker.
#[derive(Debug)]
pub struct Coordinator {
    partition: TopicPartition,
    pause_tracker: Mutex<PauseTracker>,
    rate_limit: Option<RateLimit>,
    state: Mutex<State>,
}

impl Coordinator {
    pub fn new(
        partition: TopicPartition,
        pause: &PauseSettings,
        throttling: Option<WindowBounds>,
    ) -> Self {
        Coordinator {
            partition,
            pause_tracker: Mutex::new(PauseTracker::new(pause)),
            rate_limit: throttling.map(RateLimit::new),
            state: Mutex::new(State {
                phase: Phase::Idle,
                messages: Arc::from(Vec::new()),
                jobs_remaining: 0,
                result: BatchResult::Pending,
                failure: None,
                seek_offset: None,
                committed: None,
                manual_pause: false,
                manual_seek: false,
                revoked: false,
                enqueued_fired: false,
                started_fired: false,
                finished_fired: false,
                revoked_fired: false,
                virtual_offsets: None,
                throttle: None,
                collapse_until: None,
                last_activity: Instant::now(),
            }),
        }
    }

    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    /// Starts a new batch processed by `jobs` jobs. The seek offset falls back to the first
    /// offset of the batch when nothing set it yet.
    pub fn start(
        &self,
        messages: Arc<[Arc<Message>]>,
        jobs: usize,
        virtual_offsets: Option<VirtualOffsetManager>,
        throttle: Option<Throttle>,
    ) {
        let mut state = self.state.lock();
        if state.seek_offset.is_none() {
            state.seek_offset = messages.first().map(|m| m.offset);
        }
        state.phase = Phase::Started;
        state.messages = messages;
        state.jobs_remaining = jobs;
        state.result = BatchResult::Pending;
        state.failure = None;
        state.manual_pause = false;
        state.manual_seek = false;
        state.enqueued_fired = false;
        state.started_fired = false;
        state.finished_fired = false;
        state.virtual_offsets = virtual_offsets;
        state.throttle = throttle;
        state.last_activity = Instant::now();
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    /// Runs `f` once per batch right before its jobs are handed to the queue.
    pub fn on_enqueued<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        {
            let mut state = self.state.lock();
            if state.enqueued_fired || state.revoked {
                return None;
            }
            state.enqueued_fired = true;
            state.phase = Phase::Enqueued;
        }
        Some(f())
    }

    /// Runs `f` once per batch before the first job executes.
    pub fn on_started<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        {
            let mut state = self.state.lock();
            if state.started_fired {
                return None;
            }
            state.started_fired = true;
            if !state.revoked {
                state.phase = Phase::Consuming;
            }
        }
        Some(f())
    }

    /// Runs `f` with the highest-offset message of the batch once all its jobs finished.
    /// Exactly one caller gets to run it, no matter how many workers race here.
    pub fn on_finished<R>(&self, f: impl FnOnce(Arc<Message>) -> R) -> Option<R> {
        let last = {
            let mut state = self.state.lock();
            if state.jobs_remaining > 0 || state.finished_fired {
                return None;
            }
            let last = state.messages.last().map(Arc::clone)?;
            state.finished_fired = true;
            if !state.revoked {
                state.phase = Phase::Finished;
            }
            last
        };
        Some(f(last))
    }

    /// Runs `f` once when the partition is lost.
    pub fn on_revoked<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        {
            let mut state = self.state.lock();
            if state.revoked_fired {
                return None;
            }
            state.revoked_fired = true;
        }
        Some(f())
    }

    pub fn revoke(&self) {
        let mut state = self.state.lock();
        state.revoked = true;
        state.phase = Phase::Revoked;
    }

    pub fn is_revoked(&self) -> bool {
        self.state.lock().revoked
    }

    /// Records a successful job. Never overrides a failure of the same batch.
    pub fn success(&self) {
        let mut state = self.state.lock();
        if state.result == BatchResult::Pending {
            state.result = BatchResult::Success;
        }
    }

    /// Records a failed job, the batch stays failed until the next [`Coordinator::start`].
    pub fn failure(&self, cause: HandlerError) {
        let mut state = self.state.lock();
        state.result = BatchResult::Failure;
        state.failure = Some(Arc::from(cause));
    }

    /// Registers a completed job.
    pub fn decrement(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.jobs_remaining == 0 {
            error!(partition = %self.partition, "Decrementing a coordinator without running jobs");
            return Err(Error::Synchronization(format!(
                "{}: more jobs finished than were started",
                self.partition
            )));
        }
        state.jobs_remaining -= 1;
        Ok(())
    }

    pub fn jobs_remaining(&self) -> usize {
        self.state.lock().jobs_remaining
    }

    pub fn result(&self) -> BatchResult {
        self.state.lock().result
    }

    pub fn is_success(&self) -> bool {
        self.result() == BatchResult::Success
    }

    pub fn failure_cause(&self) -> Option<Arc<dyn std::error::Error + Send + Sync>> {
        self.state.lock().failure.clone()
    }

    /// Whether no batch is being processed right now.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.phase == Phase::Idle || state.finished_fired
    }

    pub fn messages(&self) -> Arc<[Arc<Message>]> {
        Arc::clone(&self.state.lock().messages)
    }

    pub fn seek_offset(&self) -> Option<i64> {
        self.state.lock().seek_offset
    }

    /// Moves the seek offset forward, never backwards.
    pub fn advance_seek_offset(&self, offset: i64) {
        let mut state = self.state.lock();
        if state.seek_offset.is_none_or(|current| offset > current) {
            state.seek_offset = Some(offset);
        }
    }

    pub fn committed(&self) -> Option<i64> {
        self.state.lock().committed
    }

    /// Records a broker commit of `offset`. The committed position only grows.
    pub fn record_commit(&self, offset: i64) {
        let mut state = self.state.lock();
        if state.committed.is_none_or(|current| offset > current) {
            state.committed = Some(offset);
        }
    }

    /// Explicit seek request, may move anywhere. `None` is the reset sentinel: nothing is
    /// committed until the next batch starts.
    pub fn reset_seek_offset(&self, offset: Option<i64>) {
        self.state.lock().seek_offset = offset;
    }

    pub fn set_manual_pause(&self) {
        self.state.lock().manual_pause = true;
    }

    pub fn is_manual_pause(&self) -> bool {
        self.state.lock().manual_pause
    }

    pub fn set_manual_seek(&self) {
        self.state.lock().manual_seek = true;
    }

    pub fn is_manual_seek(&self) -> bool {
        self.state.lock().manual_seek
    }

    pub fn pause_tracker(&self) -> MutexGuard<'_, PauseTracker> {
        self.pause_tracker.lock()
    }

    pub fn rate_limit(&self) -> Option<&RateLimit> {
        self.rate_limit.as_ref()
    }

    pub fn throttle(&self) -> Option<Throttle> {
        self.state.lock().throttle
    }

    pub fn is_virtual(&self) -> bool {
        self.state.lock().virtual_offsets.is_some()
    }

    /// Confirms `offset` for the virtual offset manager of the batch.
    pub fn mark_virtual(&self, offset: i64) {
        if let Some(vom) = self.state.lock().virtual_offsets.as_mut() {
            vom.mark(offset);
        }
    }

    /// Highest committable offset of a virtual batch.
    pub fn virtual_markable(&self) -> Option<i64> {
        self.state
            .lock()
            .virtual_offsets
            .as_ref()
            .and_then(VirtualOffsetManager::markable)
    }

    /// Processes everything up to `offset` without virtual partitions.
    pub fn collapse_until(&self, offset: i64) {
        self.state.lock().collapse_until = Some(offset);
    }

    /// Whether a batch starting at `first_offset` has to be collapsed. Clears the collapse once
    /// the failed range is passed.
    pub fn is_collapsed(&self, first_offset: i64) -> bool {
        let mut state = self.state.lock();
        match state.collapse_until {
            Some(until) if first_offset <= until => true,
            Some(_) => {
                state.collapse_until = None;
                false
            }
            None => false,
        }
    }

    pub fn last_activity(&self) -> Instant {
        self.state.lock().last_activity
    }

    pub fn touch(&self) {
        self.state.lock().last_activity = Instant::now();
    }
}
