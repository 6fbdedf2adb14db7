use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::message::{Message, TopicPartition};
use crate::processing::coordinator::Coordinator;
use crate::routing::Topic;
use crate::strategy::Feature;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Exclusivity key of jobs: no two jobs of the same group ever run at the same time.
///
/// A partition without virtual partitions uses segment `0`. `generation` changes every time the
/// partition is revoked, so work of a lost assignment never collides with a new one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId {
    pub partition: TopicPartition,
    pub segment: usize,
    pub generation: u64,
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}#{}",
            self.partition, self.segment, self.generation
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Completed,
}

#[derive(Debug, Clone)]
pub enum JobKind {
    /// Runs the consume lifecycle over a slice of a batch.
    Consume { messages: Vec<Arc<Message>> },
    /// Periodic tick of an idle partition.
    Tick,
}

/// A unit of dispatchable work.
#[derive(Debug)]
pub struct Job {
    id: u64,
    pub group_id: GroupId,
    pub kind: JobKind,
    pub coordinator: Arc<Coordinator>,
    pub topic: Arc<Topic>,
    state: JobState,
    non_blocking: bool,
}

impl Job {
    pub fn consume(
        group_id: GroupId,
        messages: Vec<Arc<Message>>,
        coordinator: Arc<Coordinator>,
        topic: Arc<Topic>,
    ) -> Self {
        Self::new(group_id, JobKind::Consume { messages }, coordinator, topic)
    }

    pub fn tick(group_id: GroupId, coordinator: Arc<Coordinator>, topic: Arc<Topic>) -> Self {
        Self::new(group_id, JobKind::Tick, coordinator, topic)
    }

    fn new(
        group_id: GroupId,
        kind: JobKind,
        coordinator: Arc<Coordinator>,
        topic: Arc<Topic>,
    ) -> Self {
        Job {
            id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
            non_blocking: topic.has(Feature::LongRunningJob),
            group_id,
            kind,
            coordinator,
            topic,
            state: JobState::Pending,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: JobState) {
        self.state = state;
    }

    /// Non-blocking jobs (long-running jobs) do not hold back polling of their group.
    pub fn is_non_blocking(&self) -> bool {
        self.non_blocking
    }

    pub fn messages(&self) -> &[Arc<Message>] {
        match &self.kind {
            JobKind::Consume { messages } => messages,
            JobKind::Tick => &[],
        }
    }
}
