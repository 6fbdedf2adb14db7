//! Builders and recording broker doubles shared by the unit tests.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::client::{Client, CommitMode, DeadLetter, Producer};
use crate::config::{PauseConfig, TopicSettings};
use crate::message::{Message, TopicPartition};
use crate::processing::coordinator::Coordinator;
use crate::processing::job::{GroupId, Job};
use crate::routing::Topic;
use crate::strategy::Resolver;
use crate::{Error, Result};

pub(crate) fn message(topic: &str, partition: i32, offset: i64) -> Message {
    Message {
        topic: Arc::from(topic),
        partition,
        offset,
        key: Some(Bytes::from(format!("key-{offset}"))),
        payload: Bytes::from(format!("payload-{offset}")),
        headers: Default::default(),
        timestamp: None,
    }
}

pub(crate) fn messages(topic: &str, partition: i32, offsets: Range<i64>) -> Vec<Arc<Message>> {
    offsets
        .map(|offset| Arc::new(message(topic, partition, offset)))
        .collect()
}

pub(crate) fn group(topic: &str, partition: i32) -> GroupId {
    GroupId {
        partition: TopicPartition::new(topic, partition),
        segment: 0,
        generation: 0,
    }
}

/// Pause settings without jitter and with short, easy to assert timeouts.
pub(crate) fn pause_config() -> PauseConfig {
    PauseConfig {
        timeout_ms: 100,
        max_timeout_ms: 1_000,
        with_exponential_backoff: true,
        jitter: 0.0,
    }
}

pub(crate) fn topic(settings: TopicSettings) -> Topic {
    Topic::from_settings(&settings, "test-group", &pause_config(), &Resolver::new())
        .expect("valid topic settings")
}

/// A tick job, long-running (non-blocking) when `non_blocking` is set.
pub(crate) fn tick_job(topic_name: &str, partition: i32, non_blocking: bool) -> Job {
    let topic = Arc::new(topic(TopicSettings {
        long_running_job: non_blocking,
        ..TopicSettings::new(topic_name)
    }));
    let coordinator = Arc::new(Coordinator::new(
        TopicPartition::new(topic_name, partition),
        &topic.pause,
        None,
    ));
    Job::tick(group(topic_name, partition), coordinator, topic)
}

/// Broker side effect recorded by [`MockClient`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Action {
    Commit {
        partition: TopicPartition,
        offset: i64,
        metadata: Option<String>,
        mode: CommitMode,
    },
    Pause {
        partition: TopicPartition,
        offset: i64,
        timeout: Duration,
    },
    Resume {
        partition: TopicPartition,
    },
    Seek {
        partition: TopicPartition,
        offset: i64,
    },
}

/// Records every call. Commits for partitions registered with [`MockClient::lose`] report the
/// assignment as lost.
#[derive(Debug, Default)]
pub(crate) struct MockClient {
    actions: Mutex<Vec<Action>>,
    lost: Mutex<HashSet<TopicPartition>>,
    fail_commits: Mutex<bool>,
    fail_pauses: Mutex<bool>,
}

impl MockClient {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn lose(&self, partition: &TopicPartition) {
        self.lost.lock().insert(partition.clone());
    }

    pub(crate) fn fail_commits(&self, fail: bool) {
        *self.fail_commits.lock() = fail;
    }

    pub(crate) fn fail_pauses(&self, fail: bool) {
        *self.fail_pauses.lock() = fail;
    }

    pub(crate) fn actions(&self) -> Vec<Action> {
        self.actions.lock().clone()
    }

    pub(crate) fn commits(&self) -> Vec<i64> {
        self.actions
            .lock()
            .iter()
            .filter_map(|action| match action {
                Action::Commit { offset, .. } => Some(*offset),
                _ => None,
            })
            .collect()
    }

    /// Offsets and timeouts of all pauses.
    pub(crate) fn pauses(&self) -> Vec<(i64, Duration)> {
        self.actions
            .lock()
            .iter()
            .filter_map(|action| match action {
                Action::Pause {
                    offset, timeout, ..
                } => Some((*offset, *timeout)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn seeks(&self) -> Vec<i64> {
        self.actions
            .lock()
            .iter()
            .filter_map(|action| match action {
                Action::Seek { offset, .. } => Some(*offset),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn resumes(&self) -> usize {
        self.actions
            .lock()
            .iter()
            .filter(|action| matches!(action, Action::Resume { .. }))
            .count()
    }

    pub(crate) fn clear(&self) {
        self.actions.lock().clear();
    }
}

impl Client for MockClient {
    fn commit(
        &self,
        partition: &TopicPartition,
        offset: i64,
        metadata: Option<&str>,
        mode: CommitMode,
    ) -> Result<bool> {
        if *self.fail_commits.lock() {
            return Err(Error::Client("commit failed".to_string()));
        }
        if self.lost.lock().contains(partition) {
            return Ok(false);
        }
        self.actions.lock().push(Action::Commit {
            partition: partition.clone(),
            offset,
            metadata: metadata.map(str::to_string),
            mode,
        });
        Ok(true)
    }

    fn pause(&self, partition: &TopicPartition, offset: i64, timeout: Duration) -> Result<()> {
        if *self.fail_pauses.lock() {
            return Err(Error::Client("pause failed".to_string()));
        }
        self.actions.lock().push(Action::Pause {
            partition: partition.clone(),
            offset,
            timeout,
        });
        Ok(())
    }

    fn resume(&self, partition: &TopicPartition) -> Result<()> {
        self.actions.lock().push(Action::Resume {
            partition: partition.clone(),
        });
        Ok(())
    }

    fn seek(&self, partition: &TopicPartition, offset: i64) -> Result<()> {
        self.actions.lock().push(Action::Seek {
            partition: partition.clone(),
            offset,
        });
        Ok(())
    }
}

#[derive(Debug, Default)]
pub(crate) struct MockProducer {
    records: Mutex<Vec<DeadLetter>>,
}

impl MockProducer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn records(&self) -> Vec<DeadLetter> {
        self.records.lock().clone()
    }
}

impl Producer for MockProducer {
    fn produce(&self, record: DeadLetter) -> Result<()> {
        self.records.lock().push(record);
        Ok(())
    }
}
