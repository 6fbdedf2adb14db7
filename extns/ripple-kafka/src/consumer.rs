use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::DateTime;
use parking_lot::Mutex;
use rdkafka::Offset;
use rdkafka::client::ClientContext;
use rdkafka::consumer::stream_consumer::StreamConsumer;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::message::{BorrowedMessage, Headers, Message as _};
use rdkafka::topic_partition_list::TopicPartitionList;
use ripple_core::{Batch, Client, CommitMode, Message, Polled, Poller, TopicPartition};
use tracing::{debug, error, info, warn};

use crate::{Error, KafkaConfig, Result};

/// Upper bound of a seek, seeks run on the worker calling them.
const SEEK_TIMEOUT: Duration = Duration::from_secs(1);

/// Rebalances observed since the last poll.
#[derive(Debug, Default)]
struct Rebalances {
    assigned: Vec<TopicPartition>,
    revoked: Vec<TopicPartition>,
    /// Partitions currently assigned to this consumer.
    owned: HashSet<TopicPartition>,
}

impl Rebalances {
    fn take(&mut self) -> (Vec<TopicPartition>, Vec<TopicPartition>) {
        (
            std::mem::take(&mut self.assigned),
            std::mem::take(&mut self.revoked),
        )
    }
}

// Rebalance callbacks run on the thread polling the consumer.
#[derive(Default)]
struct KafkaContext {
    rebalances: Mutex<Rebalances>,
}

impl KafkaContext {
    fn owns(&self, partition: &TopicPartition) -> bool {
        self.rebalances.lock().owned.contains(partition)
    }
}

impl ClientContext for KafkaContext {}

impl ConsumerContext for KafkaContext {
    fn pre_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(tpl) = rebalance {
            let partitions = partitions(tpl);
            info!(?partitions, "Partitions revoked");
            let mut rebalances = self.rebalances.lock();
            for partition in &partitions {
                rebalances.owned.remove(partition);
            }
            rebalances.revoked.extend(partitions);
        }
    }

    fn post_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                let partitions = partitions(tpl);
                info!(?partitions, "Partitions assigned");
                let mut rebalances = self.rebalances.lock();
                rebalances.owned.extend(partitions.iter().cloned());
                rebalances.assigned.extend(partitions);
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(e) => error!(error = ?e, "Rebalance failed"),
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        if let Err(e) = result {
            warn!(error = ?e, "Committing offsets failed");
        }
    }
}

fn partitions(tpl: &TopicPartitionList) -> Vec<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|elem| TopicPartition::new(elem.topic(), elem.partition()))
        .collect()
}

fn partition_list(partition: &TopicPartition) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    tpl.add_partition(&partition.topic, partition.partition);
    tpl
}

fn to_message(message: &BorrowedMessage<'_>) -> Message {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|header| {
                    (
                        header.key.to_string(),
                        String::from_utf8_lossy(header.value.unwrap_or_default()).into_owned(),
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    Message {
        topic: Arc::from(message.topic()),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(Bytes::copy_from_slice),
        // the payload is None for tombstones
        payload: message
            .payload()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default(),
        headers,
        timestamp: message
            .timestamp()
            .to_millis()
            .and_then(DateTime::from_timestamp_millis),
    }
}

type RippleConsumer = StreamConsumer<KafkaContext>;

/// Polls the subscribed topics in batches and reports rebalances.
pub struct KafkaConsumer {
    consumer: Arc<RippleConsumer>,
    max_messages: usize,
    max_wait_time: Duration,
}

impl KafkaConsumer {
    /// Creates the consumer and subscribes to `config.topics`. Offsets are only committed by the
    /// runtime, auto commit is always disabled.
    pub fn connect(config: &KafkaConfig) -> Result<Self> {
        let mut client_config = config.client_config(&[
            ("enable.partition.eof", "false"),
            ("session.timeout.ms", "6000"),
            ("auto.offset.reset", "earliest"),
        ]);
        client_config
            .set("group.id", &config.consumer_group)
            .set("enable.auto.commit", "false");

        let consumer: RippleConsumer = client_config
            .create_with_context(KafkaContext::default())
            .map_err(|e| Error::Connection {
                server: config.server(),
                error: e.to_string(),
            })?;

        // subscribing to a topic that does not exist only fails once reading from it
        let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| Error::Kafka(format!("Failed to subscribe to topics: {e}")))?;
        info!(?topics, group = %config.consumer_group, "Subscribed");

        Ok(KafkaConsumer {
            consumer: Arc::new(consumer),
            max_messages: config.max_messages.max(1),
            max_wait_time: config.max_wait_time,
        })
    }

    /// Handle for the offset and flow-control operations of the workers.
    pub fn client(&self) -> KafkaClient {
        KafkaClient {
            consumer: Arc::clone(&self.consumer),
        }
    }
}

impl Poller for KafkaConsumer {
    async fn poll(&mut self) -> ripple_core::Result<Polled> {
        let mut batches: BTreeMap<TopicPartition, Vec<Message>> = BTreeMap::new();
        let mut received = 0;

        let deadline = tokio::time::sleep(self.max_wait_time);
        tokio::pin!(deadline);
        while received < self.max_messages {
            tokio::select! {
                biased;
                _ = &mut deadline => break,
                message = self.consumer.recv() => {
                    let message = message.map_err(|e| {
                        ripple_core::Error::Poll(format!("Failed to read messages: {e}"))
                    })?;
                    let message = to_message(&message);
                    batches
                        .entry(message.topic_partition())
                        .or_default()
                        .push(message);
                    received += 1;
                }
            }
        }

        let context = self.consumer.context();
        let (assigned, revoked) = context.rebalances.lock().take();
        // messages fetched before a revocation are redelivered to the new owner
        let batches: Vec<Batch> = batches
            .into_iter()
            .filter(|(partition, _)| context.owns(partition))
            .map(|(partition, messages)| {
                let high_watermark = messages.last().map_or(0, |m| m.offset + 1);
                Batch::new(partition, messages, high_watermark)
            })
            .collect();
        debug!(received, batches = batches.len(), "Polled");

        Ok(Polled {
            batches,
            assigned,
            revoked,
        })
    }
}

/// Offset and flow-control operations on the partitions of a [`KafkaConsumer`].
#[derive(Clone)]
pub struct KafkaClient {
    consumer: Arc<RippleConsumer>,
}

impl KafkaClient {
    fn kafka_error(
        action: &str,
        partition: &TopicPartition,
        e: impl std::fmt::Display,
    ) -> ripple_core::Error {
        ripple_core::Error::Client(format!("{action} {partition}: {e}"))
    }
}

impl Client for KafkaClient {
    fn commit(
        &self,
        partition: &TopicPartition,
        offset: i64,
        metadata: Option<&str>,
        mode: CommitMode,
    ) -> ripple_core::Result<bool> {
        if !self.consumer.context().owns(partition) {
            return Ok(false);
        }

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&partition.topic, partition.partition, Offset::Offset(offset))
            .map_err(|e| Self::kafka_error("adding commit offset of", partition, e))?;
        if let Some(metadata) = metadata
            && let Some(mut elem) = tpl.find_partition(&partition.topic, partition.partition)
        {
            elem.set_metadata(metadata);
        }

        let mode = match mode {
            CommitMode::Async => rdkafka::consumer::CommitMode::Async,
            CommitMode::Sync => rdkafka::consumer::CommitMode::Sync,
        };
        self.consumer
            .commit(&tpl, mode)
            .map_err(|e| Self::kafka_error("committing", partition, e))?;
        Ok(true)
    }

    fn pause(
        &self,
        partition: &TopicPartition,
        offset: i64,
        _timeout: Duration,
    ) -> ripple_core::Result<()> {
        self.consumer
            .pause(&partition_list(partition))
            .map_err(|e| Self::kafka_error("pausing", partition, e))?;
        // fetching continues from `offset` once resumed
        self.seek(partition, offset)
    }

    fn resume(&self, partition: &TopicPartition) -> ripple_core::Result<()> {
        self.consumer
            .resume(&partition_list(partition))
            .map_err(|e| Self::kafka_error("resuming", partition, e))
    }

    fn seek(&self, partition: &TopicPartition, offset: i64) -> ripple_core::Result<()> {
        self.consumer
            .seek(
                &partition.topic,
                partition.partition,
                Offset::Offset(offset),
                SEEK_TIMEOUT,
            )
            .map_err(|e| Self::kafka_error("seeking", partition, e))
    }
}
