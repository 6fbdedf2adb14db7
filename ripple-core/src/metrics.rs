//! Prometheus metrics of the consumer, fed from the [`Monitor`] event stream.

use std::sync::OnceLock;

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::message::TopicPartition;
use crate::monitor::{Event, Monitor};
use crate::{Error, Result};

const REGISTRY_PREFIX: &str = "ripple";

const TOPIC_LABEL: &str = "topic";
const PARTITION_LABEL: &str = "partition";

// counters, the `_total` suffix is added by the client library
const CONSUMED_TOTAL: &str = "consumed";
const CONSUME_ERRORS_TOTAL: &str = "consume_errors";
const DLQ_DISPATCHED_TOTAL: &str = "dlq_dispatched";
const PAUSED_TOTAL: &str = "paused";
const THROTTLED_TOTAL: &str = "throttled";
const REVOKED_TOTAL: &str = "revoked";
const MARKED_TOTAL: &str = "marked";
const ERRORS_TOTAL: &str = "errors";

const BATCH_SIZE: &str = "batch_size";

type Labels = Vec<(String, String)>;

/// The registry of all metrics.
struct GlobalRegistry {
    // metrics are registered once, so a blocking mutex is fine
    registry: parking_lot::Mutex<Registry>,
}

static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(|| GlobalRegistry {
        registry: parking_lot::Mutex::new(Registry::default()),
    })
}

/// Counters per topic partition.
pub struct ConsumerMetrics {
    /// Messages handed to user code that succeeded.
    pub consumed: Family<Labels, Counter>,
    /// Failed jobs.
    pub consume_errors: Family<Labels, Counter>,
    pub dlq_dispatched: Family<Labels, Counter>,
    pub paused: Family<Labels, Counter>,
    pub throttled: Family<Labels, Counter>,
    pub revoked: Family<Labels, Counter>,
    pub marked: Family<Labels, Counter>,
    /// Runtime errors, without labels when not tied to a partition.
    pub errors: Family<Labels, Counter>,
    /// Messages per polled batch.
    pub batch_size: Family<Labels, Histogram>,
}

impl ConsumerMetrics {
    fn new() -> Self {
        let metrics = ConsumerMetrics {
            consumed: Family::default(),
            consume_errors: Family::default(),
            dlq_dispatched: Family::default(),
            paused: Family::default(),
            throttled: Family::default(),
            revoked: Family::default(),
            marked: Family::default(),
            errors: Family::default(),
            batch_size: Family::new_with_constructor(|| {
                Histogram::new(exponential_buckets(1.0, 2.0, 14))
            }),
        };

        let mut registry = global_registry().registry.lock();
        let registry = registry.sub_registry_with_prefix(REGISTRY_PREFIX);
        registry.register(
            CONSUMED_TOTAL,
            "Total number of messages consumed successfully",
            metrics.consumed.clone(),
        );
        registry.register(
            CONSUME_ERRORS_TOTAL,
            "Total number of failed jobs",
            metrics.consume_errors.clone(),
        );
        registry.register(
            DLQ_DISPATCHED_TOTAL,
            "Total number of messages dispatched to a dead-letter topic",
            metrics.dlq_dispatched.clone(),
        );
        registry.register(
            PAUSED_TOTAL,
            "Total number of partition pauses",
            metrics.paused.clone(),
        );
        registry.register(
            THROTTLED_TOTAL,
            "Total number of pauses caused by throttling",
            metrics.throttled.clone(),
        );
        registry.register(
            REVOKED_TOTAL,
            "Total number of partition revocations",
            metrics.revoked.clone(),
        );
        registry.register(
            MARKED_TOTAL,
            "Total number of offsets marked as consumed",
            metrics.marked.clone(),
        );
        registry.register(
            ERRORS_TOTAL,
            "Total number of runtime errors",
            metrics.errors.clone(),
        );
        registry.register(
            BATCH_SIZE,
            "Number of messages per polled batch",
            metrics.batch_size.clone(),
        );
        metrics
    }

    /// Updates the metrics for one event.
    pub fn record(&self, event: &Event) {
        match event {
            Event::BeforeScheduleConsume {
                partition,
                messages,
            } => {
                self.batch_size
                    .get_or_create(&labels(partition))
                    .observe(*messages as f64);
            }
            Event::Consumed {
                partition,
                messages,
                ..
            } => {
                self.consumed
                    .get_or_create(&labels(partition))
                    .inc_by(*messages as u64);
            }
            Event::ConsumeFailed { partition, .. } => {
                self.consume_errors.get_or_create(&labels(partition)).inc();
            }
            Event::DeadLetterDispatched { partition, .. } => {
                self.dlq_dispatched.get_or_create(&labels(partition)).inc();
            }
            Event::Paused { partition, .. } => {
                self.paused.get_or_create(&labels(partition)).inc();
            }
            Event::Throttled { partition, .. } => {
                self.throttled.get_or_create(&labels(partition)).inc();
            }
            Event::Revoked { partition } => {
                self.revoked.get_or_create(&labels(partition)).inc();
            }
            Event::MarkedAsConsumed { partition, .. } => {
                self.marked.get_or_create(&labels(partition)).inc();
            }
            Event::Error { partition, .. } => {
                let labels = partition.as_ref().map(labels).unwrap_or_default();
                self.errors.get_or_create(&labels).inc();
            }
            _ => {}
        }
    }
}

static CONSUMER_METRICS: OnceLock<ConsumerMetrics> = OnceLock::new();

pub fn consumer_metrics() -> &'static ConsumerMetrics {
    CONSUMER_METRICS.get_or_init(ConsumerMetrics::new)
}

/// Labels of all partition level metrics.
pub fn labels(partition: &TopicPartition) -> Labels {
    vec![
        (TOPIC_LABEL.to_string(), partition.topic.to_string()),
        (PARTITION_LABEL.to_string(), partition.partition.to_string()),
    ]
}

/// Records every event of `monitor` until all its handles are dropped.
pub fn spawn(monitor: &Monitor) -> JoinHandle<()> {
    let mut events = monitor.subscribe();
    let metrics = consumer_metrics();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => metrics.record(&event),
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Metrics fell behind the event stream");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Metrics recorder stopped");
    })
}

/// The registry in the Prometheus text exposition format.
pub fn encode_metrics() -> Result<String> {
    // make sure the metrics are registered even before the first event
    consumer_metrics();
    let mut buffer = String::new();
    encode(&mut buffer, &global_registry().registry.lock())
        .map_err(|e| Error::Metrics(format!("encoding metrics: {e}")))?;
    Ok(buffer)
}
