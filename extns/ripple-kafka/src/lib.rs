//! rdkafka backed broker collaborators of the ripple runtime: [`KafkaConsumer`] polls batches
//! and tracks rebalances, [`KafkaClient`] commits, pauses, resumes and seeks, and
//! [`KafkaProducer`] dispatches dead letters.

use std::collections::HashMap;
use std::time::Duration;

use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use ripple_core::Settings;
use tracing::info;

mod consumer;
mod producer;

pub use consumer::{KafkaClient, KafkaConsumer};
pub use producer::KafkaProducer;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Connecting to Kafka {server} - {error}")]
    Connection { server: String, error: String },

    #[error("Kafka - {0}")]
    Kafka(String),
}

impl From<Error> for ripple_core::Error {
    fn from(value: Error) -> Self {
        ripple_core::Error::Client(value.to_string())
    }
}

/// Everything needed to connect the consumer group.
#[derive(Debug, Clone, PartialEq)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub consumer_group: String,
    pub topics: Vec<String>,
    /// Upper bound of messages per poll.
    pub max_messages: usize,
    /// How long one poll waits to fill a batch.
    pub max_wait_time: Duration,
    /// Any supported kafka client configuration options from
    /// https://docs.confluent.io/platform/current/clients/librdkafka/html/md_CONFIGURATION.html
    pub kafka_raw_config: HashMap<String, String>,
}

impl KafkaConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        KafkaConfig {
            brokers: settings.kafka.brokers.clone(),
            consumer_group: settings.kafka.consumer_group.clone(),
            topics: settings.topics.iter().map(|t| t.name.clone()).collect(),
            max_messages: settings.max_messages,
            max_wait_time: settings.max_wait_time(),
            kafka_raw_config: settings.kafka.kafka_raw_config.clone(),
        }
    }

    fn server(&self) -> String {
        self.brokers.join(",")
    }

    /// Base client configuration, user options applied on top of the defaults.
    fn client_config(&self, defaults: &[(&str, &str)]) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        for (key, value) in defaults {
            client_config.set(*key, *value);
        }
        if !self.kafka_raw_config.is_empty() {
            info!(
                "Applying user-specified kafka config: {}",
                self.kafka_raw_config
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<String>>()
                    .join(", ")
            );
            for (key, value) in &self.kafka_raw_config {
                client_config.set(key, value);
            }
        }
        client_config
            .set("bootstrap.servers", self.server())
            .set_log_level(RDKafkaLogLevel::Warning);
        client_config
    }
}
