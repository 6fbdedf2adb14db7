use std::collections::HashMap;
use std::env;
use std::time::Duration;

use backoff::PauseSettings;
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use serde::Deserialize;

use crate::Error;
use crate::Result;

/// Base64 encoded JSON document holding the [`Settings`].
pub const ENV_CONSUMER_OBJECT: &str = "RIPPLE_CONSUMER_OBJECT";

const DEFAULT_CONCURRENCY: usize = 5;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_MAX_WAIT_TIME_MS: u64 = 1_000;
const DEFAULT_MAX_MESSAGES: usize = 100;
const DEFAULT_PAUSE_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_PAUSE_MAX_TIMEOUT_MS: u64 = 30_000;

/// Consumer process settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Number of worker tasks processing jobs.
    pub concurrency: usize,
    /// How long shutdown waits for in-flight jobs.
    pub shutdown_timeout_ms: u64,
    /// How long one poll waits to fill a batch.
    pub max_wait_time_ms: u64,
    /// Upper bound of messages fetched per poll.
    pub max_messages: usize,
    /// Pause defaults for topics without their own.
    pub pause: PauseConfig,
    pub kafka: KafkaSettings,
    pub topics: Vec<TopicSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            concurrency: DEFAULT_CONCURRENCY,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            max_wait_time_ms: DEFAULT_MAX_WAIT_TIME_MS,
            max_messages: DEFAULT_MAX_MESSAGES,
            pause: PauseConfig::default(),
            kafka: KafkaSettings::default(),
            topics: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PauseConfig {
    pub timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub with_exponential_backoff: bool,
    pub jitter: f64,
}

impl Default for PauseConfig {
    fn default() -> Self {
        PauseConfig {
            timeout_ms: DEFAULT_PAUSE_TIMEOUT_MS,
            max_timeout_ms: DEFAULT_PAUSE_MAX_TIMEOUT_MS,
            with_exponential_backoff: true,
            jitter: 0.0,
        }
    }
}

impl From<&PauseConfig> for PauseSettings {
    fn from(value: &PauseConfig) -> Self {
        PauseSettings {
            timeout: Duration::from_millis(value.timeout_ms),
            max_timeout: Duration::from_millis(value.max_timeout_ms),
            with_exponential_backoff: value.with_exponential_backoff,
            jitter: value.jitter,
        }
    }
}

/// Connection settings handed to the broker client.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct KafkaSettings {
    pub brokers: Vec<String>,
    pub consumer_group: String,
    /// Any librdkafka option, applied as-is.
    pub kafka_raw_config: HashMap<String, String>,
}

/// Routing of one topic.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TopicSettings {
    pub name: String,
    pub manual_offset_management: bool,
    pub long_running_job: bool,
    pub active_job: bool,
    pub dead_letter_queue: Option<DeadLetterQueueSettings>,
    pub virtual_partitions: Option<VirtualPartitionsSettings>,
    pub throttling: Option<ThrottlingSettings>,
    pub periodic_job: Option<PeriodicJobSettings>,
    /// Overrides the process wide pause settings.
    pub pause: Option<PauseConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeadLetterQueueSettings {
    /// `None` drops skipped messages instead of dispatching them.
    pub topic: Option<String>,
    pub max_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VirtualPartitionsSettings {
    pub max_partitions: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ThrottlingSettings {
    pub limit: usize,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PeriodicJobSettings {
    pub interval_ms: u64,
}

impl Settings {
    /// Loads the settings from [`ENV_CONSUMER_OBJECT`].
    pub fn load() -> Result<Self> {
        let obj = env::var(ENV_CONSUMER_OBJECT)
            .map_err(|_| Error::Config(format!("{ENV_CONSUMER_OBJECT} is not set")))?;
        Self::decode(&obj)
    }

    /// Decodes a base64 encoded JSON settings document.
    pub fn decode(obj: &str) -> Result<Self> {
        let decoded = BASE64_STANDARD
            .decode(obj.as_bytes())
            .map_err(|e| Error::Config(format!("decoding {ENV_CONSUMER_OBJECT}: {e:?}")))?;
        let settings: Settings = serde_json::from_slice(&decoded)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency has to be positive".to_string()));
        }
        if self.max_messages == 0 {
            return Err(Error::Config("max_messages has to be positive".to_string()));
        }
        validate_pause(&self.pause)?;
        for topic in &self.topics {
            topic.validate()?;
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn max_wait_time(&self) -> Duration {
        Duration::from_millis(self.max_wait_time_ms)
    }
}

impl TopicSettings {
    pub fn new(name: impl Into<String>) -> Self {
        TopicSettings {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("topic name cannot be empty".to_string()));
        }
        if self.active_job && !self.manual_offset_management {
            return Err(Error::UnsupportedFeatures(format!(
                "{}: active job requires manual offset management",
                self.name
            )));
        }
        if let Some(vp) = &self.virtual_partitions
            && vp.max_partitions == 0
        {
            return Err(Error::Config(format!(
                "{}: max_partitions has to be at least 1",
                self.name
            )));
        }
        if let Some(throttling) = &self.throttling
            && (throttling.limit == 0 || throttling.interval_ms == 0)
        {
            return Err(Error::Config(format!(
                "{}: throttling limit and interval have to be positive",
                self.name
            )));
        }
        if let Some(periodic) = &self.periodic_job
            && periodic.interval_ms == 0
        {
            return Err(Error::Config(format!(
                "{}: periodic job interval has to be positive",
                self.name
            )));
        }
        if let Some(pause) = &self.pause {
            validate_pause(pause)?;
        }
        Ok(())
    }
}

fn validate_pause(pause: &PauseConfig) -> Result<()> {
    if pause.timeout_ms == 0 || pause.max_timeout_ms < pause.timeout_ms {
        return Err(Error::Config(format!(
            "pause timeout has to be positive and not above max timeout: {pause:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(json: serde_json::Value) -> String {
        BASE64_STANDARD.encode(json.to_string())
    }

    #[test]
    fn test_decode_defaults() {
        let settings = Settings::decode(&encode(serde_json::json!({
            "topics": [{"name": "orders"}]
        })))
        .unwrap();

        assert_eq!(settings.concurrency, 5);
        assert_eq!(settings.shutdown_timeout(), Duration::from_secs(60));
        assert_eq!(settings.max_wait_time(), Duration::from_secs(1));
        assert_eq!(settings.pause, PauseConfig::default());
        assert_eq!(settings.topics.len(), 1);
        assert_eq!(settings.topics[0], TopicSettings::new("orders"));
    }

    #[test]
    fn test_decode_full() {
        let settings = Settings::decode(&encode(serde_json::json!({
            "concurrency": 2,
            "pause": {"timeout_ms": 200, "max_timeout_ms": 1000, "with_exponential_backoff": false},
            "kafka": {
                "brokers": ["localhost:9092"],
                "consumer_group": "payments",
                "kafka_raw_config": {"session.timeout.ms": "10000"}
            },
            "topics": [{
                "name": "payments",
                "manual_offset_management": true,
                "long_running_job": true,
                "dead_letter_queue": {"topic": "payments-dlq", "max_retries": 3},
                "virtual_partitions": {"max_partitions": 4},
                "throttling": {"limit": 10, "interval_ms": 1000},
                "periodic_job": {"interval_ms": 5000},
                "pause": {"timeout_ms": 50, "max_timeout_ms": 500}
            }]
        })))
        .unwrap();

        assert_eq!(settings.concurrency, 2);
        assert!(!settings.pause.with_exponential_backoff);
        assert_eq!(settings.kafka.consumer_group, "payments");
        assert_eq!(
            settings.kafka.kafka_raw_config.get("session.timeout.ms"),
            Some(&"10000".to_string())
        );

        let topic = &settings.topics[0];
        assert_eq!(
            topic.dead_letter_queue,
            Some(DeadLetterQueueSettings {
                topic: Some("payments-dlq".to_string()),
                max_retries: 3
            })
        );
        assert_eq!(topic.virtual_partitions.as_ref().unwrap().max_partitions, 4);
        assert_eq!(topic.throttling.as_ref().unwrap().limit, 10);
        assert_eq!(topic.periodic_job.as_ref().unwrap().interval_ms, 5000);

        let pause: PauseSettings = topic.pause.as_ref().unwrap().into();
        assert_eq!(pause.timeout, Duration::from_millis(50));
        assert!(pause.with_exponential_backoff);
    }

    #[test]
    fn test_active_job_without_manual_offset_management() {
        let result = Settings::decode(&encode(serde_json::json!({
            "topics": [{"name": "jobs", "active_job": true}]
        })));
        assert!(matches!(result, Err(Error::UnsupportedFeatures(_))));
    }

    #[test]
    fn test_invalid_throttling() {
        let result = Settings::decode(&encode(serde_json::json!({
            "topics": [{"name": "t", "throttling": {"limit": 0, "interval_ms": 1000}}]
        })));
        assert!(matches!(result, Err(Error::Config(_))));

        let result = Settings::decode(&encode(serde_json::json!({
            "topics": [{"name": "t", "throttling": {"limit": 5, "interval_ms": 0}}]
        })));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_invalid_documents() {
        assert!(matches!(
            Settings::decode("not base64!"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Settings::decode(&BASE64_STANDARD.encode("{not json")),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Settings::decode(&encode(serde_json::json!({"concurrency": 0}))),
            Err(Error::Config(_))
        ));
    }
}
