//! Resolved per-topic routing: the feature parameters, the attached capabilities that cannot be
//! expressed in configuration, and the processing strategy.

use std::collections::HashMap;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use backoff::PauseSettings;
use ripple_throttling::WindowBounds;

use crate::Result;
use crate::client::DeadLetter;
use crate::config::{PauseConfig, Settings, TopicSettings};
use crate::message::Message;
use crate::strategy::{Feature, FeatureSet, Resolver, Strategy};

/// Maps a message to its virtual partition key.
pub type Partitioner = Arc<dyn Fn(&Message) -> String + Send + Sync>;

/// Optional capability to adjust a message before it is dispatched to the dead-letter topic.
///
/// Topic, key and the `original_*` headers are set after the enhancer ran and cannot be
/// overridden.
pub trait DlqEnhancer: Send + Sync {
    fn enhance(&self, message: &Message, record: &mut DeadLetter);
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterQueue {
    pub topic: Option<String>,
    pub max_retries: u32,
}

#[derive(Clone)]
pub struct VirtualPartitions {
    pub max_partitions: usize,
    pub partitioner: Partitioner,
}

impl VirtualPartitions {
    /// Virtual partition (segment) of `message`, stable for equal partitioner keys.
    pub fn segment(&self, message: &Message) -> usize {
        if self.max_partitions <= 1 {
            return 0;
        }
        let mut hasher = DefaultHasher::new();
        (self.partitioner)(message).hash(&mut hasher);
        (hasher.finish() % self.max_partitions as u64) as usize
    }
}

impl fmt::Debug for VirtualPartitions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualPartitions")
            .field("max_partitions", &self.max_partitions)
            .finish_non_exhaustive()
    }
}

/// Default partitioner, groups messages by key.
fn key_partitioner() -> Partitioner {
    Arc::new(|message: &Message| {
        message
            .key
            .as_ref()
            .map(|key| String::from_utf8_lossy(key).into_owned())
            .unwrap_or_default()
    })
}

/// A topic the consumer group is subscribed to.
#[derive(Clone)]
pub struct Topic {
    pub name: Arc<str>,
    pub consumer_group: Arc<str>,
    pub pause: PauseSettings,
    pub dead_letter_queue: Option<DeadLetterQueue>,
    pub virtual_partitions: Option<VirtualPartitions>,
    pub throttling: Option<WindowBounds>,
    pub periodic_interval: Option<Duration>,
    pub enhancer: Option<Arc<dyn DlqEnhancer>>,
    strategy: Arc<Strategy>,
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("strategy", &self.strategy.name())
            .field("dead_letter_queue", &self.dead_letter_queue)
            .field("virtual_partitions", &self.virtual_partitions)
            .field("throttling", &self.throttling)
            .field("periodic_interval", &self.periodic_interval)
            .field("has_enhancer", &self.enhancer.is_some())
            .finish_non_exhaustive()
    }
}

impl Topic {
    pub fn from_settings(
        settings: &TopicSettings,
        consumer_group: &str,
        default_pause: &PauseConfig,
        resolver: &Resolver,
    ) -> Result<Self> {
        settings.validate()?;

        let mut features = FeatureSet::default();
        let flags = [
            (settings.active_job, Feature::ActiveJob),
            (
                settings.dead_letter_queue.is_some(),
                Feature::DeadLetterQueue,
            ),
            (settings.long_running_job, Feature::LongRunningJob),
            (
                settings.manual_offset_management,
                Feature::ManualOffsetManagement,
            ),
            (settings.throttling.is_some(), Feature::Throttling),
            (
                settings.virtual_partitions.is_some(),
                Feature::VirtualPartitions,
            ),
        ];
        for (enabled, feature) in flags {
            if enabled {
                features = features.with(feature);
            }
        }
        let strategy = resolver.resolve(features)?;

        let throttling = settings
            .throttling
            .as_ref()
            .map(|t| WindowBounds::new(t.limit, Duration::from_millis(t.interval_ms)))
            .transpose()?;

        Ok(Topic {
            name: Arc::from(settings.name.as_str()),
            consumer_group: Arc::from(consumer_group),
            pause: settings.pause.as_ref().unwrap_or(default_pause).into(),
            dead_letter_queue: settings
                .dead_letter_queue
                .as_ref()
                .map(|dlq| DeadLetterQueue {
                    topic: dlq.topic.clone(),
                    max_retries: dlq.max_retries,
                }),
            virtual_partitions: settings
                .virtual_partitions
                .as_ref()
                .map(|vp| VirtualPartitions {
                    max_partitions: vp.max_partitions,
                    partitioner: key_partitioner(),
                }),
            throttling,
            periodic_interval: settings
                .periodic_job
                .as_ref()
                .map(|p| Duration::from_millis(p.interval_ms)),
            enhancer: None,
            strategy,
        })
    }

    /// Replaces the key based virtual partitioner. No-op for topics without virtual partitions.
    pub fn with_partitioner(
        mut self,
        partitioner: impl Fn(&Message) -> String + Send + Sync + 'static,
    ) -> Self {
        if let Some(vp) = self.virtual_partitions.as_mut() {
            vp.partitioner = Arc::new(partitioner);
        }
        self
    }

    pub fn with_enhancer(mut self, enhancer: impl DlqEnhancer + 'static) -> Self {
        self.enhancer = Some(Arc::new(enhancer));
        self
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn has(&self, feature: Feature) -> bool {
        self.strategy.has(feature)
    }
}

/// All topics of the consumer group by name.
#[derive(Debug, Clone, Default)]
pub struct Routes {
    topics: HashMap<Arc<str>, Arc<Topic>>,
}

impl Routes {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let resolver = Resolver::new();
        let mut routes = Routes::default();
        for topic in &settings.topics {
            routes = routes.with_topic(Topic::from_settings(
                topic,
                &settings.kafka.consumer_group,
                &settings.pause,
                &resolver,
            )?);
        }
        Ok(routes)
    }

    pub fn with_topic(mut self, topic: Topic) -> Self {
        self.topics.insert(Arc::clone(&topic.name), Arc::new(topic));
        self
    }

    /// Applies `f` to an already registered topic, e.g. to attach a partitioner.
    pub fn update(mut self, name: &str, f: impl FnOnce(Topic) -> Topic) -> Self {
        if let Some(topic) = self.topics.remove(name) {
            let topic = Arc::unwrap_or_clone(topic);
            let topic = f(topic);
            self.topics.insert(Arc::clone(&topic.name), Arc::new(topic));
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.get(name).map(Arc::clone)
    }

    pub fn names(&self) -> Vec<String> {
        self.topics.keys().map(|name| name.to_string()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Topic>> {
        self.topics.values()
    }
}
