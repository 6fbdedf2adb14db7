//! Processing strategies. Every supported combination of topic features maps to one immutable
//! [`Strategy`], resolved once per topic through the [`Resolver`] lookup table.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::{Error, Result};

/// Offset marking, pausing and seeking primitives shared by the hooks and the consume context.
pub(crate) mod actions;

/// Hook implementations driven by the executor and the runtime.
pub(crate) mod lifecycle;

/// Topic features that change how a batch is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Feature {
    ActiveJob,
    DeadLetterQueue,
    LongRunningJob,
    ManualOffsetManagement,
    Throttling,
    VirtualPartitions,
}

impl Feature {
    pub const ALL: [Feature; 6] = [
        Feature::ActiveJob,
        Feature::DeadLetterQueue,
        Feature::LongRunningJob,
        Feature::ManualOffsetManagement,
        Feature::Throttling,
        Feature::VirtualPartitions,
    ];

    fn bit(self) -> u8 {
        match self {
            Feature::ActiveJob => 1,
            Feature::DeadLetterQueue => 1 << 1,
            Feature::LongRunningJob => 1 << 2,
            Feature::ManualOffsetManagement => 1 << 3,
            Feature::Throttling => 1 << 4,
            Feature::VirtualPartitions => 1 << 5,
        }
    }

    fn short_name(self) -> &'static str {
        match self {
            Feature::ActiveJob => "aj",
            Feature::DeadLetterQueue => "dlq",
            Feature::LongRunningJob => "lrj",
            Feature::ManualOffsetManagement => "mom",
            Feature::Throttling => "ftr",
            Feature::VirtualPartitions => "vp",
        }
    }
}

/// A sorted set of [`Feature`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FeatureSet(u8);

impl FeatureSet {
    pub fn new(features: impl IntoIterator<Item = Feature>) -> Self {
        features
            .into_iter()
            .fold(FeatureSet::default(), |set, f| set.with(f))
    }

    pub fn with(self, feature: Feature) -> Self {
        FeatureSet(self.0 | feature.bit())
    }

    pub fn contains(&self, feature: Feature) -> bool {
        self.0 & feature.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Features in their sort order.
    pub fn iter(&self) -> impl Iterator<Item = Feature> + use<> {
        let set = *self;
        Feature::ALL.into_iter().filter(move |f| set.contains(*f))
    }

    fn all_subsets() -> impl Iterator<Item = FeatureSet> {
        (0u8..(1 << Feature::ALL.len())).map(FeatureSet)
    }
}

impl fmt::Display for FeatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "default");
        }
        let names: Vec<&str> = self.iter().map(Feature::short_name).collect();
        write!(f, "{}", names.join("_"))
    }
}

/// `before_schedule_consume` variants, run on the poll side before jobs are built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeforeScheduleConsume {
    Instrument,
    /// Admit only what the partition's rate limit allows, defer the rest.
    Throttle,
}

/// Runs right before the jobs of a batch are handed to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeforeEnqueue {
    Noop,
    /// Pause at the seek offset so a crash mid-job never skips messages.
    PauseLongRunning,
}

/// `consume` variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consume {
    Standard,
    /// A successful sub-job confirms all its messages in the virtual offset manager.
    VirtualAutoMark,
    /// Marking is left to user code (manual offset management with virtual partitions).
    VirtualManualMark,
}

/// What a successful batch commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnSuccess {
    /// Mark the highest offset of the batch.
    MarkLast,
    /// Mark the highest contiguous offset confirmed in the virtual offset manager.
    MarkVirtual,
    /// Offsets are entirely user driven.
    Skip,
}

/// What a failed batch does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnFailure {
    /// Pause at the seek offset with backoff and redeliver.
    Retry,
    /// Retry up to the topic's `max_retries`, then dispatch the first unprocessed message to the
    /// dead-letter topic. `mark` is false with manual offset management, the seek offset is then
    /// moved past the message without committing.
    DeadLetter { mark: bool },
}

/// The policy applied exactly once when all jobs of a batch finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AfterConsume {
    pub on_success: OnSuccess,
    pub on_failure: OnFailure,
    /// Long-running jobs seek back to the seek offset and resume on success.
    pub long_running: bool,
    /// Commit the confirmed prefix of a failed virtual batch before pausing.
    pub virtual_partitions: bool,
    /// Pause at the throttle cursor after a successful, partially admitted batch.
    pub throttled: bool,
    /// Skip the success mark while the runtime is stopping (active job with virtual partitions).
    pub skip_mark_when_stopping: bool,
}

/// `revoked` variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revoked {
    ResumeAndRevoke,
    /// Long-running jobs must not resume a partition that was taken away.
    RevokeWithoutResume,
}

/// Immutable composition of lifecycle hook variants for one feature set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Strategy {
    name: String,
    features: FeatureSet,
    pub before_schedule_consume: BeforeScheduleConsume,
    pub before_enqueue: BeforeEnqueue,
    pub consume: Consume,
    pub after_consume: AfterConsume,
    pub revoked: Revoked,
}

impl Strategy {
    fn compose(features: FeatureSet) -> Result<Self> {
        let mom = features.contains(Feature::ManualOffsetManagement);
        let lrj = features.contains(Feature::LongRunningJob);
        let vp = features.contains(Feature::VirtualPartitions);
        let aj = features.contains(Feature::ActiveJob);
        let ftr = features.contains(Feature::Throttling);

        if aj && !mom {
            return Err(Error::UnsupportedFeatures(format!(
                "{features}: active job requires manual offset management"
            )));
        }

        let on_success = match (mom, vp) {
            (false, _) => OnSuccess::MarkLast,
            (true, true) => OnSuccess::MarkVirtual,
            (true, false) => OnSuccess::Skip,
        };
        let on_failure = if features.contains(Feature::DeadLetterQueue) {
            OnFailure::DeadLetter { mark: !mom }
        } else {
            OnFailure::Retry
        };

        Ok(Strategy {
            name: features.to_string(),
            features,
            before_schedule_consume: if ftr {
                BeforeScheduleConsume::Throttle
            } else {
                BeforeScheduleConsume::Instrument
            },
            before_enqueue: if lrj {
                BeforeEnqueue::PauseLongRunning
            } else {
                BeforeEnqueue::Noop
            },
            consume: match (vp, mom) {
                (false, _) => Consume::Standard,
                (true, false) => Consume::VirtualAutoMark,
                (true, true) => Consume::VirtualManualMark,
            },
            after_consume: AfterConsume {
                on_success,
                on_failure,
                long_running: lrj,
                virtual_partitions: vp,
                throttled: ftr,
                skip_mark_when_stopping: aj && vp,
            },
            revoked: if lrj {
                Revoked::RevokeWithoutResume
            } else {
                Revoked::ResumeAndRevoke
            },
        })
    }

    /// Sorted feature short names joined by `_`, e.g. `dlq_mom_vp`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn features(&self) -> FeatureSet {
        self.features
    }

    pub fn has(&self, feature: Feature) -> bool {
        self.features.contains(feature)
    }
}

/// Lookup table from feature set to strategy, built once.
#[derive(Debug, Clone)]
pub struct Resolver {
    strategies: HashMap<FeatureSet, Arc<Strategy>>,
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver {
    pub fn new() -> Self {
        let strategies = FeatureSet::all_subsets()
            .filter_map(|features| {
                Strategy::compose(features)
                    .ok()
                    .map(|strategy| (features, Arc::new(strategy)))
            })
            .collect();
        Resolver { strategies }
    }

    pub fn resolve(&self, features: FeatureSet) -> Result<Arc<Strategy>> {
        self.strategies
            .get(&features)
            .map(Arc::clone)
            .ok_or_else(|| {
                Error::UnsupportedFeatures(format!(
                    "no processing strategy for feature combination {features}"
                ))
            })
    }

    /// Number of supported feature combinations.
    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}
