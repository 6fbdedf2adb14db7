use std::time::Duration;

use tokio::time::Instant;

use crate::strategy::exponential::Exponential;

/// Pauses longer than this are clamped so the deadline always fits into an [`Instant`].
const MAX_PAUSE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Knobs of the pause interval computation.
#[derive(Debug, Clone, PartialEq)]
pub struct PauseSettings {
    /// Pause used for the first attempt (and for every attempt without exponential growth).
    pub timeout: Duration,
    /// Upper bound of any computed pause.
    pub max_timeout: Duration,
    /// Double the pause with every consecutive attempt.
    pub with_exponential_backoff: bool,
    /// Randomization factor (0.0 to 1.0) applied to the computed pause.
    pub jitter: f64,
}

impl Default for PauseSettings {
    fn default() -> Self {
        PauseSettings {
            timeout: Duration::from_secs(1),
            max_timeout: Duration::from_secs(30),
            with_exponential_backoff: true,
            jitter: 0.0,
        }
    }
}

/// Tracks consecutive processing attempts of one partition and whether the partition is
/// currently paused.
///
/// `attempt` only changes through [`PauseTracker::increment`] and [`PauseTracker::reset`]; the
/// pause interval is a pure function of it.
#[derive(Debug, Clone)]
pub struct PauseTracker {
    strategy: Exponential,
    attempt: u32,
    /// When the current pause started, `None` when not paused.
    started_at: Option<Instant>,
    /// When the current pause expires.
    paused_until: Option<Instant>,
}

impl PauseTracker {
    pub fn new(settings: &PauseSettings) -> Self {
        let factor = if settings.with_exponential_backoff {
            2.0
        } else {
            1.0
        };
        PauseTracker {
            strategy: Exponential::new(
                settings.timeout,
                settings.max_timeout,
                factor,
                settings.jitter,
            ),
            attempt: 0,
            started_at: None,
            paused_until: None,
        }
    }

    /// Registers one more processing attempt.
    pub fn increment(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
    }

    /// Forgets all attempts. Calling it repeatedly is the same as calling it once.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// `min(max_timeout, timeout * 2^attempt)` with exponential backoff, `timeout` otherwise.
    pub fn backoff(&self) -> Duration {
        self.strategy.interval(self.attempt)
    }

    /// Starts a pause. Without an explicit `timeout` the [`PauseTracker::backoff`] interval is
    /// used. Returns the effective pause duration.
    pub fn pause(&mut self, timeout: Option<Duration>) -> Duration {
        let timeout = timeout.unwrap_or_else(|| self.backoff()).min(MAX_PAUSE);
        let now = Instant::now();
        self.started_at = Some(now);
        self.paused_until = Some(now + timeout);
        timeout
    }

    pub fn is_paused(&self) -> bool {
        self.paused_until.is_some()
    }

    /// A paused tracker whose deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.paused_until
            .is_some_and(|deadline| deadline <= Instant::now())
    }

    /// Moves the deadline to now so the next expiry check resumes the partition.
    pub fn expire(&mut self) {
        if self.paused_until.is_some() {
            self.paused_until = Some(Instant::now());
        }
    }

    /// Marks the pause as finished. The attempt counter is left untouched.
    pub fn resume(&mut self) {
        self.started_at = None;
        self.paused_until = None;
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    /// Time left until the current pause expires.
    pub fn remaining(&self) -> Option<Duration> {
        self.paused_until
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}
