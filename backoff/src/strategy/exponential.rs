use std::time::Duration;

use rand::Rng;

/// An Exponential interval strategy where the interval grows with the attempt number.
///
/// The interval is calculated as: `base_interval * factor^attempt`, capped at `max_interval`,
/// with optional jitter applied. A `factor` of `1.0` yields a fixed interval.
///
/// Unlike an iterator based backoff, the attempt is passed in explicitly, which keeps the
/// computation a pure function of the caller's state.
///
/// # Example
/// ```
/// use backoff::strategy::exponential::Exponential;
/// use std::time::Duration;
///
/// let backoff = Exponential::new(
///     Duration::from_millis(100), // base_interval
///     Duration::from_secs(10),    // max_interval
///     2.0,                        // factor
///     0.0,                        // jitter
/// );
///
/// assert_eq!(backoff.interval(0), Duration::from_millis(100));
/// assert_eq!(backoff.interval(3), Duration::from_millis(800));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Exponential {
    /// The base interval (starting point).
    base_interval: Duration,
    /// The maximum interval (cap).
    max_interval: Duration,
    /// The factor to multiply the interval with for each attempt.
    factor: f64,
    /// Jitter value between 0.0 and 1.0 for randomization.
    jitter: f64,
}

impl Exponential {
    /// Creates a new Exponential interval strategy.
    ///
    /// # Arguments
    /// * `base_interval` - The interval for attempt `0`
    /// * `max_interval` - The maximum interval (cap)
    /// * `factor` - The multiplier for exponential growth
    /// * `jitter` - Randomization factor (0.0 to 1.0)
    pub fn new(base_interval: Duration, max_interval: Duration, factor: f64, jitter: f64) -> Self {
        Self {
            base_interval,
            max_interval,
            factor,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Calculates the interval for the given attempt with optional jitter, capped by the max
    /// interval.
    pub fn interval(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_ms = (self.base_interval.as_millis() as f64) * self.factor.powi(exponent);
        let max_ms = self.max_interval.as_millis() as f64;

        // cap before converting so a large attempt cannot overflow the Duration
        if self.jitter == 0.0 {
            return Duration::from_millis(base_ms.min(max_ms) as u64);
        }

        // 1.0 - jitter gives us the lower bound and 1.0 + jitter gives us the upper bound
        let jitter_factor: f64 = rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        Duration::from_millis((base_ms.min(max_ms) * jitter_factor).min(max_ms) as u64)
    }
}
