//! Fixed-window rate limiting used to throttle how many messages of a partition are processed
//! per time interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

mod error;

pub use error::{Error, Result};

/// RateLimiter will expose methods to query the tokens available per unit time
#[trait_variant::make(Send)]
pub trait RateLimiter {
    /// Returns the number of tokens acquired from the current window. If `n` is provided, it will
    /// try to acquire `n` tokens else it will acquire all the tokens. When nothing is available and
    /// a `timeout` is given, it waits for the next window (at most `timeout`) and tries once more.
    async fn acquire_n(&self, n: Option<usize>, timeout: Option<Duration>) -> usize;
}

/// Boundaries of one throttling window.
#[derive(Clone, Debug, PartialEq)]
pub struct WindowBounds {
    /// Maximum number of tokens handed out per window.
    limit: usize,
    /// Length of a window.
    interval: Duration,
}

impl WindowBounds {
    /// `limit` tokens for every `interval`. Both have to be positive.
    pub fn new(limit: usize, interval: Duration) -> Result<Self> {
        if limit == 0 {
            return Err(Error::InvalidLimit("limit has to be positive".to_string()));
        }
        if interval.is_zero() {
            return Err(Error::InvalidInterval(
                "interval has to be positive".to_string(),
            ));
        }
        Ok(WindowBounds { limit, interval })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[derive(Debug)]
enum TokenAvailability {
    /// Tokens are available for this window
    Available(usize),
    /// All the tokens of this window have been handed out.
    Exhausted,
    /// A new window started, the tokens have to be refilled first.
    Recompute,
}

/// RateLimit hands out at most `limit` tokens per window. Windows are aligned to the creation
/// time of the limiter. It is clonable so one limiter can be shared by several tasks.
#[derive(Clone, Debug)]
pub struct RateLimit {
    bounds: WindowBounds,
    /// Tokens left in the current window.
    token: Arc<AtomicUsize>,
    /// Index of the window the tokens belong to.
    window: Arc<AtomicU64>,
    origin: Instant,
}

impl std::fmt::Display for RateLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "bounds: {:?}, token: {}, window: {}",
            self.bounds,
            self.token.load(Ordering::Relaxed),
            self.window.load(Ordering::Relaxed)
        )
    }
}

impl RateLimit {
    pub fn new(bounds: WindowBounds) -> Self {
        RateLimit {
            token: Arc::new(AtomicUsize::new(bounds.limit)),
            window: Arc::new(AtomicU64::new(0)),
            origin: Instant::now(),
            bounds,
        }
    }

    pub fn bounds(&self) -> &WindowBounds {
        &self.bounds
    }

    /// Time left until the current window closes and the tokens are refilled.
    pub fn window_remaining(&self) -> Duration {
        let interval = self.bounds.interval.as_nanos();
        let into_window = self.origin.elapsed().as_nanos() % interval;
        Duration::from_nanos(u64::try_from(interval - into_window).unwrap_or(u64::MAX))
    }

    fn current_window(&self) -> u64 {
        let window = self.origin.elapsed().as_nanos() / self.bounds.interval.as_nanos();
        u64::try_from(window).unwrap_or(u64::MAX)
    }

    fn get_tokens(&self, n: Option<usize>) -> TokenAvailability {
        if self.window.load(Ordering::Acquire) < self.current_window() {
            return TokenAvailability::Recompute;
        }

        match self
            .token
            .fetch_update(Ordering::Release, Ordering::Acquire, |current| {
                if current == 0 {
                    return None;
                }
                match n {
                    None => Some(0),
                    Some(requested) if current >= requested => Some(current - requested),
                    Some(_) => Some(0),
                }
            }) {
            Ok(previous) => {
                let acquired = match n {
                    Some(requested) if previous >= requested => requested,
                    _ => previous,
                };
                TokenAvailability::Available(acquired)
            }
            Err(_) => TokenAvailability::Exhausted,
        }
    }

    /// Acquires without waiting.
    fn try_acquire(&self, n: Option<usize>) -> usize {
        match self.get_tokens(n) {
            TokenAvailability::Available(t) => return t,
            TokenAvailability::Exhausted => return 0,
            TokenAvailability::Recompute => {}
        }

        let window = self.current_window();
        // only the task that moves the window forward refills it
        let previous = self.window.load(Ordering::Acquire);
        if previous < window
            && self
                .window
                .compare_exchange(previous, window, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.token.store(self.bounds.limit, Ordering::Release);
        }

        match self.get_tokens(n) {
            TokenAvailability::Available(tokens) => tokens,
            TokenAvailability::Exhausted => 0,
            other => {
                warn!(?other, "Window was refilled and still needs to be recomputed");
                0
            }
        }
    }
}

impl RateLimiter for RateLimit {
    async fn acquire_n(&self, n: Option<usize>, timeout: Option<Duration>) -> usize {
        let acquired = self.try_acquire(n);
        if acquired > 0 {
            return acquired;
        }
        let Some(timeout) = timeout else {
            return 0;
        };

        let remaining = self.window_remaining();
        if timeout < remaining {
            tokio::time::sleep(timeout).await;
            return 0;
        }
        tokio::time::sleep(remaining).await;
        self.try_acquire(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: usize, interval_ms: u64) -> RateLimit {
        RateLimit::new(WindowBounds::new(limit, Duration::from_millis(interval_ms)).unwrap())
    }

    #[test]
    fn test_invalid_bounds() {
        assert!(matches!(
            WindowBounds::new(0, Duration::from_secs(1)),
            Err(Error::InvalidLimit(_))
        ));
        assert!(matches!(
            WindowBounds::new(1, Duration::ZERO),
            Err(Error::InvalidInterval(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_all_tokens() {
        let rate_limiter = limiter(5, 1000);

        assert_eq!(rate_limiter.acquire_n(None, None).await, 5);
        assert_eq!(rate_limiter.acquire_n(None, None).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_specific_tokens() {
        let rate_limiter = limiter(5, 1000);

        assert_eq!(rate_limiter.acquire_n(Some(3), None).await, 3);
        assert_eq!(rate_limiter.acquire_n(Some(2), None).await, 2);
        assert_eq!(rate_limiter.acquire_n(Some(1), None).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_more_than_available() {
        let rate_limiter = limiter(3, 1000);

        // all the available tokens are handed out
        assert_eq!(rate_limiter.acquire_n(Some(5), None).await, 3);
        assert_eq!(rate_limiter.acquire_n(Some(1), None).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_on_next_window() {
        let rate_limiter = limiter(4, 1000);
        assert_eq!(rate_limiter.acquire_n(Some(10), None).await, 4);

        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(rate_limiter.acquire_n(Some(1), None).await, 0);
        assert_eq!(rate_limiter.window_remaining(), Duration::from_millis(600));

        tokio::time::advance(Duration::from_millis(600)).await;
        // a new window does not carry over unused tokens
        assert_eq!(rate_limiter.acquire_n(Some(10), None).await, 4);
        assert_eq!(rate_limiter.window_remaining(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_next_window() {
        let rate_limiter = limiter(2, 1000);
        assert_eq!(rate_limiter.acquire_n(None, None).await, 2);

        let start = Instant::now();
        let tokens = rate_limiter
            .acquire_n(Some(1), Some(Duration::from_secs(5)))
            .await;
        assert_eq!(tokens, 1);
        assert_eq!(start.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_gives_up_after_timeout() {
        let rate_limiter = limiter(2, 1000);
        assert_eq!(rate_limiter.acquire_n(None, None).await, 2);

        let tokens = rate_limiter
            .acquire_n(Some(1), Some(Duration::from_millis(100)))
            .await;
        assert_eq!(tokens, 0);
    }

    #[tokio::test]
    async fn test_concurrent_token_acquisition() {
        let rate_limiter = Arc::new(limiter(10, 60_000));

        let mut join_set = tokio::task::JoinSet::new();
        for _ in 0..5 {
            let limiter = Arc::clone(&rate_limiter);
            join_set.spawn(async move { limiter.acquire_n(Some(3), None).await });
        }

        let total_acquired: usize = join_set.join_all().await.into_iter().sum();
        assert_eq!(total_acquired, 10);
    }
}
