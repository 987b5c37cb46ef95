//! Minimum-interval rate limiter for external data sources.
//!
//! Every source gets one limiter shared by all workers, so the configured
//! delay between calls holds globally no matter how many symbols sync at once.
//! After a `RateLimited` response the interval doubles (up to a cap) until the
//! next successful call resets it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A minimum-interval rate limiter with exponential backoff.
#[derive(Debug)]
pub struct RateLimiter {
    /// Delay between two calls with no backoff applied
    base_interval: Duration,
    /// Maximum number of doublings
    max_backoff_level: u32,
    /// Current number of doublings
    backoff_level: AtomicU32,
    /// Earliest instant the next call may start
    next_slot: Mutex<Option<Instant>>,
    /// Name for logging
    name: String,
}

impl RateLimiter {
    /// Create a new rate limiter.
    ///
    /// # Arguments
    /// * `name` - Name for logging purposes
    /// * `interval` - Minimum delay between two calls
    /// * `max_backoff_level` - How many times the interval may double (0 disables backoff)
    pub fn new(name: impl Into<String>, interval: Duration, max_backoff_level: u32) -> Self {
        Self {
            base_interval: interval,
            max_backoff_level,
            backoff_level: AtomicU32::new(0),
            next_slot: Mutex::new(None),
            name: name.into(),
        }
    }

    /// Create a rate limiter from a millisecond interval with no backoff.
    pub fn from_millis(name: impl Into<String>, interval_ms: u64) -> Self {
        Self::new(name, Duration::from_millis(interval_ms), 0)
    }

    /// Wait for this caller's slot.
    ///
    /// Slots are handed out in call order; each reservation pushes the next
    /// slot one interval further.
    pub async fn acquire(&self) {
        let wait = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(t) if t > now => t,
                _ => now,
            };
            *next = Some(slot + self.current_interval());
            slot.saturating_duration_since(now)
        };

        if !wait.is_zero() {
            debug!(
                limiter = %self.name,
                wait_ms = wait.as_millis() as u64,
                "Pacing request"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Back off after a rate-limit response.
    pub fn penalize(&self) {
        let previous = self
            .backoff_level
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |level| {
                (level < self.max_backoff_level).then_some(level + 1)
            });

        match previous {
            Ok(level) => warn!(
                limiter = %self.name,
                backoff_level = level + 1,
                interval_ms = self.current_interval().as_millis() as u64,
                "Source rate limited, backing off"
            ),
            Err(_) => warn!(
                limiter = %self.name,
                interval_ms = self.current_interval().as_millis() as u64,
                "Source rate limited at maximum backoff"
            ),
        }
    }

    /// Return to the base interval after a successful call.
    pub fn reset_backoff(&self) {
        if self.backoff_level.swap(0, Ordering::Relaxed) > 0 {
            debug!(limiter = %self.name, "Backoff cleared");
        }
    }

    /// Interval currently enforced, including backoff.
    pub fn current_interval(&self) -> Duration {
        let level = self.backoff_level.load(Ordering::Relaxed);
        self.base_interval.saturating_mul(1u32 << level.min(16))
    }

    /// Get the limiter name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Shared rate limiter that can be cloned.
pub type SharedRateLimiter = Arc<RateLimiter>;

/// Create a shared rate limiter.
pub fn shared_limiter(
    name: impl Into<String>,
    interval: Duration,
    max_backoff_level: u32,
) -> SharedRateLimiter {
    Arc::new(RateLimiter::new(name, interval, max_backoff_level))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_creation() {
        let limiter = RateLimiter::from_millis("twse", 3000);
        assert_eq!(limiter.current_interval(), Duration::from_secs(3));
        assert_eq!(limiter.name(), "twse");
    }

    #[tokio::test]
    async fn test_acquire_spacing() {
        let limiter = RateLimiter::from_millis("test", 40);
        let start = std::time::Instant::now();

        for _ in 0..3 {
            limiter.acquire().await;
        }

        // First call is immediate, the next two wait one interval each
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_shared_limiter_spaces_concurrent_callers() {
        let limiter = shared_limiter("shared", Duration::from_millis(30), 0);
        let start = std::time::Instant::now();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.acquire().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let limiter = RateLimiter::new("finmind", Duration::from_millis(100), 2);

        limiter.penalize();
        assert_eq!(limiter.current_interval(), Duration::from_millis(200));
        limiter.penalize();
        assert_eq!(limiter.current_interval(), Duration::from_millis(400));
        limiter.penalize();
        assert_eq!(limiter.current_interval(), Duration::from_millis(400));

        limiter.reset_backoff();
        assert_eq!(limiter.current_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_disabled() {
        let limiter = RateLimiter::from_millis("yahoo", 100);
        limiter.penalize();
        assert_eq!(limiter.current_interval(), Duration::from_millis(100));
    }
}
