use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::clock::Clock;

/// Length of the rolling accounting window.
pub const WINDOW: Duration = Duration::from_secs(60);

const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Sliding-log limiter: at most `max_requests` acquisitions in any rolling
/// `WINDOW`. One sync run owns the process, so there is no cross-process
/// accounting.
pub struct RateLimiter<C: Clock> {
    clock: C,
    max_requests: usize,
    window: chrono::Duration,
    issued: VecDeque<DateTime<Utc>>,
}

impl<C: Clock> RateLimiter<C> {
    pub fn new(max_requests: u32, clock: C) -> Self {
        Self {
            clock,
            max_requests: max_requests.max(1) as usize,
            window: chrono::Duration::from_std(WINDOW).unwrap_or(chrono::Duration::seconds(60)),
            issued: VecDeque::new(),
        }
    }

    /// Wait until a request slot is free, then take it.
    pub async fn acquire(&mut self) {
        loop {
            let now = self.clock.now();
            while let Some(&oldest) = self.issued.front() {
                if now - oldest >= self.window {
                    self.issued.pop_front();
                } else {
                    break;
                }
            }

            if self.issued.len() < self.max_requests {
                self.issued.push_back(now);
                return;
            }

            // Full: sleep until the oldest slot leaves the window.
            let oldest = self.issued[0];
            let wait = (oldest + self.window - now)
                .to_std()
                .unwrap_or(Duration::from_millis(1))
                .max(Duration::from_millis(1));
            log::debug!(
                "Rate limit of {} requests/{}s reached, waiting {:.1}s",
                self.max_requests,
                WINDOW.as_secs(),
                wait.as_secs_f64()
            );
            self.clock.sleep(wait).await;
        }
    }
}

/// Bounded exponential backoff with jitter for 429/5xx/transport failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: BASE_DELAY,
            max_delay: MAX_DELAY,
        }
    }

    /// Un-jittered delay after the given (0-based) failed attempt.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay in `[ceiling / 2, ceiling]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        let half = ceiling / 2;
        let spread = (ceiling - half).as_millis() as u64;
        half + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }

    /// Sleep before the next attempt.
    pub async fn backoff<C: Clock>(&self, clock: &C, attempt: u32, what: &str) {
        let wait = self.delay(attempt);
        log::warn!(
            "{what}. Waiting {:.1}s before retry {}/{}",
            wait.as_secs_f64(),
            attempt + 1,
            self.max_attempts - 1
        );
        clock.sleep(wait).await;
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ManualClock;

    #[tokio::test]
    async fn test_no_window_exceeds_limit() {
        let clock = ManualClock::at(2025, 1, 1);
        let mut limiter = RateLimiter::new(120, clock.clone());

        let mut stamps = Vec::new();
        for _ in 0..200 {
            limiter.acquire().await;
            stamps.push(clock.now());
        }

        assert_eq!(stamps.len(), 200);
        let window = chrono::Duration::seconds(60);
        for (i, start) in stamps.iter().enumerate() {
            let in_window = stamps[i..]
                .iter()
                .take_while(|t| **t - *start < window)
                .count();
            assert!(in_window <= 120, "window starting at #{i} holds {in_window}");
        }
        // The 121st request had to wait for the first to age out.
        assert!(stamps[120] - stamps[0] >= window);
    }

    #[tokio::test]
    async fn test_under_limit_does_not_sleep() {
        let clock = ManualClock::at(2025, 1, 1);
        let mut limiter = RateLimiter::new(10, clock.clone());
        for _ in 0..10 {
            limiter.acquire().await;
        }
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_slots_free_up_as_time_advances() {
        let clock = ManualClock::at(2025, 1, 1);
        let mut limiter = RateLimiter::new(2, clock.clone());
        limiter.acquire().await;
        clock.advance(Duration::from_secs(30));
        limiter.acquire().await;
        clock.advance(Duration::from_secs(31));
        // First slot has aged out; no wait needed.
        limiter.acquire().await;
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn test_backoff_ceiling_doubles_and_caps() {
        let policy = RetryPolicy::new(5);
        assert_eq!(policy.ceiling(0), Duration::from_secs(1));
        assert_eq!(policy.ceiling(1), Duration::from_secs(2));
        assert_eq!(policy.ceiling(4), Duration::from_secs(16));
        assert_eq!(policy.ceiling(6), Duration::from_secs(60));
        assert_eq!(policy.ceiling(40), Duration::from_secs(60));
    }

    #[test]
    fn test_jittered_delay_within_bounds() {
        let policy = RetryPolicy::new(5);
        for attempt in 0..8 {
            let ceiling = policy.ceiling(attempt);
            for _ in 0..20 {
                let d = policy.delay(attempt);
                assert!(d >= ceiling / 2 && d <= ceiling, "{d:?} vs {ceiling:?}");
            }
        }
    }
}
