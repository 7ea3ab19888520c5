//! Sliding-window rate limiter shared by every external call site.
//!
//! The limiter keeps the timestamps of granted calls for the trailing window.
//! A slot is granted only while fewer than `max_calls` timestamps are inside
//! the window; the check and the insert happen under one lock so concurrent
//! acquirers can never exceed the ceiling together.
//!
//! Time comes from an injected [`Clock`] so tests drive the window with a
//! [`ManualClock`] instead of sleeping.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::error::RateLimitExceeded;

/// Monotonic time source.
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary fixed origin.
    fn now(&self) -> Duration;

    /// Block the calling thread for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Production clock backed by [`Instant`] and `thread::sleep`.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Deterministic clock for tests. `sleep` advances time instantly.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
    slept: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        *lock(&self.now) += by;
    }

    /// Total time spent in `sleep` so far.
    pub fn total_slept(&self) -> Duration {
        *lock(&self.slept)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *lock(&self.now)
    }

    fn sleep(&self, duration: Duration) {
        *lock(&self.slept) += duration;
        self.advance(duration);
    }
}

pub struct RateLimiter {
    max_calls: usize,
    window: Duration,
    default_max_wait: Duration,
    clock: Arc<dyn Clock>,
    granted: Mutex<VecDeque<Duration>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_calls", &self.max_calls)
            .field("window", &self.window)
            .field("default_max_wait", &self.default_max_wait)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_calls: config.max_calls.max(1),
            window: config.window,
            default_max_wait: config.default_max_wait,
            clock,
            granted: Mutex::new(VecDeque::with_capacity(config.max_calls)),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Waits up to the configured default for a call slot.
    pub fn acquire(&self) -> Result<(), RateLimitExceeded> {
        self.acquire_within(self.default_max_wait)
    }

    /// Waits up to `max_wait` for a call slot.
    ///
    /// Fails immediately, without sleeping, when the next slot opens later
    /// than the remaining wait budget.
    pub fn acquire_within(&self, max_wait: Duration) -> Result<(), RateLimitExceeded> {
        let mut waited = Duration::ZERO;

        loop {
            let wait = match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(RateLimitExceeded { retry_after }) => retry_after,
            };

            if waited + wait > max_wait {
                warn!(
                    retry_after = ?wait,
                    waited = ?waited,
                    max_wait = ?max_wait,
                    "rate limit wait budget exhausted"
                );
                return Err(RateLimitExceeded { retry_after: wait });
            }

            debug!(wait = ?wait, "waiting for rate limit slot");
            self.clock.sleep(wait);
            waited += wait;
        }
    }

    /// Grants a slot if one is free right now.
    pub fn try_acquire(&self) -> Result<(), RateLimitExceeded> {
        let now = self.clock.now();
        let mut granted = lock(&self.granted);
        self.expire(&mut granted, now);

        if granted.len() < self.max_calls {
            granted.push_back(now);
            return Ok(());
        }

        // The window is full, so the front entry exists.
        let oldest = granted.front().copied().unwrap_or(now);
        Err(RateLimitExceeded {
            retry_after: (oldest + self.window).saturating_sub(now),
        })
    }

    /// Number of calls granted within the trailing window.
    pub fn in_window(&self) -> usize {
        let now = self.clock.now();
        let mut granted = lock(&self.granted);
        self.expire(&mut granted, now);
        granted.len()
    }

    fn expire(&self, granted: &mut VecDeque<Duration>, now: Duration) {
        while let Some(&oldest) = granted.front() {
            if oldest + self.window <= now {
                granted.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Locks a mutex, recovering the data if a holder panicked.
///
/// Every critical section here leaves the protected value consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_calls: usize, clock: Arc<ManualClock>) -> RateLimiter {
        let config = RateLimitConfig {
            max_calls,
            window: Duration::from_secs(60),
            default_max_wait: Duration::from_secs(120),
        };
        RateLimiter::new(&config, clock)
    }

    #[test]
    fn test_grants_up_to_ceiling_then_rejects() {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter(35, clock.clone());

        for _ in 0..35 {
            assert!(limiter.try_acquire().is_ok());
        }
        let err = limiter.try_acquire().unwrap_err();
        assert_eq!(err.retry_after, Duration::from_secs(60));
        assert_eq!(limiter.in_window(), 35);
    }

    #[test]
    fn test_slot_frees_when_oldest_ages_out() {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter(2, clock.clone());

        limiter.try_acquire().expect("first");
        clock.advance(Duration::from_secs(10));
        limiter.try_acquire().expect("second");

        clock.advance(Duration::from_secs(49));
        assert_eq!(
            limiter.try_acquire().unwrap_err().retry_after,
            Duration::from_secs(1)
        );

        clock.advance(Duration::from_secs(1));
        assert!(limiter.try_acquire().is_ok());
    }

    #[test]
    fn test_acquire_sleeps_until_slot_opens() {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter(1, clock.clone());

        limiter.acquire().expect("first");
        clock.advance(Duration::from_secs(15));
        limiter.acquire().expect("second after waiting");

        assert_eq!(clock.total_slept(), Duration::from_secs(45));
        assert_eq!(clock.now(), Duration::from_secs(60));
    }

    #[test]
    fn test_acquire_within_fails_fast_when_budget_too_small() {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter(1, clock.clone());

        limiter.acquire().expect("first");
        let err = limiter
            .acquire_within(Duration::from_secs(2))
            .unwrap_err();

        assert_eq!(err.retry_after, Duration::from_secs(60));
        assert_eq!(clock.total_slept(), Duration::ZERO);
    }

    #[test]
    fn test_zero_wait_is_non_blocking() {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter(1, clock.clone());

        assert!(limiter.acquire_within(Duration::ZERO).is_ok());
        assert!(limiter.acquire_within(Duration::ZERO).is_err());
    }
}
