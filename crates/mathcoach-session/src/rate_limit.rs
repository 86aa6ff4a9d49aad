//! Sliding-window admission control for answer submissions.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

/// Admits at most `max_calls` submissions in any trailing `window`.
///
/// Timestamps older than the window are evicted lazily on each check.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_calls: usize,
    window: Duration,
    calls: VecDeque<Instant>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::from_config(&RateLimitConfig::default())
    }
}

impl RateLimiter {
    /// Creates a limiter admitting `max_calls` per `window`.
    #[must_use]
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self {
            max_calls,
            window,
            calls: VecDeque::with_capacity(max_calls),
        }
    }

    /// Creates a limiter from the `rateLimit` configuration section.
    #[must_use]
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_calls, Duration::from_millis(config.window_ms))
    }

    /// Checks and records a submission at the current instant.
    pub fn is_allowed(&mut self) -> bool {
        self.is_allowed_at(Instant::now())
    }

    /// Checks and records a submission at `now`.
    ///
    /// A rejected submission is not recorded.
    pub fn is_allowed_at(&mut self, now: Instant) -> bool {
        self.evict(now);
        if self.calls.len() >= self.max_calls {
            return false;
        }
        self.calls.push_back(now);
        true
    }

    /// Submissions still admissible in the current window.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.remaining_at(Instant::now())
    }

    /// Submissions still admissible at `now`, without recording anything.
    #[must_use]
    pub fn remaining_at(&self, now: Instant) -> usize {
        let live = self.calls.iter().filter(|&&at| !self.expired(at, now)).count();
        self.max_calls.saturating_sub(live)
    }

    /// Time until the next submission would be admitted at `now`.
    ///
    /// Zero when a submission is admissible right away.
    #[must_use]
    pub fn retry_after_at(&self, now: Instant) -> Duration {
        if self.remaining_at(now) > 0 {
            return Duration::ZERO;
        }
        self.calls
            .iter()
            .find(|&&at| !self.expired(at, now))
            .map_or(Duration::ZERO, |&oldest| {
                (oldest + self.window).saturating_duration_since(now)
            })
    }

    /// Forgets every recorded submission.
    pub fn reset(&mut self) {
        self.calls.clear();
    }

    fn expired(&self, at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(at) >= self.window
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&oldest) = self.calls.front() {
            if !self.expired(oldest, now) {
                break;
            }
            self.calls.pop_front();
        }
    }
}
