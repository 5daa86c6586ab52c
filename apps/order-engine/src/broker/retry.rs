//! Retry policy with exponential backoff for exchange adapter calls.
//!
//! Shared by the broker (order placement/cancellation) and the background
//! TWAP workers (per-slice retry). Retries apply only to the adapter call
//! itself, never to position or store bookkeeping, and every loop has a hard
//! attempt cap - there is no infinite retry.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy configuration for adapter calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first call (default: 3).
    pub max_attempts: u32,
    /// Initial backoff duration (default: 500ms).
    pub initial_backoff: Duration,
    /// Maximum backoff duration (default: 2s).
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth (default: 2.0).
    pub backoff_multiplier: f64,
    /// Jitter factor for randomization (default: 0.0 = deterministic).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with custom settings.
    #[must_use]
    pub const fn new(
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
        jitter_factor: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
            jitter_factor,
        }
    }

    /// Policy used by background TWAP slices (longer cap between attempts).
    #[must_use]
    pub const fn twap() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    /// Near-zero delays for tests that only count attempts.
    #[must_use]
    pub const fn fast() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }
}

/// Backoff sequence generator for one retried call.
#[derive(Debug)]
pub struct Backoff {
    current_attempt: u32,
    max_attempts: u32,
    initial_backoff_ms: u64,
    max_backoff_ms: u64,
    backoff_multiplier: f64,
    jitter_factor: f64,
}

impl Backoff {
    /// Create a backoff sequence from a retry policy.
    #[must_use]
    pub const fn new(policy: &RetryPolicy) -> Self {
        Self {
            current_attempt: 0,
            max_attempts: policy.max_attempts,
            initial_backoff_ms: policy.initial_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
            backoff_multiplier: policy.backoff_multiplier,
            jitter_factor: policy.jitter_factor,
        }
    }

    /// Next delay to sleep before retrying, or `None` once the attempt cap
    /// is reached.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.current_attempt >= self.max_attempts {
            return None;
        }

        let base = self.base_backoff_ms();
        let jittered = self.apply_jitter(base);
        let capped = jittered.min(self.max_backoff_ms);

        self.current_attempt += 1;

        Some(Duration::from_millis(capped))
    }

    /// Base delay `initial * multiplier^attempt`, capped.
    fn base_backoff_ms(&self) -> u64 {
        let multiplier = self.backoff_multiplier.powi(self.current_attempt as i32);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let backoff = (self.initial_backoff_ms as f64 * multiplier) as u64;
        backoff.min(self.max_backoff_ms)
    }

    /// Random value in `[backoff * (1 - jitter), backoff * (1 + jitter)]`.
    fn apply_jitter(&self, backoff_ms: u64) -> u64 {
        if self.jitter_factor <= 0.0 {
            return backoff_ms;
        }

        let mut rng = rand::rng();
        let range = backoff_ms as f64 * self.jitter_factor;
        let min = (backoff_ms as f64 - range).max(0.0);
        let max = backoff_ms as f64 + range;

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let jittered = rng.random_range(min..=max) as u64;
        jittered
    }

    /// Number of delays handed out so far.
    #[must_use]
    pub const fn current_attempt(&self) -> u32 {
        self.current_attempt
    }
}
