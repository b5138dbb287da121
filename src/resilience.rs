// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry and backoff for replication against an intermittently reachable store.
//!
//! [`RetryConfig`] computes exponential, capped, jittered delays. Jitter keeps
//! two replicas that lost the network at the same moment from reconnecting
//! in lockstep. The same type paces local SQLite busy retries, with a much
//! tighter schedule.
//!
//! ```rust
//! use docsync::resilience::RetryConfig;
//!
//! let retry = RetryConfig::live();
//! assert!(retry.should_retry(10_000));
//! assert!(retry.jittered_delay(3) <= retry.max_delay);
//! ```

use rand::Rng;
use std::time::Duration;

/// Backoff schedule plus an attempt ceiling.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts before giving up. `usize::MAX` means retry until stopped.
    pub max_attempts: usize,

    /// Delay after the first failure.
    pub initial_delay: Duration,

    /// Ceiling for exponential backoff.
    pub max_delay: Duration,

    /// Growth per failure (2.0 doubles the delay).
    pub backoff_factor: f64,

    /// Fraction of each delay that is randomized (0.0 = none, 0.5 = ±50%).
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::one_shot()
    }
}

impl RetryConfig {
    /// Live replication: a field device may be offline for hours, so the
    /// replicator keeps trying and resumes once the remote answers.
    ///
    /// ```text
    /// Failure  Delay (before jitter)
    /// -------  -----
    /// 1        1s
    /// 2        2s
    /// 3        4s
    /// ...
    /// 7+       60s, until stopped
    /// ```
    pub fn live() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            jitter: 0.2,
        }
    }

    /// One-shot replication: a handful of attempts, then report the error.
    pub fn one_shot() -> Self {
        Self {
            max_attempts: 5,
            ..Self::live()
        }
    }

    /// Local SQLite write-lock contention. Short, bounded, no jitter.
    ///
    /// ```text
    /// Failure  Delay
    /// -------  -----
    /// 1        10ms
    /// 2        20ms
    /// 3        40ms
    /// 4        80ms, then give up
    /// ```
    pub fn sqlite_busy() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            jitter: 0.0,
        }
    }

    /// Whether another attempt is allowed after `failures` failed attempts.
    pub fn should_retry(&self, failures: usize) -> bool {
        failures < self.max_attempts
    }

    /// Delay after the `failures`-th failure (1-indexed), without jitter.
    pub fn delay_for_attempt(&self, failures: usize) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as usize) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// [`delay_for_attempt`](Self::delay_for_attempt) with jitter, never above `max_delay`.
    pub fn jittered_delay(&self, failures: usize) -> Duration {
        let base = self.delay_for_attempt(failures);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }

        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        Duration::from_secs_f64(base.as_secs_f64() * factor).min(self.max_delay)
    }
}
