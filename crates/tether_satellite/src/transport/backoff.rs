//! Reconnect backoff.

use crate::config::BackoffConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Delay schedule for consecutive connection failures.
///
/// Delays grow exponentially with jitter, never exceed the configured
/// maximum and never shrink until [`reset`](Self::reset) is called.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    last: Duration,
    rng: StdRng,
}

impl Backoff {
    /// Creates a backoff seeded from the OS.
    pub fn new(config: BackoffConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Creates a backoff with a fixed jitter seed.
    pub fn with_seed(config: BackoffConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: BackoffConfig, rng: StdRng) -> Self {
        Self {
            config,
            attempt: 0,
            last: Duration::ZERO,
            rng,
        }
    }

    /// Consecutive failures recorded since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Records a failure and returns the delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let base = self.config.base_delay(self.attempt);
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let extra = if jitter > 0.0 {
            base.mul_f64(self.rng.gen_range(0.0..=jitter))
        } else {
            Duration::ZERO
        };
        let delay = (base + extra).min(self.config.max_delay).max(self.last);
        self.last = delay;
        delay
    }

    /// Starts over after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }
}
