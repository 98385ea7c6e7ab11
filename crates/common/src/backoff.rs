use std::{
    cmp,
    time::Duration,
};

use rand::Rng;

/// Exponential backoff. `fail` doubles the delay on every consecutive
/// failure, capped at `max_backoff`. With jitter enabled the returned delay is
/// drawn uniformly from `[0, delay)`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial_backoff: Duration,
    max_backoff: Duration,
    num_failures: u32,
    jitter: bool,
}

impl Backoff {
    pub fn new(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff,
            num_failures: 0,
            jitter: true,
        }
    }

    /// Deterministic variant: `initial * 2^n`, capped. The GitHub client uses
    /// this so that its schedule is exactly 1s, 2s, 4s.
    pub fn without_jitter(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            jitter: false,
            ..Self::new(initial_backoff, max_backoff)
        }
    }

    pub fn reset(&mut self) {
        self.num_failures = 0;
    }

    pub fn fail(&mut self, rng: &mut impl Rng) -> Duration {
        // See https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/
        let p = 2u32.checked_pow(self.num_failures).unwrap_or(u32::MAX);
        self.num_failures = self.num_failures.saturating_add(1);
        let backoff = self
            .initial_backoff
            .checked_mul(p)
            .unwrap_or(self.max_backoff);
        let backoff = cmp::min(backoff, self.max_backoff);
        if self.jitter {
            backoff.mul_f32(rng.random::<f32>())
        } else {
            backoff
        }
    }

    pub fn failures(&self) -> u32 {
        self.num_failures
    }
}
