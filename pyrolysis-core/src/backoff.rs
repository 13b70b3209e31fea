use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Exponential redrive delay with jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    config: RetryConfig,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// `base * 2^(attempt - 1)`, capped at `backoff_max_ms`.
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }

        let exp = attempt.saturating_sub(1).min(62) as i32;
        let scaled = (self.config.backoff_base_ms as f64) * 2f64.powi(exp);
        let capped = scaled.min(self.config.backoff_max_ms as f64);
        capped.max(0.0) as u64
    }

    pub fn jittered_delay_ms(&self, attempt: u32, rng: &mut impl Rng) -> u64 {
        let anchor = self.base_delay_ms(attempt);
        if anchor == 0 {
            return 0;
        }

        let max = self.config.backoff_max_ms.max(1) as f64;
        let jitter_ratio = f64::from(self.config.jitter_ratio.max(0.0));
        let spread = ((anchor as f64) * jitter_ratio)
            .max(self.config.jitter_min_ms as f64)
            .min(max);
        let lower = (anchor as f64 - spread).max(1.0);
        let upper = (anchor as f64 + spread).min(max).max(lower);

        rng.random_range(lower..=upper).round() as u64
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::rng();
        Duration::from_millis(self.jittered_delay_ms(attempt, &mut rng))
    }
}
