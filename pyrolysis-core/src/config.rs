//! Engine configuration types.
//!
//! All fields carry defaults so a deployment can supply a partial payload and
//! inherit the rest.

use serde::{Deserialize, Serialize};

use pyrolysis_model::DEFAULT_GOOGLE_ZOOM;

use crate::error::{CoreError, Result};

/// Longest lease a worker may be granted (one week).
pub const MAX_LEASE_TTL_SECS: i64 = 7 * 24 * 60 * 60;

/// Knobs shared by the dispatcher and every worker.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Lease length and renewal thresholds.
    pub lease: LeaseConfig,
    /// Retry budget and redrive backoff.
    pub retry: RetryConfig,
    /// Ingestion batching and row defaults.
    pub ingest: IngestConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lease.lease_ttl_secs <= 0 {
            return Err(CoreError::InvalidConfig(
                "lease.lease_ttl_secs must be positive".into(),
            ));
        }
        if self.lease.lease_ttl_secs > MAX_LEASE_TTL_SECS {
            return Err(CoreError::InvalidConfig(format!(
                "lease.lease_ttl_secs must be <= {MAX_LEASE_TTL_SECS}"
            )));
        }
        if !(0.0..=1.0).contains(&self.lease.renew_at_fraction) {
            return Err(CoreError::InvalidConfig(
                "lease.renew_at_fraction must be within 0..=1".into(),
            ));
        }
        if self.retry.backoff_max_ms < self.retry.backoff_base_ms {
            return Err(CoreError::InvalidConfig(
                "retry.backoff_max_ms must be >= retry.backoff_base_ms".into(),
            ));
        }
        if self.ingest.enqueue_batch_size == 0 {
            return Err(CoreError::InvalidConfig(
                "ingest.enqueue_batch_size must be at least 1".into(),
            ));
        }
        if self.ingest.default_google_zoom > pyrolysis_model::MAX_ZOOM {
            return Err(CoreError::InvalidConfig(format!(
                "ingest.default_google_zoom must be <= {}",
                pyrolysis_model::MAX_ZOOM
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Lease TTL granted on claim and renewal (seconds)
    pub lease_ttl_secs: i64,
    /// Renew when remaining TTL drops below this fraction of the TTL
    pub renew_at_fraction: f32,
    /// Minimum margin before expiry to trigger a renewal regardless of fraction (ms)
    pub renew_min_margin_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 900,
            renew_at_fraction: 0.5,
            renew_min_margin_ms: 2_000,
        }
    }
}

impl LeaseConfig {
    pub fn lease_ttl(&self) -> Result<chrono::Duration> {
        chrono::Duration::try_seconds(self.lease_ttl_secs).ok_or_else(|| {
            CoreError::InvalidConfig(format!(
                "lease.lease_ttl_secs {} is out of range",
                self.lease_ttl_secs
            ))
        })
    }

    /// Whether a lease with `remaining` time left should be renewed before
    /// the next external call.
    pub fn should_renew(&self, remaining: chrono::Duration) -> bool {
        let ttl_ms = self.lease_ttl_secs.saturating_mul(1_000) as f64;
        let threshold_ms = (ttl_ms * f64::from(self.renew_at_fraction))
            .max(self.renew_min_margin_ms as f64);
        (remaining.num_milliseconds() as f64) < threshold_ms
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Claims allowed after the first; a job is attempted at most
    /// `max_retries + 1` times.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Percentage-based jitter to spread out retries.
    pub jitter_ratio: f32,
    /// Minimum jitter in milliseconds so short delays still randomise a bit.
    pub jitter_min_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 2_000,
            backoff_max_ms: 5 * 60 * 1_000,
            jitter_ratio: 0.25,
            jitter_min_ms: 250,
        }
    }
}

impl RetryConfig {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Messages per queue batch send.
    pub enqueue_batch_size: usize,
    /// Zoom applied to lat/lon rows that omit one.
    pub default_google_zoom: u8,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            enqueue_batch_size: 10,
            default_google_zoom: DEFAULT_GOOGLE_ZOOM,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_payload_inherits_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"retry":{"max_retries":5}}"#)
                .expect("config");
        assert_eq!(cfg.retry.max_retries, 5);
        assert_eq!(cfg.retry.backoff_base_ms, 2_000);
        assert_eq!(cfg.lease.lease_ttl_secs, 900);
        assert_eq!(cfg.ingest.enqueue_batch_size, 10);
        cfg.validate().expect("valid");
    }

    #[test]
    fn renewal_threshold_uses_fraction_and_margin() {
        let lease = LeaseConfig {
            lease_ttl_secs: 10,
            renew_at_fraction: 0.5,
            renew_min_margin_ms: 2_000,
        };
        assert!(!lease.should_renew(chrono::Duration::seconds(6)));
        assert!(lease.should_renew(chrono::Duration::seconds(4)));

        let tight = LeaseConfig {
            renew_at_fraction: 0.0,
            ..lease
        };
        assert!(tight.should_renew(chrono::Duration::milliseconds(1_500)));
        assert!(!tight.should_renew(chrono::Duration::seconds(3)));
    }

    #[test]
    fn lease_ttl_is_bounded() {
        let mut cfg = EngineConfig::default();
        cfg.lease.lease_ttl_secs = i64::MAX / 2;
        assert!(matches!(cfg.validate(), Err(CoreError::InvalidConfig(_))));
        assert!(cfg.lease.lease_ttl().is_err());

        cfg.lease.lease_ttl_secs = MAX_LEASE_TTL_SECS;
        cfg.validate().expect("one week is allowed");
        assert_eq!(
            cfg.lease.lease_ttl().expect("ttl"),
            chrono::Duration::days(7)
        );
    }

    #[test]
    fn rejects_zero_batch_size() {
        let mut cfg = EngineConfig::default();
        cfg.ingest.enqueue_batch_size = 0;
        assert!(matches!(cfg.validate(), Err(CoreError::InvalidConfig(_))));
    }
}
