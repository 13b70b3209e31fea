use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use pyrolysis_core::EngineConfig;

use crate::error::ConfigError;

/// Where the file/inline layer of a configuration came from. Environment
/// overrides are applied on top of every source.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

/// Everything a worker process needs, resolved once at start-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Lease, retry and ingestion tuning shared by every worker.
    pub engine: EngineConfig,
    /// Postgres URL for the record store. Unset means in-memory.
    pub database_url: Option<String>,
    pub runs_table: String,
    pub tile_jobs_table: String,
    /// Tile job queue endpoint. Unset means in-memory.
    pub queue_url: Option<String>,
    /// Bucket that receives fetched imagery.
    pub artifact_bucket: String,
    /// Secret store entry holding the imagery and vision API keys.
    pub secrets_id: Option<String>,
    /// Per-request timeout for external calls (seconds).
    pub request_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            database_url: None,
            runs_table: "pyrolysis_runs".into(),
            tile_jobs_table: "pyrolysis_tile_jobs".into(),
            queue_url: None,
            artifact_bucket: "pyrolysis-artifacts".into(),
            secrets_id: None,
            request_timeout_secs: 30,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_secs must be positive".into(),
            ));
        }
        // A single request may not outlive the lease it runs under.
        let ttl = self.engine.lease.lease_ttl_secs.unsigned_abs();
        if self.request_timeout_secs >= ttl {
            return Err(ConfigError::Invalid(format!(
                "request_timeout_secs ({}) must be shorter than lease_ttl_secs ({ttl})",
                self.request_timeout_secs
            )));
        }
        for (field, value) in [
            ("runs_table", &self.runs_table),
            ("tile_jobs_table", &self.tile_jobs_table),
            ("artifact_bucket", &self.artifact_bucket),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "{field} must not be empty"
                )));
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        WorkerConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn timeout_must_fit_inside_lease() {
        let mut config = WorkerConfig::default();
        config.engine.lease.lease_ttl_secs = 20;
        config.request_timeout_secs = 20;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn partial_payload_inherits_defaults() {
        let config: WorkerConfig = serde_json::from_str(
            r#"{"artifact_bucket":"imagery","engine":{"retry":{"max_retries":5}}}"#,
        )
        .expect("partial config");
        assert_eq!(config.artifact_bucket, "imagery");
        assert_eq!(config.engine.retry.max_retries, 5);
        assert_eq!(config.engine.lease.lease_ttl_secs, 900);
        assert_eq!(config.runs_table, "pyrolysis_runs");
    }
}
