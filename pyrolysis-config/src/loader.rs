use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::models::{ConfigSource, WorkerConfig};
use crate::util::{non_empty, parse_bool, parse_number};

pub const CONFIG_PATH_VAR: &str = "PYROLYSIS_CONFIG_PATH";
pub const CONFIG_JSON_VAR: &str = "PYROLYSIS_CONFIG_JSON";
pub const SKIP_DOTENV_VAR: &str = "PYROLYSIS_SKIP_DOTENV";

const DEFAULT_FILES: &[&str] = &[
    "pyrolysis.toml",
    "pyrolysis.json",
    "config/pyrolysis.toml",
    "config/pyrolysis.json",
];

/// Variables applied on top of whichever source produced the base config.
pub const OVERRIDE_VARS: &[&str] = &[
    "JOB_STALE_LOCK_SECONDS",
    "PIPELINE_MAX_RETRIES",
    "PIPELINE_REQUEST_TIMEOUT",
    "S3_BUCKET",
    "DDB_RUNS_TABLE",
    "DDB_TILEJOBS_TABLE",
    "PIPELINE_SECRETS_ID",
    "TILE_JOBS_QUEUE_URL",
    "DATABASE_URL",
];

/// Result of a load: the validated config, the source of its base layer and
/// the override variables that were applied.
#[derive(Debug, Clone)]
pub struct ConfigLoad {
    pub config: WorkerConfig,
    pub source: ConfigSource,
    pub overrides: Vec<&'static str>,
}

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Layered loader.
///
/// Evaluation order:
/// 1) `.env` in the working directory (process loader only),
/// 2) `$PYROLYSIS_CONFIG_PATH` (TOML or JSON file),
/// 3) `$PYROLYSIS_CONFIG_JSON` (inline JSON),
/// 4) `pyrolysis.{toml,json}` or `config/pyrolysis.{toml,json}` under the
///    search root,
/// 5) defaults.
///
/// Only the first of 2-5 that is present is used. Environment overrides from
/// [`OVERRIDE_VARS`] are then applied and the result is validated.
pub struct ConfigLoader {
    lookup: Lookup,
    root: PathBuf,
    dotenv: bool,
    path: Option<PathBuf>,
}

impl fmt::Debug for ConfigLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigLoader")
            .field("root", &self.root)
            .field("dotenv", &self.dotenv)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ConfigLoader {
    /// Loader over the process environment, rooted at the working directory.
    pub fn from_env() -> Self {
        Self {
            lookup: Box::new(|name| std::env::var(name).ok()),
            root: PathBuf::from("."),
            dotenv: true,
            path: None,
        }
    }

    /// Loader over an arbitrary variable source. Never touches `.env`.
    pub fn with_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            lookup: Box::new(lookup),
            root: PathBuf::from("."),
            dotenv: false,
            path: None,
        }
    }

    /// Directory that relative paths and default files resolve against.
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// File that replaces steps 2-5, e.g. from a `--config` flag.
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigError> {
        self.load_dotenv();

        let (mut config, source) = self.base()?;
        let overrides = self.apply_overrides(&mut config)?;
        config.validate()?;

        info!(
            source = ?source,
            overrides = ?overrides,
            lease_ttl_secs = config.engine.lease.lease_ttl_secs,
            max_retries = config.engine.retry.max_retries,
            "worker configuration loaded"
        );
        Ok(ConfigLoad {
            config,
            source,
            overrides,
        })
    }

    fn var(&self, name: &str) -> Option<String> {
        (self.lookup)(name).as_deref().and_then(non_empty)
    }

    fn load_dotenv(&self) {
        if !self.dotenv {
            return;
        }
        if self
            .var(SKIP_DOTENV_VAR)
            .and_then(|raw| parse_bool(&raw))
            .unwrap_or(false)
        {
            debug!("skipping .env");
            return;
        }
        match dotenvy::dotenv() {
            Ok(path) => debug!(path = %path.display(), "loaded .env"),
            Err(err) if err.not_found() => {}
            Err(err) => warn!(error = %err, "failed to load .env"),
        }
    }

    fn base(&self) -> Result<(WorkerConfig, ConfigSource), ConfigError> {
        if let Some(path) = &self.path {
            let path = self.resolve(path);
            let config = load_file(&path)?;
            return Ok((config, ConfigSource::File(path)));
        }

        if let Some(raw) = self.var(CONFIG_PATH_VAR) {
            let path = self.resolve(Path::new(&raw));
            let config = load_file(&path)?;
            return Ok((config, ConfigSource::EnvPath(path)));
        }

        if let Some(raw) = self.var(CONFIG_JSON_VAR) {
            let config = parse_json(&raw, CONFIG_JSON_VAR)?;
            return Ok((config, ConfigSource::EnvInline));
        }

        if let Some(path) = self.find_default_file() {
            let config = load_file(&path)?;
            return Ok((config, ConfigSource::File(path)));
        }

        Ok((WorkerConfig::default(), ConfigSource::Default))
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    fn find_default_file(&self) -> Option<PathBuf> {
        DEFAULT_FILES
            .iter()
            .map(|candidate| self.root.join(candidate))
            .find(|path| path.exists())
    }

    fn apply_overrides(
        &self,
        config: &mut WorkerConfig,
    ) -> Result<Vec<&'static str>, ConfigError> {
        let mut applied = Vec::new();
        for &name in OVERRIDE_VARS {
            let Some(raw) = self.var(name) else {
                continue;
            };
            match name {
                "JOB_STALE_LOCK_SECONDS" => {
                    config.engine.lease.lease_ttl_secs = parse_number(name, &raw)?;
                }
                "PIPELINE_MAX_RETRIES" => {
                    config.engine.retry.max_retries = parse_number(name, &raw)?;
                }
                "PIPELINE_REQUEST_TIMEOUT" => {
                    config.request_timeout_secs = parse_number(name, &raw)?;
                }
                "S3_BUCKET" => config.artifact_bucket = raw,
                "DDB_RUNS_TABLE" => config.runs_table = raw,
                "DDB_TILEJOBS_TABLE" => config.tile_jobs_table = raw,
                "PIPELINE_SECRETS_ID" => config.secrets_id = Some(raw),
                "TILE_JOBS_QUEUE_URL" => config.queue_url = Some(raw),
                "DATABASE_URL" => config.database_url = Some(raw),
                _ => continue,
            }
            applied.push(name);
        }
        Ok(applied)
    }
}

pub fn load_file(path: &Path) -> Result<WorkerConfig, ConfigError> {
    let contents =
        fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    let origin = path.display().to_string();

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => parse_json(&contents, &origin),
        Some("toml") | Some("tml") => parse_toml(&contents, &origin),
        _ => parse_from_str(&contents, &origin),
    }
}

/// Tries TOML first, then JSON.
pub fn parse_from_str(
    contents: &str,
    origin: &str,
) -> Result<WorkerConfig, ConfigError> {
    toml::from_str(contents).or_else(|toml_err| {
        serde_json::from_str(contents).map_err(|json_err| ConfigError::Parse {
            origin: origin.to_string(),
            message: format!("toml error: {toml_err}; json error: {json_err}"),
        })
    })
}

fn parse_toml(contents: &str, origin: &str) -> Result<WorkerConfig, ConfigError> {
    toml::from_str(contents).map_err(|err| ConfigError::Parse {
        origin: origin.to_string(),
        message: err.to_string(),
    })
}

fn parse_json(raw: &str, origin: &str) -> Result<WorkerConfig, ConfigError> {
    serde_json::from_str(raw).map_err(|err| ConfigError::Parse {
        origin: origin.to_string(),
        message: err.to_string(),
    })
}
