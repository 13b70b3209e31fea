//! # Pyrolysis worker
//!
//! Entry point for the tile pipeline worker. `simulate` ingests a local
//! coordinate file and drives it through the full claim / retry / aggregate
//! cycle against in-memory backends; `config` prints the resolved worker
//! configuration.

mod input;
mod simulate;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, anyhow};
use clap::{Args as ClapArgs, Parser, Subcommand};
use sha2::{Digest, Sha256};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pyrolysis_config::{ConfigLoad, ConfigLoader};
use pyrolysis_core::model::{RunId, SchemaKind, SourceRef};

use crate::input::parse_input;
use crate::simulate::{SimulationOptions, with_system_clock};

#[derive(Parser, Debug)]
#[command(name = "pyrolysis-worker")]
#[command(about = "Tile job worker for the Pyrolysis imagery pipeline")]
struct Cli {
    /// Worker config file (TOML or JSON). Environment overrides still apply.
    #[arg(long, global = true, env = "PYROLYSIS_CONFIG_FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a coordinate file through the pipeline locally.
    Simulate(SimulateArgs),
    /// Print the resolved worker configuration as JSON.
    Config,
}

#[derive(ClapArgs, Debug, Clone)]
struct SimulateArgs {
    /// Coordinate file: `z,x,y[,region]` or `lat,lon[,zoom]` rows.
    #[arg(long)]
    input: PathBuf,

    /// Schema for headerless input (`mapbox` or `google`).
    #[arg(long)]
    schema: Option<String>,

    /// Explicit run id. Derived from the input when omitted.
    #[arg(long)]
    run_id: Option<String>,

    /// Bucket name recorded in the source reference.
    #[arg(long, default_value = "local")]
    source_bucket: String,

    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Fraction of external calls failing with a retryable error.
    #[arg(long, default_value_t = 0.0)]
    transient_failure_rate: f64,

    /// Fraction of external calls failing permanently.
    #[arg(long, default_value_t = 0.0)]
    permanent_failure_rate: f64,

    /// Added latency per synthetic external call (ms).
    #[arg(long, default_value_t = 0)]
    latency_ms: u64,

    /// Seed for reproducible failure injection.
    #[arg(long)]
    seed: Option<u64>,

    /// Queue visibility timeout (seconds).
    #[arg(long, default_value_t = 30)]
    visibility_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let ConfigLoad {
        config,
        source,
        overrides,
    } = {
        let loader = ConfigLoader::from_env();
        let loader = match cli.config.clone() {
            Some(path) => loader.path(path),
            None => loader,
        };
        loader.load().context("failed to load worker configuration")?
    };
    info!(source = ?source, overrides = overrides.len(), "configuration ready");

    match cli.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Simulate(args) => {
            let hint = match args.schema.as_deref() {
                Some(raw) => Some(
                    SchemaKind::parse_hint(raw)
                        .ok_or_else(|| anyhow!("unknown schema {raw:?}"))?,
                ),
                None => None,
            };

            let contents = tokio::fs::read_to_string(&args.input)
                .await
                .with_context(|| {
                    format!("failed to read {}", args.input.display())
                })?;
            let parsed = parse_input(
                &contents,
                hint,
                config.engine.ingest.default_google_zoom,
            )
            .with_context(|| {
                format!("cannot detect the layout of {}", args.input.display())
            })?;

            let source = SourceRef {
                bucket: args.source_bucket.clone(),
                key: args.input.display().to_string(),
                version: Some(content_version(&contents)),
            };
            let run_id = match args.run_id.as_deref() {
                Some(raw) => RunId::new(raw),
                None => RunId::derive(&source),
            };
            info!(
                %run_id,
                schema = %parsed.schema_kind,
                rows = parsed.rows.len(),
                "starting simulation"
            );

            let simulation = with_system_clock(
                config.engine.clone(),
                &config.artifact_bucket,
                SimulationOptions {
                    workers: args.workers,
                    transient_rate: args.transient_failure_rate,
                    permanent_rate: args.permanent_failure_rate,
                    latency: Duration::from_millis(args.latency_ms),
                    seed: args.seed,
                    visibility: Duration::from_secs(args.visibility_secs),
                    idle_poll: Duration::from_millis(25),
                    request_timeout: config.request_timeout(),
                },
            )?;
            let summary = simulation
                .run(run_id, parsed.schema_kind, Some(source), parsed.rows)
                .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
    }
}

/// Stand-in for an object version, so editing the file yields a new run id.
fn content_version(contents: &str) -> String {
    let digest = Sha256::digest(contents.as_bytes());
    hex::encode(&digest[..8])
}
