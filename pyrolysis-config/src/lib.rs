//! Configuration loading for Pyrolysis workers.
//!
//! A worker resolves its configuration once per process: engine knobs
//! (lease, retry, ingestion) plus deployment values such as the database URL,
//! table names, queue URL and artifact bucket. Sources are layered, with
//! environment variables applied last so a deployment can override a checked-in
//! file without editing it.

pub mod error;
pub mod loader;
pub mod models;
pub mod util;

pub use error::ConfigError;
pub use loader::{ConfigLoad, ConfigLoader};
pub use models::{ConfigSource, WorkerConfig};
