//! Job-claiming and state-management engine for the Pyrolysis tile pipeline.
//!
//! Many stateless workers pull tile job messages from an at-least-once queue.
//! They agree on ownership through leases written with conditional updates,
//! retry transient failures within a bounded budget, and roll terminal tile
//! outcomes up into run status. The store is the only shared state.
//!
//! Layout:
//! - [`classifier`]: failure -> class + stable code
//! - [`tile_state`]: lifecycle rules as conditions and updates
//! - [`lease`]: claim / renew / release
//! - [`aggregator`]: run counters and completion
//! - [`dispatcher`]: ingestion
//! - [`worker`]: per-message control loop
//! - [`infra`]: in-memory and Postgres backends

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod aggregator;
pub mod artifacts;
pub mod backoff;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod infra;
pub mod lease;
pub mod tile_state;
pub mod worker;

pub use aggregator::{RunAggregator, TallyOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, IngestConfig, LeaseConfig, RetryConfig};
pub use dispatcher::{
    IngestRow, IngestionDispatcher, IngestionReport, IngestionRequest,
    RejectedRow,
};
pub use engine::Engine;
pub use error::{CoreError, Result};
pub use lease::{ClaimOutcome, LeaseProtocol, ReleaseOutcome, TileLease};
pub use worker::{Collaborators, Disposition, WorkerOrchestrator};

pub use pyrolysis_contracts as contracts;
pub use pyrolysis_model as model;
