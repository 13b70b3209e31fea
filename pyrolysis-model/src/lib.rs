//! Core data model definitions shared across Pyrolysis crates.
//!
//! Two persisted records drive the pipeline: a [`Run`] per ingested batch and
//! a [`TileJob`] per tile. Everything else in this crate (identifiers,
//! coordinates, error codes, queue messages) exists to describe those two
//! records and the values that flow into them.

pub use ::chrono;

pub mod coordinates;
pub mod error;
pub mod error_code;
pub mod ids;
pub mod message;
pub mod run;
pub mod tile_job;

pub use coordinates::{
    COORD_TILE_ID_PRECISION, DEFAULT_GOOGLE_ZOOM, DetectedLayout, MAX_ZOOM,
    RowLayout, SchemaKind, TileCoordinates,
};
pub use error::RowError;
pub use error_code::{ErrorCode, Service};
pub use ids::{RunId, TileId, TileJobKey, WorkerToken};
pub use message::TileJobMessage;
pub use run::{Run, RunStatus, SourceRef, TileOutcome, TileTally};
pub use tile_job::{
    ArtifactRef, ErrorClass, TileError, TileJob, TileJobStatus, TileResult,
};
