use thiserror::Error;

use pyrolysis_contracts::queue::QueueError;
use pyrolysis_contracts::store::StoreError;
use pyrolysis_model::RunId;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Run {run_id} cannot accept this ingestion: {reason}")]
    RunConflict { run_id: RunId, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
