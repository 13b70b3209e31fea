use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use pyrolysis_model::{TileId, TileJobMessage};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("queue rejected the request: {0}")]
    Rejected(String),

    #[error("queue payload could not be encoded: {0}")]
    Serialization(String),
}

/// One entry of a batch that the queue did not accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSendFailure {
    pub tile_id: TileId,
    /// The queue blamed the payload rather than itself.
    pub sender_fault: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSendReport {
    pub sent: usize,
    pub failures: Vec<BatchSendFailure>,
}

/// Producer side of the tile job queue. Delivery is at-least-once and
/// unordered.
#[async_trait]
pub trait TileQueue: Send + Sync {
    /// Upper bound on entries per `send_message_batch` call.
    fn max_batch_size(&self) -> usize {
        10
    }

    async fn send_message(
        &self,
        message: &TileJobMessage,
        delay: Duration,
    ) -> Result<(), QueueError>;

    /// Sends up to [`max_batch_size`](Self::max_batch_size) messages.
    /// Per-entry rejections are reported, not raised; an `Err` means nothing
    /// is known to have been sent.
    async fn send_message_batch(
        &self,
        messages: &[TileJobMessage],
    ) -> Result<BatchSendReport, QueueError>;
}
