//! External work performed on behalf of a tile.

use async_trait::async_trait;
use thiserror::Error;

use pyrolysis_model::{ArtifactRef, Service, TileCoordinates};

/// Everything that can go wrong outside the engine. The classifier maps each
/// variant to exactly one error class and code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorFailure {
    #[error("{service} returned HTTP {status}: {message}")]
    Http {
        service: Service,
        status: u16,
        message: String,
    },

    #[error("{service} request timed out")]
    Timeout { service: Service },

    #[error("{service} connection failed: {message}")]
    Network { service: Service, message: String },

    /// Missing or malformed credentials detected before a request was sent.
    #[error("{service} credentials rejected: {message}")]
    Auth { service: Service, message: String },

    #[error("{service} returned an unusable response: {message}")]
    BadResponse { service: Service, message: String },

    #[error("invalid tile input: {message}")]
    Validation { message: String },

    #[error("artifact write failed: {message}")]
    ArtifactPut { message: String },

    #[error("artifact read failed: {message}")]
    ArtifactGet { message: String },

    #[error("{message}")]
    Other { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub label: String,
    pub confidence: f32,
    pub reasoning: Option<String>,
}

#[async_trait]
pub trait ImageryFetcher: Send + Sync {
    async fn fetch(
        &self,
        coordinates: &TileCoordinates,
    ) -> Result<Vec<u8>, CollaboratorFailure>;
}

#[async_trait]
pub trait VisionClassifier: Send + Sync {
    async fn classify(
        &self,
        image: &[u8],
    ) -> Result<Classification, CollaboratorFailure>;
}

/// Blob store for fetched imagery.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
    ) -> Result<ArtifactRef, CollaboratorFailure>;

    async fn get(
        &self,
        artifact: &ArtifactRef,
    ) -> Result<Vec<u8>, CollaboratorFailure>;
}
