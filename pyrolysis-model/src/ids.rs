use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::run::SourceRef;

const DERIVED_RUN_ID_HEX_LEN: usize = 12;

/// Identifier of one ingestion batch.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Deterministic id for a source object, so re-ingesting the same input
    /// lands on the same run.
    pub fn derive(source: &SourceRef) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source.bucket.as_bytes());
        hasher.update(b":");
        hasher.update(source.key.as_bytes());
        hasher.update(b":");
        hasher.update(source.version.as_deref().unwrap_or("").as_bytes());
        let digest = hex::encode(hasher.finalize());
        Self(format!("run_{}", &digest[..DERIVED_RUN_ID_HEX_LEN]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tile identifier derived from normalized coordinates.
///
/// Built through [`crate::TileCoordinates::tile_id`]; `from_raw` exists for
/// values read back from queue payloads and storage.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TileId(String);

impl TileId {
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Composite key of a tile job record.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TileJobKey {
    pub run_id: RunId,
    pub tile_id: TileId,
}

impl TileJobKey {
    pub fn new(run_id: RunId, tile_id: TileId) -> Self {
        Self { run_id, tile_id }
    }
}

impl fmt::Display for TileJobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.run_id, self.tile_id)
    }
}

/// Opaque token naming one worker invocation. A fresh token is minted for
/// every inbound message, so a redelivered message never inherits a lease.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerToken(pub Uuid);

impl Default for WorkerToken {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerToken {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for WorkerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_run_id_is_stable_and_prefixed() {
        let source = SourceRef {
            bucket: "inputs".into(),
            key: "batches/north.csv".into(),
            version: Some("etag-1".into()),
        };
        let first = RunId::derive(&source);
        let second = RunId::derive(&source.clone());
        assert_eq!(first, second);
        assert!(first.as_str().starts_with("run_"));
        assert_eq!(first.as_str().len(), 4 + DERIVED_RUN_ID_HEX_LEN);

        let changed = SourceRef {
            version: Some("etag-2".into()),
            ..source
        };
        assert_ne!(RunId::derive(&changed), first);
    }

    #[test]
    fn worker_tokens_are_unique() {
        assert_ne!(WorkerToken::new(), WorkerToken::new());
    }
}
