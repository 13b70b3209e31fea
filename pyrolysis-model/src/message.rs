use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{RunId, TileId, TileJobKey};

/// Queue payload naming one tile job. Carries identity only; the record in
/// the store is the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileJobMessage {
    pub run_id: RunId,
    pub tile_id: TileId,
    pub enqueued_at: DateTime<Utc>,
}

impl TileJobMessage {
    pub fn new(key: TileJobKey, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            run_id: key.run_id,
            tile_id: key.tile_id,
            enqueued_at,
        }
    }

    pub fn key(&self) -> TileJobKey {
        TileJobKey::new(self.run_id.clone(), self.tile_id.clone())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
