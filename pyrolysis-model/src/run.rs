use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coordinates::SchemaKind;
use crate::ids::{RunId, TileId};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Created,
    Ingesting,
    Processing,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed
                | RunStatus::CompletedWithErrors
                | RunStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Created => "CREATED",
            RunStatus::Ingesting => "INGESTING",
            RunStatus::Processing => "PROCESSING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
            RunStatus::Failed => "FAILED",
        }
    }
}

/// Where an ingestion batch came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub bucket: String,
    pub key: String,
    /// Object version or etag; part of the derived run id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Per-tile counting state kept on the run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TileTally {
    Pending,
    Succeeded,
    Failed,
}

/// Terminal outcome reported to the aggregator.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TileOutcome {
    Succeeded,
    Failed,
}

impl From<TileOutcome> for TileTally {
    fn from(outcome: TileOutcome) -> Self {
        match outcome {
            TileOutcome::Succeeded => TileTally::Succeeded,
            TileOutcome::Failed => TileTally::Failed,
        }
    }
}

/// One ingestion batch and its roll-up counters.
///
/// `tiles` records which tiles have already been counted. Counter changes and
/// the matching `tiles` entry are always written together in one conditional
/// update, which is what makes tallying idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub status: RunStatus,
    pub schema_kind: SchemaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceRef>,
    pub total_tiles: u64,
    pub succeeded_count: u64,
    pub failed_count: u64,
    pub pending_count: u64,
    #[serde(default)]
    pub tiles: BTreeMap<TileId, TileTally>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(
        run_id: RunId,
        schema_kind: SchemaKind,
        source: Option<SourceRef>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            status: RunStatus::Created,
            schema_kind,
            source,
            total_tiles: 0,
            succeeded_count: 0,
            failed_count: 0,
            pending_count: 0,
            tiles: BTreeMap::new(),
            failure_reason: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Adds tiles not yet known to the run as pending. Returns how many were
    /// new.
    pub fn register_tiles<'a>(
        &mut self,
        tiles: impl IntoIterator<Item = &'a TileId>,
    ) -> u64 {
        let mut added = 0;
        for tile in tiles {
            if !self.tiles.contains_key(tile) {
                self.tiles.insert(tile.clone(), TileTally::Pending);
                added += 1;
            }
        }
        self.total_tiles += added;
        self.pending_count += added;
        added
    }

    /// Moves a pending tile to its outcome. Returns `false` when the tile is
    /// unknown or already counted.
    pub fn record_tally(&mut self, tile: &TileId, outcome: TileOutcome) -> bool {
        let Some(tally) = self.tiles.get_mut(tile) else {
            return false;
        };
        if *tally != TileTally::Pending {
            return false;
        }
        *tally = outcome.into();
        self.pending_count = self.pending_count.saturating_sub(1);
        match outcome {
            TileOutcome::Succeeded => self.succeeded_count += 1,
            TileOutcome::Failed => self.failed_count += 1,
        }
        true
    }

    pub fn tally_of(&self, tile: &TileId) -> Option<TileTally> {
        self.tiles.get(tile).copied()
    }

    /// Status the run settles on once nothing is pending.
    pub fn final_status(&self) -> RunStatus {
        if self.failed_count == 0 {
            RunStatus::Completed
        } else {
            RunStatus::CompletedWithErrors
        }
    }

    pub fn counters_balanced(&self) -> bool {
        self.succeeded_count + self.failed_count + self.pending_count
            == self.total_tiles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> Run {
        Run::new(
            RunId::new("run_test"),
            SchemaKind::MapboxZxy,
            None,
            Utc::now(),
        )
    }

    #[test]
    fn registering_is_idempotent_per_tile() {
        let mut run = run();
        let a = TileId::from_raw("1/0/0");
        let b = TileId::from_raw("1/0/1");
        assert_eq!(run.register_tiles([&a, &b]), 2);
        assert_eq!(run.register_tiles([&a]), 0);
        assert_eq!(run.total_tiles, 2);
        assert_eq!(run.pending_count, 2);
        assert!(run.counters_balanced());
    }

    #[test]
    fn tally_counts_each_tile_once() {
        let mut run = run();
        let a = TileId::from_raw("1/0/0");
        let b = TileId::from_raw("1/0/1");
        run.register_tiles([&a, &b]);

        assert!(run.record_tally(&a, TileOutcome::Succeeded));
        assert!(!run.record_tally(&a, TileOutcome::Succeeded));
        assert!(!run.record_tally(&a, TileOutcome::Failed));
        assert!(run.record_tally(&b, TileOutcome::Failed));
        assert!(!run.record_tally(&TileId::from_raw("9/9/9"), TileOutcome::Failed));

        assert_eq!(run.pending_count, 0);
        assert_eq!(run.succeeded_count, 1);
        assert_eq!(run.failed_count, 1);
        assert!(run.counters_balanced());
        assert_eq!(run.final_status(), RunStatus::CompletedWithErrors);
    }

    #[test]
    fn status_serializes_screaming_snake() {
        let json =
            serde_json::to_string(&RunStatus::CompletedWithErrors).expect("json");
        assert_eq!(json, "\"COMPLETED_WITH_ERRORS\"");
    }
}
