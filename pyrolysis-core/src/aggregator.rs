//! Run-level roll-up of terminal tile outcomes.
//!
//! The run record carries a per-tile tally. Counting a tile flips its tally
//! entry and moves the counters in one conditional write keyed on the entry
//! still being pending, so duplicate or interleaved notifications count once.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use pyrolysis_contracts::store::{
    ConditionalWrite, RunCondition, RunStore, RunUpdate,
};
use pyrolysis_model::{Run, RunId, RunStatus, TileId, TileOutcome};

use crate::clock::Clock;
use crate::error::{CoreError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum TallyOutcome {
    /// This call moved the counters. `completed` is set when it also
    /// finished the run.
    Counted {
        run: Run,
        completed: Option<RunStatus>,
    },
    AlreadyCounted,
    /// The run has never heard of this tile.
    Unregistered,
    RunMissing,
}

pub struct RunAggregator {
    runs: Arc<dyn RunStore>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RunAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunAggregator")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl RunAggregator {
    pub fn new(runs: Arc<dyn RunStore>, clock: Arc<dyn Clock>) -> Self {
        Self { runs, clock }
    }

    /// Adds tiles to an ingesting run as pending.
    pub async fn register(
        &self,
        run_id: &RunId,
        tiles: Vec<TileId>,
    ) -> Result<Run> {
        let now = self.clock.now();
        let written = self
            .runs
            .update_run(
                run_id,
                RunUpdate::at(now).register_tiles(tiles),
                RunCondition::StatusIn(vec![RunStatus::Ingesting]),
            )
            .await?;
        match written {
            ConditionalWrite::Applied(run) => Ok(run),
            ConditionalWrite::Rejected(None) => {
                Err(CoreError::RunNotFound(run_id.clone()))
            }
            ConditionalWrite::Rejected(Some(run)) => {
                Err(CoreError::RunConflict {
                    run_id: run_id.clone(),
                    reason: format!(
                        "tiles can only be registered while ingesting, run is {}",
                        run.status.as_str()
                    ),
                })
            }
        }
    }

    /// Counts a terminal tile outcome once and completes the run when
    /// nothing is left pending.
    pub async fn on_terminal(
        &self,
        run_id: &RunId,
        tile_id: &TileId,
        outcome: TileOutcome,
    ) -> Result<TallyOutcome> {
        let now = self.clock.now();
        let written = self
            .runs
            .update_run(
                run_id,
                RunUpdate::at(now).tally(tile_id.clone(), outcome),
                RunCondition::TilePending(tile_id.clone()),
            )
            .await?;

        match written {
            ConditionalWrite::Applied(run) => {
                debug!(
                    %run_id,
                    %tile_id,
                    ?outcome,
                    pending = run.pending_count,
                    "counted terminal tile"
                );
                let completed = self.try_complete(&run).await?;
                Ok(TallyOutcome::Counted { run, completed })
            }
            ConditionalWrite::Rejected(None) => {
                warn!(%run_id, %tile_id, "terminal tile for unknown run");
                Ok(TallyOutcome::RunMissing)
            }
            ConditionalWrite::Rejected(Some(run)) => {
                if run.tally_of(tile_id).is_none() {
                    warn!(%run_id, %tile_id, "terminal tile not registered on run");
                    return Ok(TallyOutcome::Unregistered);
                }
                debug!(%run_id, %tile_id, "tile already counted");
                // A crash between the last tally and the completion write
                // leaves a drained run in PROCESSING; finish it here.
                self.try_complete(&run).await?;
                Ok(TallyOutcome::AlreadyCounted)
            }
        }
    }

    /// Writes the final status if the run is processing and drained. The
    /// write is conditional, so exactly one caller completes a run.
    pub async fn try_complete(&self, run: &Run) -> Result<Option<RunStatus>> {
        if run.status != RunStatus::Processing || run.pending_count != 0 {
            return Ok(None);
        }
        let now = self.clock.now();
        let status = run.final_status();
        let written = self
            .runs
            .update_run(
                &run.run_id,
                RunUpdate::at(now).status(status).finished_at(now),
                RunCondition::All(vec![
                    RunCondition::StatusIn(vec![RunStatus::Processing]),
                    RunCondition::PendingIs(0),
                ]),
            )
            .await?;

        match written {
            ConditionalWrite::Applied(done) => {
                info!(
                    run_id = %done.run_id,
                    status = status.as_str(),
                    total = done.total_tiles,
                    succeeded = done.succeeded_count,
                    failed = done.failed_count,
                    "run completed"
                );
                Ok(Some(status))
            }
            ConditionalWrite::Rejected(_) => Ok(None),
        }
    }

    /// Reloads the run and completes it if drained.
    pub async fn complete_if_drained(
        &self,
        run_id: &RunId,
    ) -> Result<Option<RunStatus>> {
        match self.runs.get_run(run_id).await? {
            Some(run) => self.try_complete(&run).await,
            None => Err(CoreError::RunNotFound(run_id.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use pyrolysis_model::SchemaKind;

    use super::*;
    use crate::clock::SystemClock;
    use crate::infra::memory::InMemoryRecordStore;

    async fn processing_run(
        store: &InMemoryRecordStore,
        tiles: &[&str],
    ) -> RunId {
        let run_id = RunId::new("run_agg");
        let mut run =
            Run::new(run_id.clone(), SchemaKind::MapboxZxy, None, Utc::now());
        run.status = RunStatus::Processing;
        let ids: Vec<TileId> =
            tiles.iter().map(|t| TileId::from_raw(*t)).collect();
        run.register_tiles(ids.iter());
        store
            .put_run(run, RunCondition::NotExists)
            .await
            .expect("put run");
        run_id
    }

    fn aggregator(store: &InMemoryRecordStore) -> RunAggregator {
        RunAggregator::new(Arc::new(store.clone()), Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn duplicate_notifications_count_once() {
        let store = InMemoryRecordStore::new();
        let run_id = processing_run(&store, &["1/0/0", "1/0/1"]).await;
        let agg = aggregator(&store);
        let tile = TileId::from_raw("1/0/0");

        let first = agg
            .on_terminal(&run_id, &tile, TileOutcome::Succeeded)
            .await
            .expect("tally");
        assert!(matches!(first, TallyOutcome::Counted { completed: None, .. }));
        for _ in 0..3 {
            let again = agg
                .on_terminal(&run_id, &tile, TileOutcome::Failed)
                .await
                .expect("tally");
            assert_eq!(again, TallyOutcome::AlreadyCounted);
        }

        let run = store.get_run(&run_id).await.expect("get").expect("run");
        assert_eq!(run.succeeded_count, 1);
        assert_eq!(run.failed_count, 0);
        assert_eq!(run.pending_count, 1);
    }

    #[tokio::test]
    async fn last_tile_completes_run_once() {
        let store = InMemoryRecordStore::new();
        let run_id = processing_run(&store, &["1/0/0", "1/0/1"]).await;
        let agg = aggregator(&store);

        agg.on_terminal(&run_id, &TileId::from_raw("1/0/0"), TileOutcome::Failed)
            .await
            .expect("tally");
        let last = agg
            .on_terminal(
                &run_id,
                &TileId::from_raw("1/0/1"),
                TileOutcome::Succeeded,
            )
            .await
            .expect("tally");
        assert!(matches!(
            last,
            TallyOutcome::Counted {
                completed: Some(RunStatus::CompletedWithErrors),
                ..
            }
        ));

        let run = store.get_run(&run_id).await.expect("get").expect("run");
        assert_eq!(run.status, RunStatus::CompletedWithErrors);
        assert!(run.finished_at.is_some());
        assert_eq!(agg.try_complete(&run).await.expect("noop"), None);
    }

    #[tokio::test]
    async fn unknown_tiles_and_runs_are_reported() {
        let store = InMemoryRecordStore::new();
        let run_id = processing_run(&store, &["1/0/0"]).await;
        let agg = aggregator(&store);

        let stray = agg
            .on_terminal(&run_id, &TileId::from_raw("9/9/9"), TileOutcome::Failed)
            .await
            .expect("tally");
        assert_eq!(stray, TallyOutcome::Unregistered);

        let missing = agg
            .on_terminal(
                &RunId::new("run_nope"),
                &TileId::from_raw("1/0/0"),
                TileOutcome::Failed,
            )
            .await
            .expect("tally");
        assert_eq!(missing, TallyOutcome::RunMissing);
    }

    #[tokio::test]
    async fn registration_requires_ingesting_run() {
        let store = InMemoryRecordStore::new();
        let run_id = processing_run(&store, &[]).await;
        let agg = aggregator(&store);
        let err = agg
            .register(&run_id, vec![TileId::from_raw("1/0/0")])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::RunConflict { .. }));
    }
}
