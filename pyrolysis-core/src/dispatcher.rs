//! Ingestion: turns normalized rows into a run, tile jobs and queue messages.
//!
//! Order per batch is register -> create -> send. Tiles are registered on the
//! run before their records exist so that any terminal transition, however
//! early, finds its tally entry. A crash mid-ingestion leaves a run in
//! INGESTING; ingesting the same input again repairs it. So does a failed
//! re-send of a job that already existed: such a job is never failed, since
//! an earlier message for it may still be queued, and the run stays in
//! INGESTING until a later ingestion gets the message out.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use pyrolysis_contracts::queue::{BatchSendFailure, TileQueue};
use pyrolysis_contracts::store::{
    ConditionalWrite, RunCondition, RunStore, RunUpdate, TileJobCondition,
    TileJobStore, TileJobUpdate,
};
use pyrolysis_model::{
    Run, RunId, RowError, RunStatus, SchemaKind, SourceRef, TileCoordinates,
    TileId, TileJob, TileJobKey, TileJobMessage, TileJobStatus, TileOutcome,
};

use crate::aggregator::RunAggregator;
use crate::classifier::{
    FailureVerdict, classify_enqueue_failure, classify_queue_error,
    classify_row_error,
};
use crate::clock::Clock;
use crate::config::IngestConfig;
use crate::error::{CoreError, Result};
use crate::tile_state;

/// One input row after normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestRow {
    /// 1-based line in the source, for reporting.
    pub line: usize,
    pub parsed: std::result::Result<TileCoordinates, RowError>,
}

#[derive(Debug, Clone)]
pub struct IngestionRequest {
    pub run_id: RunId,
    pub schema_kind: SchemaKind,
    pub source: Option<SourceRef>,
    pub rows: Vec<IngestRow>,
}

/// Row that never became a tile job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRow {
    pub line: usize,
    pub error_code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestionReport {
    pub run_id: RunId,
    pub status: RunStatus,
    pub total_tiles: u64,
    /// Messages accepted by the queue.
    pub enqueued: usize,
    /// Rows repeating a tile id seen earlier in the same input.
    pub duplicates: usize,
    /// Pre-existing PENDING jobs sent again.
    pub requeued_pending: usize,
    /// Pre-existing jobs past PENDING, left alone.
    pub skipped_existing: usize,
    /// Tiles closed as FAILED because their message could not be sent.
    pub enqueue_failures: usize,
    /// Pre-existing PENDING jobs whose re-send failed. They stay PENDING.
    pub requeue_failures: usize,
    pub rejected: Vec<RejectedRow>,
}

impl IngestionReport {
    fn new(run_id: RunId, status: RunStatus) -> Self {
        Self {
            run_id,
            status,
            total_tiles: 0,
            enqueued: 0,
            duplicates: 0,
            requeued_pending: 0,
            skipped_existing: 0,
            enqueue_failures: 0,
            requeue_failures: 0,
            rejected: Vec::new(),
        }
    }
}

pub struct IngestionDispatcher {
    tile_jobs: Arc<dyn TileJobStore>,
    runs: Arc<dyn RunStore>,
    queue: Arc<dyn TileQueue>,
    aggregator: Arc<RunAggregator>,
    clock: Arc<dyn Clock>,
    config: IngestConfig,
}

impl fmt::Debug for IngestionDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestionDispatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl IngestionDispatcher {
    pub fn new(
        tile_jobs: Arc<dyn TileJobStore>,
        runs: Arc<dyn RunStore>,
        queue: Arc<dyn TileQueue>,
        aggregator: Arc<RunAggregator>,
        clock: Arc<dyn Clock>,
        config: IngestConfig,
    ) -> Self {
        Self {
            tile_jobs,
            runs,
            queue,
            aggregator,
            clock,
            config,
        }
    }

    pub async fn ingest(
        &self,
        request: IngestionRequest,
    ) -> Result<IngestionReport> {
        let started = Instant::now();
        let IngestionRequest {
            run_id,
            schema_kind,
            source,
            rows,
        } = request;

        let mut report = IngestionReport::new(run_id.clone(), RunStatus::Created);
        let tiles = self.dedupe(schema_kind, rows, &mut report);

        let run = self.open_run(&run_id, schema_kind, source).await?;
        if run.status.is_terminal() {
            info!(
                %run_id,
                status = run.status.as_str(),
                "run already finished; ingestion is a no-op"
            );
            report.status = run.status;
            report.total_tiles = run.total_tiles;
            report.skipped_existing = tiles.len();
            return Ok(report);
        }

        let batch_size = self
            .config
            .enqueue_batch_size
            .min(self.queue.max_batch_size())
            .max(1);
        for batch in tiles.chunks(batch_size) {
            self.dispatch_batch(&run_id, batch, &mut report).await?;
        }

        if report.requeue_failures > 0 {
            warn!(
                %run_id,
                requeue_failures = report.requeue_failures,
                "pending tiles could not be re-sent; run left in INGESTING"
            );
            let run = self
                .runs
                .get_run(&run_id)
                .await?
                .ok_or_else(|| CoreError::RunNotFound(run_id.clone()))?;
            report.status = run.status;
            report.total_tiles = run.total_tiles;
            return Ok(report);
        }

        let run = self.finalize(&run_id).await?;
        report.status = run.status;
        report.total_tiles = run.total_tiles;
        info!(
            %run_id,
            status = run.status.as_str(),
            total = run.total_tiles,
            enqueued = report.enqueued,
            duplicates = report.duplicates,
            rejected = report.rejected.len(),
            enqueue_failures = report.enqueue_failures,
            dur_ms = started.elapsed().as_millis() as u64,
            "ingestion finished"
        );
        Ok(report)
    }

    /// First write wins: a repeated tile id keeps the coordinates of its
    /// first row and later rows only count as duplicates.
    fn dedupe(
        &self,
        schema_kind: SchemaKind,
        rows: Vec<IngestRow>,
        report: &mut IngestionReport,
    ) -> Vec<TileCoordinates> {
        let mut seen: HashSet<TileId> = HashSet::new();
        let mut tiles = Vec::new();
        for row in rows {
            let coords = match row.parsed {
                Ok(coords) if coords.schema_kind() == schema_kind => coords,
                Ok(coords) => {
                    let err = RowError::SchemaMismatch {
                        expected: schema_kind,
                        found: coords.schema_kind(),
                    };
                    report.rejected.push(reject(row.line, &err));
                    continue;
                }
                Err(err) => {
                    report.rejected.push(reject(row.line, &err));
                    continue;
                }
            };
            if seen.insert(coords.tile_id()) {
                tiles.push(coords);
            } else {
                report.duplicates += 1;
            }
        }
        if !report.rejected.is_empty() {
            warn!(
                rejected = report.rejected.len(),
                error_code = "SCHEMA_INVALID",
                "rows rejected during ingestion"
            );
        }
        tiles
    }

    /// Creates the run, or reopens an existing one for ingestion.
    async fn open_run(
        &self,
        run_id: &RunId,
        schema_kind: SchemaKind,
        source: Option<SourceRef>,
    ) -> Result<Run> {
        let now = self.clock.now();
        let fresh = Run::new(run_id.clone(), schema_kind, source, now);
        let existing = match self
            .runs
            .put_run(fresh, RunCondition::NotExists)
            .await?
        {
            ConditionalWrite::Applied(run) => {
                info!(%run_id, schema = %schema_kind, "created run");
                run
            }
            ConditionalWrite::Rejected(Some(run)) => run,
            ConditionalWrite::Rejected(None) => {
                return Err(CoreError::RunNotFound(run_id.clone()));
            }
        };

        if existing.schema_kind != schema_kind {
            return Err(CoreError::RunConflict {
                run_id: run_id.clone(),
                reason: format!(
                    "run was created for {} input, got {}",
                    existing.schema_kind, schema_kind
                ),
            });
        }
        if existing.status.is_terminal() {
            return Ok(existing);
        }

        let written = self
            .runs
            .update_run(
                run_id,
                RunUpdate::at(self.clock.now()).status(RunStatus::Ingesting),
                RunCondition::StatusIn(vec![
                    RunStatus::Created,
                    RunStatus::Ingesting,
                    RunStatus::Processing,
                ]),
            )
            .await?;
        match written {
            ConditionalWrite::Applied(run) => Ok(run),
            // Finished between the two writes.
            ConditionalWrite::Rejected(Some(run)) => Ok(run),
            ConditionalWrite::Rejected(None) => {
                Err(CoreError::RunNotFound(run_id.clone()))
            }
        }
    }

    async fn dispatch_batch(
        &self,
        run_id: &RunId,
        batch: &[TileCoordinates],
        report: &mut IngestionReport,
    ) -> Result<()> {
        let ids: Vec<TileId> = batch.iter().map(TileCoordinates::tile_id).collect();
        self.aggregator.register(run_id, ids).await?;

        let now = self.clock.now();
        let mut outbound = Vec::with_capacity(batch.len());
        let mut created: HashSet<TileId> = HashSet::new();
        for coords in batch {
            let job = TileJob::pending(run_id.clone(), coords.clone(), now);
            let key = job.key();
            match self
                .tile_jobs
                .put_tile_job(job, TileJobCondition::NotExists)
                .await?
            {
                ConditionalWrite::Applied(_) => {
                    created.insert(key.tile_id.clone());
                    outbound.push(TileJobMessage::new(key, now));
                }
                ConditionalWrite::Rejected(Some(existing))
                    if existing.status == TileJobStatus::Pending
                        && !existing.is_terminal() =>
                {
                    report.requeued_pending += 1;
                    outbound.push(TileJobMessage::new(key, now));
                }
                ConditionalWrite::Rejected(Some(existing)) => {
                    report.skipped_existing += 1;
                    // Re-notify so a tile finished before an interrupted
                    // ingestion registered it still gets counted.
                    if let Some(outcome) = tile_state::terminal_outcome(&existing)
                    {
                        self.aggregator
                            .on_terminal(run_id, &existing.tile_id, outcome)
                            .await?;
                    }
                }
                ConditionalWrite::Rejected(None) => {
                    warn!(%run_id, tile_id = %key.tile_id, "tile job create rejected without a record");
                }
            }
        }

        if outbound.is_empty() {
            return Ok(());
        }

        let failures: Vec<(TileId, FailureVerdict)> =
            match self.queue.send_message_batch(&outbound).await {
                Ok(sent) => {
                    report.enqueued += sent.sent;
                    sent.failures
                        .iter()
                        .map(|failure: &BatchSendFailure| {
                            (failure.tile_id.clone(), classify_enqueue_failure(failure))
                        })
                        .collect()
                }
                Err(err) => {
                    let verdict = classify_queue_error(&err);
                    warn!(
                        %run_id,
                        batch = outbound.len(),
                        error_code = %verdict.code,
                        error = %err,
                        "batch enqueue failed"
                    );
                    outbound
                        .iter()
                        .map(|message| (message.tile_id.clone(), verdict.clone()))
                        .collect()
                }
            };

        for (tile_id, verdict) in failures {
            if !created.contains(&tile_id) {
                warn!(
                    %run_id,
                    %tile_id,
                    error_code = %verdict.code,
                    "re-send of pending tile failed; leaving it pending"
                );
                report.requeue_failures += 1;
                continue;
            }
            let key = TileJobKey::new(run_id.clone(), tile_id);
            if self.fail_unsent(&key, &verdict).await? {
                report.enqueue_failures += 1;
            }
        }
        debug!(%run_id, batch = batch.len(), "dispatched batch");
        Ok(())
    }

    /// Closes a tile whose message never reached the queue, so the run's
    /// counters still add up.
    async fn fail_unsent(
        &self,
        key: &TileJobKey,
        verdict: &FailureVerdict,
    ) -> Result<bool> {
        let now = self.clock.now();
        let written = self
            .tile_jobs
            .update_tile_job(
                key,
                TileJobUpdate::at(now)
                    .status(TileJobStatus::Failed)
                    .last_error(verdict.to_tile_error(now))
                    .finished_at(now),
                TileJobCondition::All(vec![
                    TileJobCondition::StatusIn(vec![TileJobStatus::Pending]),
                    TileJobCondition::NotFinished,
                ]),
            )
            .await?;
        match written {
            ConditionalWrite::Applied(_) => {
                warn!(
                    run_id = %key.run_id,
                    tile_id = %key.tile_id,
                    error_code = %verdict.code,
                    classification = verdict.classification.as_str(),
                    "tile closed after enqueue failure"
                );
                self.aggregator
                    .on_terminal(&key.run_id, &key.tile_id, TileOutcome::Failed)
                    .await?;
                Ok(true)
            }
            // An earlier message for this tile is already being worked.
            ConditionalWrite::Rejected(_) => Ok(false),
        }
    }

    /// INGESTING -> PROCESSING, or FAILED when nothing was ingested.
    async fn finalize(&self, run_id: &RunId) -> Result<Run> {
        let now = self.clock.now();
        let current = self
            .runs
            .get_run(run_id)
            .await?
            .ok_or_else(|| CoreError::RunNotFound(run_id.clone()))?;

        let update = if current.total_tiles == 0 {
            RunUpdate::at(now)
                .status(RunStatus::Failed)
                .failure_reason("input contained no valid tile rows")
                .finished_at(now)
        } else {
            RunUpdate::at(now).status(RunStatus::Processing)
        };
        let written = self
            .runs
            .update_run(
                run_id,
                update,
                RunCondition::StatusIn(vec![RunStatus::Ingesting]),
            )
            .await?;
        let run = match written {
            ConditionalWrite::Applied(run) | ConditionalWrite::Rejected(Some(run)) => run,
            ConditionalWrite::Rejected(None) => {
                return Err(CoreError::RunNotFound(run_id.clone()));
            }
        };
        if run.status == RunStatus::Failed {
            warn!(%run_id, "run failed: no valid tile rows");
            return Ok(run);
        }

        // Every tile may already be terminal (all enqueues failed, or the
        // workers outran ingestion).
        if self.aggregator.try_complete(&run).await?.is_none() {
            return Ok(run);
        }
        self.runs
            .get_run(run_id)
            .await?
            .ok_or_else(|| CoreError::RunNotFound(run_id.clone()))
    }
}

fn reject(line: usize, err: &RowError) -> RejectedRow {
    let verdict = classify_row_error(err);
    RejectedRow {
        line,
        error_code: verdict.code.to_string(),
        message: verdict.message,
    }
}
