//! Per-message worker control loop.
//!
//! A worker is a function from one queue message to an acknowledgement
//! decision. It never returns an error: every path ends in a release, a
//! no-op, or an explicit [`Disposition`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use tracing::{Instrument, debug, info, info_span, warn};

use pyrolysis_contracts::collaborators::{
    ArtifactStore, Classification, CollaboratorFailure, ImageryFetcher,
    VisionClassifier,
};
use pyrolysis_contracts::queue::TileQueue;
use pyrolysis_model::{
    ArtifactRef, ErrorCode, Service, TileCoordinates, TileJob, TileJobKey,
    TileJobMessage, TileResult, WorkerToken,
};

use crate::aggregator::RunAggregator;
use crate::artifacts::imagery_key;
use crate::backoff::Backoff;
use crate::classifier::{classify_engine_error, classify_failure};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{CoreError, Result};
use crate::lease::{
    ClaimOutcome, LeaseProtocol, LeaseWrite, ReleaseOutcome, TileLease,
};
use crate::tile_state::{self, WorkVerdict};

/// What the caller should do with the inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Delete the message.
    Ack,
    /// Leave it for redelivery.
    Retry,
}

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Slack added to a foreign lease's expiry before checking on it again.
const RECHECK_MARGIN: Duration = Duration::from_secs(1);

/// External work collaborators.
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn ImageryFetcher>,
    pub vision: Arc<dyn VisionClassifier>,
    pub artifacts: Arc<dyn ArtifactStore>,
    /// Upper bound on any single external call.
    pub request_timeout: Duration,
}

impl Collaborators {
    pub fn new(
        fetcher: Arc<dyn ImageryFetcher>,
        vision: Arc<dyn VisionClassifier>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            fetcher,
            vision,
            artifacts,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    async fn fetch(
        &self,
        coordinates: &TileCoordinates,
    ) -> std::result::Result<Vec<u8>, CollaboratorFailure> {
        let service = imagery_service(coordinates);
        self.bounded(self.fetcher.fetch(coordinates), || {
            CollaboratorFailure::Timeout { service }
        })
        .await
    }

    async fn classify(
        &self,
        image: &[u8],
    ) -> std::result::Result<Classification, CollaboratorFailure> {
        self.bounded(self.vision.classify(image), || {
            CollaboratorFailure::Timeout {
                service: Service::Vision,
            }
        })
        .await
    }

    async fn put_artifact(
        &self,
        key: &str,
        bytes: &[u8],
    ) -> std::result::Result<ArtifactRef, CollaboratorFailure> {
        let timeout = self.request_timeout;
        self.bounded(self.artifacts.put(key, bytes), || {
            CollaboratorFailure::ArtifactPut {
                message: format!("timed out after {timeout:?}"),
            }
        })
        .await
    }

    async fn get_artifact(
        &self,
        artifact: &ArtifactRef,
    ) -> std::result::Result<Vec<u8>, CollaboratorFailure> {
        let timeout = self.request_timeout;
        self.bounded(self.artifacts.get(artifact), || {
            CollaboratorFailure::ArtifactGet {
                message: format!("timed out after {timeout:?}"),
            }
        })
        .await
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = std::result::Result<T, CollaboratorFailure>>,
        elapsed: impl FnOnce() -> CollaboratorFailure,
    ) -> std::result::Result<T, CollaboratorFailure> {
        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(elapsed()),
        }
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

pub struct WorkerOrchestrator {
    lease: Arc<LeaseProtocol>,
    aggregator: Arc<RunAggregator>,
    queue: Arc<dyn TileQueue>,
    collaborators: Collaborators,
    backoff: Backoff,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for WorkerOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerOrchestrator")
            .field("lease", &self.lease)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

enum Execution {
    Done(WorkVerdict),
    /// Ownership moved on mid-flight; drop the work.
    Abandoned,
}

impl WorkerOrchestrator {
    pub fn new(
        lease: Arc<LeaseProtocol>,
        aggregator: Arc<RunAggregator>,
        queue: Arc<dyn TileQueue>,
        collaborators: Collaborators,
        config: &EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            lease,
            aggregator,
            queue,
            collaborators,
            backoff: Backoff::new(config.retry),
            clock,
        }
    }

    /// Entry point for a raw queue body. Undecodable payloads are logged and
    /// acknowledged: redelivering them cannot help.
    pub async fn handle_raw(&self, body: &str) -> Disposition {
        match TileJobMessage::from_json(body) {
            Ok(message) => self.handle(&message).await,
            Err(err) => {
                warn!(
                    error_code = %ErrorCode::MessageParseError,
                    error = %err,
                    "dropping undecodable tile job message"
                );
                Disposition::Ack
            }
        }
    }

    pub async fn handle(&self, message: &TileJobMessage) -> Disposition {
        let token = WorkerToken::new();
        let span = info_span!(
            "tile_job",
            run_id = %message.run_id,
            tile_id = %message.tile_id,
            %token
        );
        match self.process(message, token).instrument(span).await {
            Ok(disposition) => disposition,
            Err(err) => {
                warn!(
                    run_id = %message.run_id,
                    tile_id = %message.tile_id,
                    error = %err,
                    "tile job handling failed; leaving message for redelivery"
                );
                Disposition::Retry
            }
        }
    }

    async fn process(
        &self,
        message: &TileJobMessage,
        token: WorkerToken,
    ) -> Result<Disposition> {
        let key = message.key();
        let started = Instant::now();
        let claim = self.lease.claim(&key, token).await?;
        debug!(
            stage = "claim",
            dur_ms = started.elapsed().as_millis() as u64,
            "claim finished"
        );

        let (mut lease, job) = match claim {
            ClaimOutcome::Claimed { lease, job } => (lease, job),
            ClaimOutcome::NotFound => {
                info!("no tile job for message; acknowledging");
                return Ok(Disposition::Ack);
            }
            ClaimOutcome::AlreadyClaimed { owner, expires_at } => {
                info!(
                    owner = ?owner,
                    expires_at = ?expires_at,
                    "tile job held by another worker; acknowledging"
                );
                return Ok(self.recheck_at(&key, expires_at).await);
            }
            ClaimOutcome::Finished(job) => {
                if let Some(outcome) = tile_state::terminal_outcome(&job) {
                    self.aggregator
                        .on_terminal(&job.run_id, &job.tile_id, outcome)
                        .await?;
                }
                debug!("tile job already finished; acknowledging");
                return Ok(Disposition::Ack);
            }
        };

        match self.attempt(&mut lease, &job).await {
            Ok(disposition) => Ok(disposition),
            Err(err) => Ok(self.abort(&lease, err).await),
        }
    }

    /// Runs one claimed attempt through to its release.
    async fn attempt(
        &self,
        lease: &mut TileLease,
        job: &TileJob,
    ) -> Result<Disposition> {
        if let LeaseWrite::Lost = self.lease.begin_processing(lease).await? {
            return Ok(Disposition::Ack);
        }

        let verdict = match self.execute(lease, job).await? {
            Execution::Done(verdict) => verdict,
            Execution::Abandoned => {
                info!(attempt = lease.attempt, "abandoning work after losing lease");
                return Ok(Disposition::Ack);
            }
        };
        if let WorkVerdict::Failed(failure) = &verdict {
            warn!(
                attempt = lease.attempt,
                error_code = %failure.code,
                classification = failure.classification.as_str(),
                error = %failure.message,
                "tile attempt failed"
            );
        }

        let started = Instant::now();
        let released = self.lease.release(lease, verdict).await?;
        debug!(
            stage = "release",
            dur_ms = started.elapsed().as_millis() as u64,
            "release finished"
        );

        match released {
            ReleaseOutcome::OwnershipLost => Ok(Disposition::Ack),
            ReleaseOutcome::Released {
                job,
                terminal: Some(outcome),
            } => {
                self.aggregator
                    .on_terminal(&job.run_id, &job.tile_id, outcome)
                    .await?;
                Ok(Disposition::Ack)
            }
            ReleaseOutcome::Released {
                job,
                terminal: None,
            } => Ok(self.redrive(&job).await),
        }
    }

    /// An engine error cut the attempt short while the lease was held. Close
    /// it as a transient failure so the tile is not stranded until the lease
    /// runs out; if even that fails, the redelivered message schedules a
    /// recheck at lease expiry.
    async fn abort(&self, lease: &TileLease, err: CoreError) -> Disposition {
        let failure = classify_engine_error(&err);
        warn!(
            attempt = lease.attempt,
            error_code = %failure.code,
            error = %err,
            "tile attempt aborted; releasing lease"
        );
        let released =
            match self.lease.release(lease, WorkVerdict::Failed(failure)).await {
                Ok(released) => released,
                Err(err) => {
                    warn!(
                        error = %err,
                        "release after abort failed; leaving message for redelivery"
                    );
                    return Disposition::Retry;
                }
            };
        match released {
            ReleaseOutcome::Released {
                job,
                terminal: Some(outcome),
            } => {
                match self
                    .aggregator
                    .on_terminal(&job.run_id, &job.tile_id, outcome)
                    .await
                {
                    Ok(_) => Disposition::Ack,
                    Err(err) => {
                        warn!(error = %err, "tally after abort failed");
                        Disposition::Retry
                    }
                }
            }
            ReleaseOutcome::Released {
                job,
                terminal: None,
            } => self.redrive(&job).await,
            // Already released, or taken over; a redelivery sorts out which.
            ReleaseOutcome::OwnershipLost => Disposition::Retry,
        }
    }

    /// Someone else holds a live lease. The inbound message is acknowledged,
    /// but a delayed copy comes back once that lease has expired so a stalled
    /// owner cannot strand the tile.
    async fn recheck_at(
        &self,
        key: &TileJobKey,
        expires_at: Option<DateTime<Utc>>,
    ) -> Disposition {
        let Some(expires_at) = expires_at else {
            return Disposition::Ack;
        };
        let now = self.clock.now();
        let delay = (expires_at - now).to_std().unwrap_or(Duration::ZERO)
            + RECHECK_MARGIN;
        let message = TileJobMessage::new(key.clone(), now);
        match self.queue.send_message(&message, delay).await {
            Ok(()) => {
                debug!(
                    delay_ms = delay.as_millis() as u64,
                    "scheduled recheck at lease expiry"
                );
                Disposition::Ack
            }
            Err(err) => {
                warn!(
                    error_code = %ErrorCode::EnqueueFailed,
                    error = %err,
                    "recheck enqueue failed; keeping inbound message"
                );
                Disposition::Retry
            }
        }
    }

    /// Re-enqueues a retry-pending job after backoff. If the send fails the
    /// inbound message is kept so the queue redelivers it instead.
    async fn redrive(&self, job: &TileJob) -> Disposition {
        let delay = self.backoff.delay(job.attempt_count);
        let message = TileJobMessage::new(job.key(), self.clock.now());
        match self.queue.send_message(&message, delay).await {
            Ok(()) => {
                info!(
                    attempt = job.attempt_count,
                    delay_ms = delay.as_millis() as u64,
                    "scheduled retry"
                );
                Disposition::Ack
            }
            Err(err) => {
                warn!(
                    attempt = job.attempt_count,
                    error_code = %ErrorCode::EnqueueFailed,
                    error = %err,
                    "retry enqueue failed; keeping inbound message"
                );
                Disposition::Retry
            }
        }
    }

    async fn execute(
        &self,
        lease: &mut TileLease,
        job: &TileJob,
    ) -> Result<Execution> {
        let image = match &job.checkpoint {
            Some(artifact) => {
                if !self.lease.renew_if_due(lease).await? {
                    return Ok(Execution::Abandoned);
                }
                let started = Instant::now();
                let loaded = self.collaborators.get_artifact(artifact).await;
                debug!(
                    stage = "checkpoint_load",
                    dur_ms = started.elapsed().as_millis() as u64,
                    "loaded checkpointed imagery"
                );
                match loaded {
                    Ok(bytes) => (bytes, artifact.clone()),
                    Err(failure) => return Ok(failed(&failure)),
                }
            }
            None => {
                if !self.lease.renew_if_due(lease).await? {
                    return Ok(Execution::Abandoned);
                }
                let started = Instant::now();
                let fetched = self.collaborators.fetch(&job.coordinates).await;
                debug!(
                    stage = "fetch",
                    dur_ms = started.elapsed().as_millis() as u64,
                    "imagery fetch finished"
                );
                let bytes = match fetched {
                    Ok(bytes) => bytes,
                    Err(failure) => return Ok(failed(&failure)),
                };

                let key = imagery_key(&job.run_id, &job.coordinates);
                let artifact =
                    match self.collaborators.put_artifact(&key, &bytes).await {
                        Ok(artifact) => artifact,
                        Err(failure) => return Ok(failed(&failure)),
                    };
                match self
                    .lease
                    .record_checkpoint(lease, artifact.clone())
                    .await?
                {
                    LeaseWrite::Held(_) => {}
                    LeaseWrite::Lost => return Ok(Execution::Abandoned),
                }
                (bytes, artifact)
            }
        };
        let (bytes, artifact) = image;

        if !self.lease.renew_if_due(lease).await? {
            return Ok(Execution::Abandoned);
        }
        let started = Instant::now();
        let classified = self.collaborators.classify(&bytes).await;
        debug!(
            stage = "classify",
            dur_ms = started.elapsed().as_millis() as u64,
            "vision classification finished"
        );
        let classification = match classified.and_then(check_classification) {
            Ok(classification) => classification,
            Err(failure) => return Ok(failed(&failure)),
        };

        Ok(Execution::Done(WorkVerdict::Succeeded(TileResult {
            label: classification.label,
            confidence: classification.confidence,
            reasoning: classification.reasoning,
            artifact: Some(artifact),
        })))
    }
}

fn failed(failure: &CollaboratorFailure) -> Execution {
    Execution::Done(WorkVerdict::Failed(classify_failure(failure)))
}

fn check_classification(
    classification: Classification,
) -> std::result::Result<Classification, CollaboratorFailure> {
    if classification.label.trim().is_empty() {
        return Err(CollaboratorFailure::BadResponse {
            service: Service::Vision,
            message: "empty label".into(),
        });
    }
    if !(0.0..=1.0).contains(&classification.confidence) {
        return Err(CollaboratorFailure::BadResponse {
            service: Service::Vision,
            message: format!(
                "confidence {} outside 0..=1",
                classification.confidence
            ),
        });
    }
    Ok(classification)
}

/// Service a coordinate's imagery is fetched from.
pub fn imagery_service(coordinates: &TileCoordinates) -> Service {
    match coordinates {
        TileCoordinates::MapboxZxy { .. } => Service::Mapbox,
        TileCoordinates::GoogleLatlonZoom { .. } => Service::Google,
    }
}
