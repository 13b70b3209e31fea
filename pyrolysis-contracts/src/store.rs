//! Conditional-write vocabulary for the two persisted tables.
//!
//! A backend evaluates a condition against the currently stored record and
//! applies the update in the same atomic step, or applies nothing. Conditions
//! are plain data with an [`evaluate`](TileJobCondition::evaluate) method so
//! every backend shares one definition of what they mean.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use pyrolysis_model::{
    ArtifactRef, ErrorClass, Run, RunId, RunStatus, TileError, TileId,
    TileJob, TileJobKey, TileJobStatus, TileOutcome, TileResult, WorkerToken,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store unavailable: {0}")]
    Unavailable(String),

    #[error("stored record could not be decoded: {0}")]
    Corrupt(String),

    #[error("record store error: {0}")]
    Backend(String),
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionalWrite<T> {
    /// The condition held; carries the record as written.
    Applied(T),
    /// The condition failed; carries the record as it currently is, if any.
    Rejected(Option<T>),
}

impl<T> ConditionalWrite<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, ConditionalWrite::Applied(_))
    }
}

/// Predicate over a stored tile job.
#[derive(Debug, Clone, PartialEq)]
pub enum TileJobCondition {
    Always,
    Exists,
    NotExists,
    StatusIn(Vec<TileJobStatus>),
    LockOwnerIs(WorkerToken),
    /// `lock_expires_at` equals the given value exactly.
    LockExpiresAtIs(Option<DateTime<Utc>>),
    /// No lease, or `lock_expires_at <= now`.
    LockExpiredAt(DateTime<Utc>),
    /// `now < lock_expires_at`.
    LockLiveAt(DateTime<Utc>),
    AttemptsAtMost(u32),
    AttemptsAtLeast(u32),
    FailureClassIs(ErrorClass),
    NotFinished,
    All(Vec<TileJobCondition>),
    Any(Vec<TileJobCondition>),
}

impl TileJobCondition {
    pub fn evaluate(&self, current: Option<&TileJob>) -> bool {
        use TileJobCondition::*;
        match self {
            Always => true,
            Exists => current.is_some(),
            NotExists => current.is_none(),
            All(conditions) => conditions.iter().all(|c| c.evaluate(current)),
            Any(conditions) => conditions.iter().any(|c| c.evaluate(current)),
            _ => current.is_some_and(|job| self.evaluate_existing(job)),
        }
    }

    fn evaluate_existing(&self, job: &TileJob) -> bool {
        use TileJobCondition::*;
        match self {
            StatusIn(statuses) => statuses.contains(&job.status),
            LockOwnerIs(token) => job.is_owned_by(token),
            LockExpiresAtIs(expected) => job.lock_expires_at == *expected,
            LockExpiredAt(now) => {
                job.lock_expires_at.is_none_or(|expires| expires <= *now)
            }
            LockLiveAt(now) => job.lease_is_live(*now),
            AttemptsAtMost(max) => job.attempt_count <= *max,
            AttemptsAtLeast(min) => job.attempt_count >= *min,
            FailureClassIs(class) => job.failure_class() == Some(*class),
            NotFinished => job.finished_at.is_none(),
            Always | Exists | NotExists | All(_) | Any(_) => {
                self.evaluate(Some(job))
            }
        }
    }

    pub fn and(self, other: TileJobCondition) -> TileJobCondition {
        match self {
            TileJobCondition::All(mut conditions) => {
                conditions.push(other);
                TileJobCondition::All(conditions)
            }
            first => TileJobCondition::All(vec![first, other]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockChange {
    Set {
        owner: WorkerToken,
        expires_at: DateTime<Utc>,
    },
    Clear,
}

/// Field assignments applied to a tile job when its condition holds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TileJobUpdate {
    pub status: Option<TileJobStatus>,
    pub lock: Option<LockChange>,
    pub increment_attempts: bool,
    pub last_error: Option<Option<TileError>>,
    pub result: Option<Option<TileResult>>,
    pub checkpoint: Option<ArtifactRef>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TileJobUpdate {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            updated_at: Some(now),
            ..Self::default()
        }
    }

    pub fn status(mut self, status: TileJobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn lock(
        mut self,
        owner: WorkerToken,
        expires_at: DateTime<Utc>,
    ) -> Self {
        self.lock = Some(LockChange::Set { owner, expires_at });
        self
    }

    pub fn clear_lock(mut self) -> Self {
        self.lock = Some(LockChange::Clear);
        self
    }

    pub fn increment_attempts(mut self) -> Self {
        self.increment_attempts = true;
        self
    }

    pub fn last_error(mut self, error: TileError) -> Self {
        self.last_error = Some(Some(error));
        self
    }

    pub fn clear_last_error(mut self) -> Self {
        self.last_error = Some(None);
        self
    }

    pub fn result(mut self, result: TileResult) -> Self {
        self.result = Some(Some(result));
        self
    }

    pub fn checkpoint(mut self, artifact: ArtifactRef) -> Self {
        self.checkpoint = Some(artifact);
        self
    }

    pub fn claimed_at(mut self, at: DateTime<Utc>) -> Self {
        self.claimed_at = Some(at);
        self
    }

    pub fn finished_at(mut self, at: DateTime<Utc>) -> Self {
        self.finished_at = Some(at);
        self
    }

    pub fn apply(&self, job: &mut TileJob) {
        if let Some(status) = self.status {
            job.status = status;
        }
        match &self.lock {
            Some(LockChange::Set { owner, expires_at }) => {
                job.lock_owner = Some(*owner);
                job.lock_expires_at = Some(*expires_at);
            }
            Some(LockChange::Clear) => {
                job.lock_owner = None;
                job.lock_expires_at = None;
            }
            None => {}
        }
        if self.increment_attempts {
            job.attempt_count = job.attempt_count.saturating_add(1);
        }
        if let Some(last_error) = &self.last_error {
            job.last_error = last_error.clone();
        }
        if let Some(result) = &self.result {
            job.result = result.clone();
        }
        if let Some(checkpoint) = &self.checkpoint {
            job.checkpoint = Some(checkpoint.clone());
        }
        if let Some(at) = self.claimed_at {
            job.claimed_at = Some(at);
        }
        if let Some(at) = self.finished_at {
            job.finished_at = Some(at);
        }
        if let Some(at) = self.updated_at {
            job.updated_at = at;
        }
    }
}

/// Predicate over a stored run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunCondition {
    Always,
    Exists,
    NotExists,
    StatusIn(Vec<RunStatus>),
    /// The tile is registered on the run and not yet counted.
    TilePending(TileId),
    PendingIs(u64),
    All(Vec<RunCondition>),
}

impl RunCondition {
    pub fn evaluate(&self, current: Option<&Run>) -> bool {
        match self {
            RunCondition::Always => true,
            RunCondition::Exists => current.is_some(),
            RunCondition::NotExists => current.is_none(),
            RunCondition::All(conditions) => {
                conditions.iter().all(|c| c.evaluate(current))
            }
            RunCondition::StatusIn(statuses) => {
                current.is_some_and(|run| statuses.contains(&run.status))
            }
            RunCondition::TilePending(tile) => current.is_some_and(|run| {
                run.tally_of(tile) == Some(pyrolysis_model::TileTally::Pending)
            }),
            RunCondition::PendingIs(count) => {
                current.is_some_and(|run| run.pending_count == *count)
            }
        }
    }
}

/// Field assignments applied to a run when its condition holds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub register_tiles: Vec<TileId>,
    pub tally: Option<(TileId, TileOutcome)>,
    pub failure_reason: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl RunUpdate {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            updated_at: Some(now),
            ..Self::default()
        }
    }

    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn register_tiles(mut self, tiles: Vec<TileId>) -> Self {
        self.register_tiles = tiles;
        self
    }

    pub fn tally(mut self, tile: TileId, outcome: TileOutcome) -> Self {
        self.tally = Some((tile, outcome));
        self
    }

    pub fn failure_reason(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = Some(reason.into());
        self
    }

    pub fn finished_at(mut self, at: DateTime<Utc>) -> Self {
        self.finished_at = Some(at);
        self
    }

    pub fn apply(&self, run: &mut Run) {
        if let Some(status) = self.status {
            run.status = status;
        }
        run.register_tiles(self.register_tiles.iter());
        if let Some((tile, outcome)) = &self.tally {
            run.record_tally(tile, *outcome);
        }
        if let Some(reason) = &self.failure_reason {
            run.failure_reason = Some(reason.clone());
        }
        if let Some(at) = self.finished_at {
            run.finished_at = Some(at);
        }
        if let Some(at) = self.updated_at {
            run.updated_at = at;
        }
    }
}

/// Tile job table.
///
/// Updates never create records: an update against a missing key is
/// `Rejected(None)` whatever the condition.
#[async_trait]
pub trait TileJobStore: Send + Sync {
    async fn get_tile_job(
        &self,
        key: &TileJobKey,
    ) -> Result<Option<TileJob>, StoreError>;

    async fn put_tile_job(
        &self,
        job: TileJob,
        condition: TileJobCondition,
    ) -> Result<ConditionalWrite<TileJob>, StoreError>;

    async fn update_tile_job(
        &self,
        key: &TileJobKey,
        update: TileJobUpdate,
        condition: TileJobCondition,
    ) -> Result<ConditionalWrite<TileJob>, StoreError>;

    /// All tile jobs of a run, in tile id order.
    async fn list_tile_jobs(
        &self,
        run_id: &RunId,
    ) -> Result<Vec<TileJob>, StoreError>;
}

/// Run table. Same update semantics as [`TileJobStore`].
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn get_run(&self, run_id: &RunId) -> Result<Option<Run>, StoreError>;

    async fn put_run(
        &self,
        run: Run,
        condition: RunCondition,
    ) -> Result<ConditionalWrite<Run>, StoreError>;

    async fn update_run(
        &self,
        run_id: &RunId,
        update: RunUpdate,
        condition: RunCondition,
    ) -> Result<ConditionalWrite<Run>, StoreError>;
}
