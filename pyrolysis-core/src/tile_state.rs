//! Tile job lifecycle rules.
//!
//! ```text
//! PENDING -> CLAIMED -> PROCESSING -> SUCCEEDED
//!                                  -> FAILED (terminal)
//!                                  -> FAILED (retry pending) -> CLAIMED ...
//! ```
//!
//! Pure functions only: each returns the condition or update a caller sends
//! to the store. Nothing here performs I/O.

use chrono::{DateTime, Utc};

use pyrolysis_contracts::store::{TileJobCondition, TileJobUpdate};
use pyrolysis_model::{
    ErrorClass, ErrorCode, TileError, TileJob, TileJobStatus, TileOutcome,
    TileResult, WorkerToken,
};

use crate::classifier::FailureVerdict;

/// What the external work produced.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkVerdict {
    Succeeded(TileResult),
    Failed(FailureVerdict),
}

/// Store update for a release plus whether it ends the tile.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleasePlan {
    pub update: TileJobUpdate,
    /// `None` means the job is FAILED but eligible for another claim.
    pub terminal: Option<TileOutcome>,
}

/// A job may be claimed when it is pending, when its lease went stale with
/// attempts to spare, or when it failed transiently with attempts to spare.
pub fn claimable(now: DateTime<Utc>, max_retries: u32) -> TileJobCondition {
    use TileJobCondition::*;

    Any(vec![
        All(vec![StatusIn(vec![TileJobStatus::Pending]), NotFinished]),
        All(vec![
            StatusIn(vec![TileJobStatus::Claimed, TileJobStatus::Processing]),
            LockExpiredAt(now),
            AttemptsAtMost(max_retries),
            NotFinished,
        ]),
        All(vec![
            StatusIn(vec![TileJobStatus::Failed]),
            FailureClassIs(ErrorClass::Transient),
            AttemptsAtMost(max_retries),
            NotFinished,
        ]),
    ])
}

/// Non-terminal, not held by anyone, and out of attempts. Such a job can
/// never be claimed again and has to be closed out instead.
pub fn is_exhausted(job: &TileJob, now: DateTime<Utc>, max_retries: u32) -> bool {
    !job.is_terminal()
        && !job.lease_is_live(now)
        && job.status != TileJobStatus::Pending
        && job.attempt_count > max_retries
}

/// Matches exactly the state observed in `job`, so the close-out write
/// loses to any concurrent change.
pub fn unchanged_since(job: &TileJob) -> TileJobCondition {
    use TileJobCondition::*;

    let mut conditions = vec![
        StatusIn(vec![job.status]),
        LockExpiresAtIs(job.lock_expires_at),
        AttemptsAtMost(job.attempt_count),
        AttemptsAtLeast(job.attempt_count),
        NotFinished,
    ];
    if let Some(owner) = job.lock_owner {
        conditions.push(LockOwnerIs(owner));
    }
    All(conditions)
}

pub fn exhausted_update(job: &TileJob, now: DateTime<Utc>) -> TileJobUpdate {
    let message = match &job.last_error {
        Some(previous) => format!(
            "attempts exhausted after {} tries; last error {}: {}",
            job.attempt_count, previous.code, previous.message
        ),
        None => format!(
            "lease expired on final attempt {} without a release",
            job.attempt_count
        ),
    };
    TileJobUpdate::at(now)
        .status(TileJobStatus::Failed)
        .clear_lock()
        .last_error(TileError::new(
            ErrorCode::RetryExhausted,
            message,
            ErrorClass::Transient,
            now,
        ))
        .finished_at(now)
}

pub fn claim_update(
    token: WorkerToken,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> TileJobUpdate {
    TileJobUpdate::at(now)
        .status(TileJobStatus::Claimed)
        .lock(token, expires_at)
        .increment_attempts()
        .claimed_at(now)
}

/// Owner still holds the job and it has not been closed.
pub fn owned_by(token: WorkerToken) -> TileJobCondition {
    TileJobCondition::All(vec![
        TileJobCondition::LockOwnerIs(token),
        TileJobCondition::StatusIn(vec![
            TileJobStatus::Claimed,
            TileJobStatus::Processing,
        ]),
        TileJobCondition::NotFinished,
    ])
}

pub fn plan_release(
    attempt_count: u32,
    verdict: WorkVerdict,
    max_retries: u32,
    now: DateTime<Utc>,
) -> ReleasePlan {
    match verdict {
        WorkVerdict::Succeeded(result) => ReleasePlan {
            update: TileJobUpdate::at(now)
                .status(TileJobStatus::Succeeded)
                .result(result)
                .clear_last_error()
                .clear_lock()
                .finished_at(now),
            terminal: Some(TileOutcome::Succeeded),
        },
        WorkVerdict::Failed(failure) => {
            let update = TileJobUpdate::at(now)
                .status(TileJobStatus::Failed)
                .last_error(failure.to_tile_error(now))
                .clear_lock();
            if failure.is_transient() && attempt_count <= max_retries {
                ReleasePlan {
                    update,
                    terminal: None,
                }
            } else {
                ReleasePlan {
                    update: update.finished_at(now),
                    terminal: Some(TileOutcome::Failed),
                }
            }
        }
    }
}

/// Outcome a terminal record represents, for re-notifying the aggregator.
pub fn terminal_outcome(job: &TileJob) -> Option<TileOutcome> {
    if !job.is_terminal() {
        return None;
    }
    match job.status {
        TileJobStatus::Succeeded => Some(TileOutcome::Succeeded),
        _ => Some(TileOutcome::Failed),
    }
}
