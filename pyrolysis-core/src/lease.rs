//! Lease-based ownership of tile jobs.
//!
//! Every operation is one conditional write against the tile job record.
//! Expired leases are noticed lazily by the next claim; nothing sweeps them.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use pyrolysis_contracts::store::{
    ConditionalWrite, TileJobStore, TileJobUpdate,
};
use pyrolysis_model::{
    ArtifactRef, TileJob, TileJobKey, TileJobStatus, TileOutcome, WorkerToken,
};

use crate::clock::Clock;
use crate::config::{LeaseConfig, RetryConfig};
use crate::error::{CoreError, Result};
use crate::tile_state::{self, WorkVerdict};

/// Proof of ownership handed to the claimant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileLease {
    pub key: TileJobKey,
    pub token: WorkerToken,
    pub expires_at: DateTime<Utc>,
    /// Attempt number this lease was granted for (1-based).
    pub attempt: u32,
}

impl TileLease {
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at - now
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed { lease: TileLease, job: TileJob },
    /// Another worker holds a live lease.
    AlreadyClaimed {
        owner: Option<WorkerToken>,
        expires_at: Option<DateTime<Utc>>,
    },
    /// The job is terminal; carries the record.
    Finished(TileJob),
    NotFound,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LeaseWrite {
    Held(TileJob),
    Lost,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReleaseOutcome {
    Released {
        job: TileJob,
        /// `Some` when the release ended the tile.
        terminal: Option<TileOutcome>,
    },
    OwnershipLost,
}

fn lease_expiry(
    now: DateTime<Utc>,
    lease_duration: Duration,
) -> Result<DateTime<Utc>> {
    now.checked_add_signed(lease_duration).ok_or_else(|| {
        CoreError::InvalidConfig(format!(
            "lease of {lease_duration} from {now} is out of range"
        ))
    })
}

pub struct LeaseProtocol {
    store: Arc<dyn TileJobStore>,
    clock: Arc<dyn Clock>,
    lease: LeaseConfig,
    retry: RetryConfig,
}

impl fmt::Debug for LeaseProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseProtocol")
            .field("lease", &self.lease)
            .field("max_retries", &self.retry.max_retries)
            .finish()
    }
}

impl LeaseProtocol {
    pub fn new(
        store: Arc<dyn TileJobStore>,
        clock: Arc<dyn Clock>,
        lease: LeaseConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            clock,
            lease,
            retry,
        }
    }

    pub fn lease_config(&self) -> &LeaseConfig {
        &self.lease
    }

    /// Claims with the configured lease TTL.
    pub async fn claim(
        &self,
        key: &TileJobKey,
        token: WorkerToken,
    ) -> Result<ClaimOutcome> {
        self.claim_for(key, token, self.lease.lease_ttl()?).await
    }

    pub async fn claim_for(
        &self,
        key: &TileJobKey,
        token: WorkerToken,
        lease_duration: Duration,
    ) -> Result<ClaimOutcome> {
        let now = self.clock.now();
        let expires_at = lease_expiry(now, lease_duration)?;
        let max_retries = self.retry.max_retries;

        let written = self
            .store
            .update_tile_job(
                key,
                tile_state::claim_update(token, expires_at, now),
                tile_state::claimable(now, max_retries),
            )
            .await?;

        match written {
            ConditionalWrite::Applied(job) => {
                debug!(
                    run_id = %key.run_id,
                    tile_id = %key.tile_id,
                    attempt = job.attempt_count,
                    %token,
                    "claimed tile job"
                );
                let lease = TileLease {
                    key: key.clone(),
                    token,
                    expires_at,
                    attempt: job.attempt_count,
                };
                Ok(ClaimOutcome::Claimed { lease, job })
            }
            ConditionalWrite::Rejected(None) => Ok(ClaimOutcome::NotFound),
            ConditionalWrite::Rejected(Some(job)) => {
                self.explain_rejection(job, now).await
            }
        }
    }

    async fn explain_rejection(
        &self,
        job: TileJob,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        if job.is_terminal() {
            return Ok(ClaimOutcome::Finished(job));
        }
        if tile_state::is_exhausted(&job, now, self.retry.max_retries) {
            return self.close_exhausted(job, now).await;
        }
        Ok(ClaimOutcome::AlreadyClaimed {
            owner: job.lock_owner,
            expires_at: job.lock_expires_at,
        })
    }

    /// Closes out a job that can never be claimed again.
    async fn close_exhausted(
        &self,
        job: TileJob,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let key = job.key();
        let written = self
            .store
            .update_tile_job(
                &key,
                tile_state::exhausted_update(&job, now),
                tile_state::unchanged_since(&job),
            )
            .await?;

        match written {
            ConditionalWrite::Applied(closed) => {
                warn!(
                    run_id = %key.run_id,
                    tile_id = %key.tile_id,
                    attempt = closed.attempt_count,
                    error_code = "RETRY_EXHAUSTED",
                    "closed tile job with exhausted attempts"
                );
                Ok(ClaimOutcome::Finished(closed))
            }
            ConditionalWrite::Rejected(Some(current))
                if current.is_terminal() =>
            {
                Ok(ClaimOutcome::Finished(current))
            }
            ConditionalWrite::Rejected(Some(current)) => {
                Ok(ClaimOutcome::AlreadyClaimed {
                    owner: current.lock_owner,
                    expires_at: current.lock_expires_at,
                })
            }
            ConditionalWrite::Rejected(None) => Ok(ClaimOutcome::NotFound),
        }
    }

    /// Extends the lease by the configured TTL if the caller still owns the
    /// job and it is not terminal.
    pub async fn renew(&self, lease: &TileLease) -> Result<Option<TileLease>> {
        self.renew_for(lease, self.lease.lease_ttl()?).await
    }

    pub async fn renew_for(
        &self,
        lease: &TileLease,
        lease_duration: Duration,
    ) -> Result<Option<TileLease>> {
        let now = self.clock.now();
        let expires_at = lease_expiry(now, lease_duration)?;
        let written = self
            .store
            .update_tile_job(
                &lease.key,
                TileJobUpdate::at(now).lock(lease.token, expires_at),
                tile_state::owned_by(lease.token),
            )
            .await?;

        match written {
            ConditionalWrite::Applied(_) => {
                debug!(
                    run_id = %lease.key.run_id,
                    tile_id = %lease.key.tile_id,
                    %expires_at,
                    "renewed tile lease"
                );
                Ok(Some(TileLease {
                    expires_at,
                    ..lease.clone()
                }))
            }
            ConditionalWrite::Rejected(_) => {
                info!(
                    run_id = %lease.key.run_id,
                    tile_id = %lease.key.tile_id,
                    token = %lease.token,
                    "lease renewal rejected; ownership lost"
                );
                Ok(None)
            }
        }
    }

    /// Renews when the remaining lease time has dropped under the configured
    /// threshold. Returns `false` once ownership is gone.
    pub async fn renew_if_due(&self, lease: &mut TileLease) -> Result<bool> {
        let remaining = lease.remaining(self.clock.now());
        if !self.lease.should_renew(remaining) {
            return Ok(true);
        }
        match self.renew(lease).await? {
            Some(renewed) => {
                *lease = renewed;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// CLAIMED -> PROCESSING, written right before external calls.
    pub async fn begin_processing(&self, lease: &TileLease) -> Result<LeaseWrite> {
        let now = self.clock.now();
        let update = TileJobUpdate::at(now).status(TileJobStatus::Processing);
        self.owner_write(lease, update, "begin processing").await
    }

    /// Records the artifact produced by this attempt.
    pub async fn record_checkpoint(
        &self,
        lease: &TileLease,
        artifact: ArtifactRef,
    ) -> Result<LeaseWrite> {
        let now = self.clock.now();
        let update = TileJobUpdate::at(now).checkpoint(artifact);
        self.owner_write(lease, update, "record checkpoint").await
    }

    async fn owner_write(
        &self,
        lease: &TileLease,
        update: TileJobUpdate,
        action: &'static str,
    ) -> Result<LeaseWrite> {
        let written = self
            .store
            .update_tile_job(&lease.key, update, tile_state::owned_by(lease.token))
            .await?;
        match written {
            ConditionalWrite::Applied(job) => Ok(LeaseWrite::Held(job)),
            ConditionalWrite::Rejected(_) => {
                info!(
                    run_id = %lease.key.run_id,
                    tile_id = %lease.key.tile_id,
                    token = %lease.token,
                    action,
                    "tile job no longer owned"
                );
                Ok(LeaseWrite::Lost)
            }
        }
    }

    /// Writes the outcome of the attempt and clears the lock, provided the
    /// caller is still the owner. A superseded owner gets `OwnershipLost`
    /// and nothing is written.
    pub async fn release(
        &self,
        lease: &TileLease,
        verdict: WorkVerdict,
    ) -> Result<ReleaseOutcome> {
        let now = self.clock.now();
        let plan = tile_state::plan_release(
            lease.attempt,
            verdict,
            self.retry.max_retries,
            now,
        );
        let written = self
            .store
            .update_tile_job(
                &lease.key,
                plan.update,
                tile_state::owned_by(lease.token),
            )
            .await?;

        match written {
            ConditionalWrite::Applied(job) => {
                info!(
                    run_id = %lease.key.run_id,
                    tile_id = %lease.key.tile_id,
                    attempt = lease.attempt,
                    status = job.status.as_str(),
                    terminal = plan.terminal.is_some(),
                    error_code = job
                        .last_error
                        .as_ref()
                        .map(|err| err.code.as_str())
                        .unwrap_or(""),
                    "released tile job"
                );
                Ok(ReleaseOutcome::Released {
                    job,
                    terminal: plan.terminal,
                })
            }
            ConditionalWrite::Rejected(_) => {
                info!(
                    run_id = %lease.key.run_id,
                    tile_id = %lease.key.tile_id,
                    token = %lease.token,
                    "release ignored; lease was superseded"
                );
                Ok(ReleaseOutcome::OwnershipLost)
            }
        }
    }
}
