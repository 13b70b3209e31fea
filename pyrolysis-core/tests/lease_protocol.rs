mod common;

use std::sync::Arc;

use chrono::Duration;
use futures::future::join_all;

use pyrolysis_core::classifier::classify_failure;
use pyrolysis_core::contracts::collaborators::CollaboratorFailure;
use pyrolysis_core::contracts::store::{TileJobCondition, TileJobStore};
use pyrolysis_core::lease::LeaseWrite;
use pyrolysis_core::model::{
    ErrorClass, RunId, Service, TileJob, TileJobStatus, TileOutcome,
    TileResult, WorkerToken,
};
use pyrolysis_core::tile_state::WorkVerdict;
use pyrolysis_core::{
    ClaimOutcome, CoreError, LeaseConfig, LeaseProtocol, ReleaseOutcome,
    RetryConfig,
};

use common::{key, mapbox, start};

const RUN: &str = "run_lease";
const TILE: &str = "6/10/20";

struct Fixture {
    clock: pyrolysis_core::ManualClock,
    store: pyrolysis_core::infra::memory::InMemoryRecordStore,
    protocol: Arc<LeaseProtocol>,
}

async fn fixture(max_retries: u32) -> Fixture {
    let clock = pyrolysis_core::ManualClock::new(start());
    let store = pyrolysis_core::infra::memory::InMemoryRecordStore::new();
    let job = TileJob::pending(RunId::new(RUN), mapbox(6, 10, 20), start());
    store
        .put_tile_job(job, TileJobCondition::NotExists)
        .await
        .expect("seed job");
    let protocol = Arc::new(LeaseProtocol::new(
        Arc::new(store.clone()),
        Arc::new(clock.clone()),
        LeaseConfig {
            lease_ttl_secs: 10,
            ..LeaseConfig::default()
        },
        RetryConfig {
            max_retries,
            ..RetryConfig::default()
        },
    ));
    Fixture {
        clock,
        store,
        protocol,
    }
}

fn transient() -> WorkVerdict {
    WorkVerdict::Failed(classify_failure(&CollaboratorFailure::Http {
        service: Service::Mapbox,
        status: 503,
        message: "unavailable".into(),
    }))
}

fn success() -> WorkVerdict {
    WorkVerdict::Succeeded(TileResult {
        label: "NO".into(),
        confidence: 0.8,
        reasoning: None,
        artifact: None,
    })
}

#[tokio::test]
async fn concurrent_claims_have_exactly_one_winner() {
    let fx = fixture(3).await;
    let job_key = key(RUN, TILE);

    let attempts = (0..16).map(|_| {
        let protocol = Arc::clone(&fx.protocol);
        let job_key = job_key.clone();
        tokio::spawn(async move {
            protocol.claim(&job_key, WorkerToken::new()).await
        })
    });
    let outcomes: Vec<ClaimOutcome> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.expect("task").expect("claim"))
        .collect();

    let winners = outcomes
        .iter()
        .filter(|o| matches!(o, ClaimOutcome::Claimed { .. }))
        .count();
    let losers = outcomes
        .iter()
        .filter(|o| matches!(o, ClaimOutcome::AlreadyClaimed { .. }))
        .count();
    assert_eq!(winners, 1);
    assert_eq!(losers, 15);

    let stored = fx.store.get_tile_job(&job_key).await.expect("get").expect("job");
    assert_eq!(stored.attempt_count, 1);
    assert_eq!(stored.status, TileJobStatus::Claimed);
}

#[tokio::test]
async fn expired_lease_is_reclaimed_by_another_token() {
    let fx = fixture(3).await;
    let job_key = key(RUN, TILE);
    let first = WorkerToken::new();
    let second = WorkerToken::new();

    let ClaimOutcome::Claimed { lease: stale, .. } =
        fx.protocol.claim(&job_key, first).await.expect("claim")
    else {
        panic!("first claim should win");
    };

    fx.clock.advance(Duration::seconds(5));
    assert!(matches!(
        fx.protocol.claim(&job_key, second).await.expect("claim"),
        ClaimOutcome::AlreadyClaimed { .. }
    ));

    fx.clock.advance(Duration::seconds(6));
    let ClaimOutcome::Claimed { lease, job } =
        fx.protocol.claim(&job_key, second).await.expect("claim")
    else {
        panic!("expired lease should be reclaimable");
    };
    assert_eq!(job.attempt_count, 2);
    assert_eq!(job.lock_owner, Some(second));
    assert_eq!(lease.attempt, 2);

    // The superseded owner can neither renew nor release.
    assert_eq!(fx.protocol.renew(&stale).await.expect("renew"), None);
    assert_eq!(
        fx.protocol.release(&stale, success()).await.expect("release"),
        ReleaseOutcome::OwnershipLost
    );
    let stored = fx.store.get_tile_job(&job_key).await.expect("get").expect("job");
    assert_eq!(stored.status, TileJobStatus::Claimed);
    assert_eq!(stored.lock_owner, Some(second));
    assert!(stored.result.is_none());
}

#[tokio::test]
async fn owner_can_renew_and_release() {
    let fx = fixture(3).await;
    let job_key = key(RUN, TILE);
    let token = WorkerToken::new();
    let ClaimOutcome::Claimed { lease, .. } =
        fx.protocol.claim(&job_key, token).await.expect("claim")
    else {
        panic!("claim should win");
    };

    assert!(matches!(
        fx.protocol.begin_processing(&lease).await.expect("processing"),
        LeaseWrite::Held(ref job) if job.status == TileJobStatus::Processing
    ));

    fx.clock.advance(Duration::seconds(8));
    let renewed = fx
        .protocol
        .renew(&lease)
        .await
        .expect("renew")
        .expect("still owner");
    assert!(renewed.expires_at > lease.expires_at);

    // Past the original expiry but inside the renewed one.
    fx.clock.advance(Duration::seconds(5));
    assert!(matches!(
        fx.protocol.claim(&job_key, WorkerToken::new()).await.expect("claim"),
        ClaimOutcome::AlreadyClaimed { .. }
    ));

    let released = fx.protocol.release(&renewed, success()).await.expect("release");
    let ReleaseOutcome::Released { job, terminal } = released else {
        panic!("owner release should apply");
    };
    assert_eq!(terminal, Some(TileOutcome::Succeeded));
    assert_eq!(job.status, TileJobStatus::Succeeded);
    assert_eq!(job.lock_owner, None);
    assert!(job.finished_at.is_some());

    // Terminal jobs cannot be renewed or reclaimed.
    assert_eq!(fx.protocol.renew(&renewed).await.expect("renew"), None);
    assert!(matches!(
        fx.protocol.claim(&job_key, WorkerToken::new()).await.expect("claim"),
        ClaimOutcome::Finished(_)
    ));
}

#[tokio::test]
async fn missing_job_reports_not_found() {
    let fx = fixture(3).await;
    let outcome = fx
        .protocol
        .claim(&key(RUN, "6/0/0"), WorkerToken::new())
        .await
        .expect("claim");
    assert_eq!(outcome, ClaimOutcome::NotFound);
}

#[tokio::test]
async fn out_of_range_lease_is_rejected_without_writing() {
    let fx = fixture(3).await;
    let job_key = key(RUN, TILE);

    let err = fx
        .protocol
        .claim_for(&job_key, WorkerToken::new(), Duration::days(400_000_000))
        .await
        .expect_err("lease past the end of time");
    assert!(matches!(err, CoreError::InvalidConfig(_)));

    let oversized = LeaseProtocol::new(
        Arc::new(fx.store.clone()),
        Arc::new(fx.clock.clone()),
        LeaseConfig {
            lease_ttl_secs: i64::MAX / 2,
            ..LeaseConfig::default()
        },
        RetryConfig::default(),
    );
    let err = oversized
        .claim(&job_key, WorkerToken::new())
        .await
        .expect_err("ttl out of range");
    assert!(matches!(err, CoreError::InvalidConfig(_)));

    let job = fx.store.get_tile_job(&job_key).await.expect("get").expect("job");
    assert_eq!(job.status, TileJobStatus::Pending);
    assert_eq!(job.attempt_count, 0);
}

#[tokio::test]
async fn attempts_never_exceed_retry_budget() {
    let max_retries = 2;
    let fx = fixture(max_retries).await;
    let job_key = key(RUN, TILE);

    let mut terminal = None;
    for _ in 0..10 {
        match fx.protocol.claim(&job_key, WorkerToken::new()).await.expect("claim") {
            ClaimOutcome::Claimed { lease, job } => {
                assert!(job.attempt_count <= max_retries + 1);
                let ReleaseOutcome::Released { terminal: t, .. } =
                    fx.protocol.release(&lease, transient()).await.expect("release")
                else {
                    panic!("owner release should apply");
                };
                if t.is_some() {
                    terminal = t;
                }
            }
            ClaimOutcome::Finished(job) => {
                assert_eq!(job.attempt_count, max_retries + 1);
                break;
            }
            other => panic!("unexpected claim outcome {other:?}"),
        }
    }
    assert_eq!(terminal, Some(TileOutcome::Failed));

    let stored = fx.store.get_tile_job(&job_key).await.expect("get").expect("job");
    assert_eq!(stored.attempt_count, max_retries + 1);
    assert_eq!(stored.status, TileJobStatus::Failed);
    assert!(stored.is_terminal());
    assert_eq!(
        stored.last_error.map(|e| e.classification),
        Some(ErrorClass::Transient)
    );
}

#[tokio::test]
async fn stale_lease_on_final_attempt_is_closed_out() {
    let fx = fixture(1).await;
    let job_key = key(RUN, TILE);

    for _ in 0..2 {
        assert!(matches!(
            fx.protocol.claim(&job_key, WorkerToken::new()).await.expect("claim"),
            ClaimOutcome::Claimed { .. }
        ));
        fx.clock.advance(Duration::seconds(11));
    }

    let outcome = fx
        .protocol
        .claim(&job_key, WorkerToken::new())
        .await
        .expect("claim");
    let ClaimOutcome::Finished(job) = outcome else {
        panic!("exhausted stale lease should be closed, got {outcome:?}");
    };
    assert_eq!(job.attempt_count, 2);
    assert_eq!(job.status, TileJobStatus::Failed);
    assert!(job.is_terminal());
    let error = job.last_error.expect("error recorded");
    assert_eq!(error.code, "RETRY_EXHAUSTED");
    assert_eq!(error.classification, ErrorClass::Transient);
}

#[tokio::test]
async fn renewal_is_due_only_near_expiry() {
    let fx = fixture(3).await;
    let ClaimOutcome::Claimed { mut lease, .. } = fx
        .protocol
        .claim(&key(RUN, TILE), WorkerToken::new())
        .await
        .expect("claim")
    else {
        panic!("claim should win");
    };
    let original = lease.expires_at;

    fx.clock.advance(Duration::seconds(2));
    assert!(fx.protocol.renew_if_due(&mut lease).await.expect("renew"));
    assert_eq!(lease.expires_at, original);

    fx.clock.advance(Duration::seconds(5));
    assert!(fx.protocol.renew_if_due(&mut lease).await.expect("renew"));
    assert!(lease.expires_at > original);
}
