#![cfg(feature = "postgres")]

mod common;

use std::sync::Arc;

use sqlx::PgPool;

use pyrolysis_core::contracts::store::{
    ConditionalWrite, RunCondition, RunStore, RunUpdate, TileJobCondition,
    TileJobStore, TileJobUpdate,
};
use pyrolysis_core::infra::postgres::PostgresRecordStore;
use pyrolysis_core::model::{
    Run, RunId, RunStatus, SchemaKind, TileJob, TileJobStatus, TileOutcome,
    WorkerToken,
};
use pyrolysis_core::{ClaimOutcome, LeaseConfig, LeaseProtocol, RetryConfig};

use common::{key, mapbox, start};

#[sqlx::test(migrator = "pyrolysis_core::infra::postgres::MIGRATOR")]
async fn create_if_absent_is_exclusive(pool: PgPool) {
    let store = PostgresRecordStore::new(pool).await.expect("store");
    let job = TileJob::pending(RunId::new("run_pg"), mapbox(4, 2, 2), start());

    let first = store
        .put_tile_job(job.clone(), TileJobCondition::NotExists)
        .await
        .expect("put");
    assert!(matches!(first, ConditionalWrite::Applied(_)));

    let second = store
        .put_tile_job(job, TileJobCondition::NotExists)
        .await
        .expect("put");
    let ConditionalWrite::Rejected(Some(existing)) = second else {
        panic!("second create should be rejected with the stored record");
    };
    assert_eq!(existing.status, TileJobStatus::Pending);
}

#[sqlx::test(migrator = "pyrolysis_core::infra::postgres::MIGRATOR")]
async fn conditional_update_checks_the_stored_state(pool: PgPool) {
    let store = PostgresRecordStore::new(pool).await.expect("store");
    let job = TileJob::pending(RunId::new("run_pg"), mapbox(4, 2, 3), start());
    let job_key = job.key();
    store
        .put_tile_job(job, TileJobCondition::NotExists)
        .await
        .expect("put");

    let rejected = store
        .update_tile_job(
            &job_key,
            TileJobUpdate::at(start()).status(TileJobStatus::Processing),
            TileJobCondition::StatusIn(vec![TileJobStatus::Claimed]),
        )
        .await
        .expect("update");
    assert!(matches!(rejected, ConditionalWrite::Rejected(Some(_))));

    let missing = store
        .update_tile_job(
            &key("run_pg", "9/9/9"),
            TileJobUpdate::at(start()).status(TileJobStatus::Claimed),
            TileJobCondition::Always,
        )
        .await
        .expect("update");
    assert_eq!(missing, ConditionalWrite::Rejected(None));

    let listed = store
        .list_tile_jobs(&RunId::new("run_pg"))
        .await
        .expect("list");
    assert_eq!(listed.len(), 1);
}

#[sqlx::test(migrator = "pyrolysis_core::infra::postgres::MIGRATOR")]
async fn concurrent_claims_serialize_on_the_row(pool: PgPool) {
    let store = Arc::new(PostgresRecordStore::new(pool).await.expect("store"));
    let job = TileJob::pending(RunId::new("run_pg"), mapbox(5, 1, 1), start());
    let job_key = job.key();
    store
        .put_tile_job(job, TileJobCondition::NotExists)
        .await
        .expect("put");

    let protocol = Arc::new(LeaseProtocol::new(
        store,
        Arc::new(pyrolysis_core::SystemClock),
        LeaseConfig::default(),
        RetryConfig::default(),
    ));
    let claims = (0..8).map(|_| {
        let protocol = Arc::clone(&protocol);
        let job_key = job_key.clone();
        tokio::spawn(async move {
            protocol.claim(&job_key, WorkerToken::new()).await
        })
    });
    let winners = futures::future::join_all(claims)
        .await
        .into_iter()
        .map(|joined| joined.expect("task").expect("claim"))
        .filter(|outcome| matches!(outcome, ClaimOutcome::Claimed { .. }))
        .count();
    assert_eq!(winners, 1);
}

#[sqlx::test(migrator = "pyrolysis_core::infra::postgres::MIGRATOR")]
async fn run_tally_counts_once(pool: PgPool) {
    let store = PostgresRecordStore::new(pool).await.expect("store");
    let run_id = RunId::new("run_pg_tally");
    let run = Run::new(run_id.clone(), SchemaKind::MapboxZxy, None, start());
    store
        .put_run(run, RunCondition::NotExists)
        .await
        .expect("put run");
    let tile = mapbox(3, 1, 1).tile_id();
    store
        .update_run(
            &run_id,
            RunUpdate::at(start())
                .status(RunStatus::Ingesting)
                .register_tiles(vec![tile.clone()]),
            RunCondition::Exists,
        )
        .await
        .expect("register");

    for _ in 0..2 {
        store
            .update_run(
                &run_id,
                RunUpdate::at(start()).tally(tile.clone(), TileOutcome::Failed),
                RunCondition::TilePending(tile.clone()),
            )
            .await
            .expect("tally");
    }
    let stored = store.get_run(&run_id).await.expect("get").expect("run");
    assert_eq!(stored.failed_count, 1);
    assert_eq!(stored.pending_count, 0);
    assert_eq!(stored.total_tiles, 1);
}
