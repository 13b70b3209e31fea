#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mockall::mock;

use pyrolysis_core::contracts::collaborators::{
    ArtifactStore, Classification, CollaboratorFailure, ImageryFetcher,
    VisionClassifier,
};
use pyrolysis_core::contracts::store::{
    ConditionalWrite, RunStore, StoreError, TileJobCondition, TileJobStore,
    TileJobUpdate,
};
use pyrolysis_core::infra::memory::{
    InMemoryArtifactStore, InMemoryQueue, InMemoryRecordStore,
};
use pyrolysis_core::model::{
    Run, RunId, SchemaKind, TileCoordinates, TileId, TileJob, TileJobKey,
};
use pyrolysis_core::{
    Collaborators, Disposition, Engine, EngineConfig, IngestRow,
    IngestionReport, IngestionRequest, ManualClock, WorkerOrchestrator,
};

mock! {
    pub Fetcher {}

    #[async_trait]
    impl ImageryFetcher for Fetcher {
        async fn fetch(
            &self,
            coordinates: &TileCoordinates,
        ) -> Result<Vec<u8>, CollaboratorFailure>;
    }
}

mock! {
    pub Vision {}

    #[async_trait]
    impl VisionClassifier for Vision {
        async fn classify(
            &self,
            image: &[u8],
        ) -> Result<Classification, CollaboratorFailure>;
    }
}

pub const VISIBILITY: Duration = Duration::from_secs(60);

pub fn start() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
        .expect("timestamp")
        .with_timezone(&Utc)
}

pub fn yes() -> Classification {
    Classification {
        label: "YES".into(),
        confidence: 0.92,
        reasoning: Some("char scar visible".into()),
    }
}

pub fn mapbox(z: u8, x: u32, y: u32) -> TileCoordinates {
    TileCoordinates::mapbox(z, x, y).expect("valid coordinates")
}

pub fn key(run: &str, tile: &str) -> TileJobKey {
    TileJobKey::new(RunId::new(run), TileId::from_raw(tile))
}

pub struct Harness {
    pub clock: ManualClock,
    pub store: InMemoryRecordStore,
    pub queue: InMemoryQueue,
    pub artifacts: InMemoryArtifactStore,
    pub engine: Engine,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let store = InMemoryRecordStore::new();
        Self::assemble(config, store.clone(), Arc::new(store))
    }

    /// Tile job updates go through a store whose `nth` update fails.
    pub fn with_failing_update(nth: usize) -> Self {
        let store = InMemoryRecordStore::new();
        let flaky = FailingUpdates {
            inner: store.clone(),
            calls: AtomicUsize::new(0),
            fail_on: nth,
        };
        Self::assemble(EngineConfig::default(), store, Arc::new(flaky))
    }

    fn assemble(
        config: EngineConfig,
        store: InMemoryRecordStore,
        tile_jobs: Arc<dyn TileJobStore>,
    ) -> Self {
        let clock = ManualClock::new(start());
        let queue = InMemoryQueue::new(Arc::new(clock.clone()));
        let engine = Engine::new(
            tile_jobs,
            Arc::new(store.clone()),
            Arc::new(queue.clone()),
            Arc::new(clock.clone()),
            config,
        )
        .expect("engine");
        Self {
            clock,
            store,
            queue,
            artifacts: InMemoryArtifactStore::new("artifacts"),
            engine,
        }
    }

    pub fn worker(
        &self,
        fetcher: MockFetcher,
        vision: MockVision,
    ) -> WorkerOrchestrator {
        self.engine.worker(Collaborators::new(
            Arc::new(fetcher),
            Arc::new(vision),
            Arc::new(self.artifacts.clone()),
        ))
    }

    pub async fn ingest(
        &self,
        run: &str,
        tiles: Vec<TileCoordinates>,
    ) -> IngestionReport {
        let rows = tiles
            .into_iter()
            .enumerate()
            .map(|(idx, coords)| IngestRow {
                line: idx + 1,
                parsed: Ok(coords),
            })
            .collect();
        self.engine
            .dispatcher()
            .ingest(IngestionRequest {
                run_id: RunId::new(run),
                schema_kind: SchemaKind::MapboxZxy,
                source: None,
                rows,
            })
            .await
            .expect("ingest")
    }

    /// Delivers messages until the queue is empty, jumping the clock to
    /// delayed messages. Returns the number of deliveries.
    pub async fn drain(&self, worker: &WorkerOrchestrator) -> usize {
        let mut deliveries = 0;
        for _ in 0..1_000 {
            let batch = self.queue.receive(10, VISIBILITY).await;
            if batch.is_empty() {
                match self.queue.next_visible_at().await {
                    Some(at) => {
                        self.clock.set(at.max(self.clock_now()));
                        continue;
                    }
                    None => return deliveries,
                }
            }
            for message in batch {
                deliveries += 1;
                if worker.handle_raw(&message.body).await == Disposition::Ack {
                    self.queue.ack(message.receipt).await;
                }
            }
        }
        panic!("queue did not drain");
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        use pyrolysis_core::Clock;
        self.clock.now()
    }

    pub async fn run(&self, run: &str) -> Run {
        self.store
            .get_run(&RunId::new(run))
            .await
            .expect("get run")
            .expect("run exists")
    }

    pub async fn job(&self, run: &str, tile: &str) -> TileJob {
        self.store
            .get_tile_job(&key(run, tile))
            .await
            .expect("get job")
            .expect("job exists")
    }
}

/// Artifact store that always refuses writes.
#[derive(Debug)]
pub struct BrokenArtifacts;

#[async_trait]
impl ArtifactStore for BrokenArtifacts {
    async fn put(
        &self,
        _key: &str,
        _bytes: &[u8],
    ) -> Result<pyrolysis_core::model::ArtifactRef, CollaboratorFailure> {
        Err(CollaboratorFailure::ArtifactPut {
            message: "bucket unavailable".into(),
        })
    }

    async fn get(
        &self,
        _artifact: &pyrolysis_core::model::ArtifactRef,
    ) -> Result<Vec<u8>, CollaboratorFailure> {
        Err(CollaboratorFailure::ArtifactGet {
            message: "bucket unavailable".into(),
        })
    }
}

/// Turns the record store off as soon as imagery has been fetched.
#[derive(Debug)]
pub struct StoreOutageFetcher {
    pub store: InMemoryRecordStore,
}

#[async_trait]
impl ImageryFetcher for StoreOutageFetcher {
    async fn fetch(
        &self,
        _coordinates: &TileCoordinates,
    ) -> Result<Vec<u8>, CollaboratorFailure> {
        self.store.set_unavailable(true).await;
        Ok(vec![1, 2, 3])
    }
}

/// Never answers.
#[derive(Debug)]
pub struct StalledFetcher;

#[async_trait]
impl ImageryFetcher for StalledFetcher {
    async fn fetch(
        &self,
        _coordinates: &TileCoordinates,
    ) -> Result<Vec<u8>, CollaboratorFailure> {
        std::future::pending().await
    }
}

/// Tile job store whose `fail_on`-th update (1-based) errors out.
#[derive(Debug)]
pub struct FailingUpdates {
    inner: InMemoryRecordStore,
    calls: AtomicUsize,
    fail_on: usize,
}

#[async_trait]
impl TileJobStore for FailingUpdates {
    async fn get_tile_job(
        &self,
        key: &TileJobKey,
    ) -> Result<Option<TileJob>, StoreError> {
        self.inner.get_tile_job(key).await
    }

    async fn put_tile_job(
        &self,
        job: TileJob,
        condition: TileJobCondition,
    ) -> Result<ConditionalWrite<TileJob>, StoreError> {
        self.inner.put_tile_job(job, condition).await
    }

    async fn update_tile_job(
        &self,
        key: &TileJobKey,
        update: TileJobUpdate,
        condition: TileJobCondition,
    ) -> Result<ConditionalWrite<TileJob>, StoreError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on {
            return Err(StoreError::Unavailable("update dropped".into()));
        }
        self.inner.update_tile_job(key, update, condition).await
    }

    async fn list_tile_jobs(
        &self,
        run_id: &RunId,
    ) -> Result<Vec<TileJob>, StoreError> {
        self.inner.list_tile_jobs(run_id).await
    }
}
