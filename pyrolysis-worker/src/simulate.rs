//! Local end-to-end simulation over the in-memory backends.
//!
//! Synthetic collaborators stand in for the imagery and vision services and
//! fail at configurable rates, which exercises claiming, retries, redrive and
//! run completion without any external system.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use pyrolysis_core::contracts::collaborators::{
    Classification, CollaboratorFailure, ImageryFetcher, VisionClassifier,
};
use pyrolysis_core::contracts::store::RunStore;
use pyrolysis_core::infra::memory::{
    InMemoryArtifactStore, InMemoryQueue, InMemoryRecordStore,
};
use pyrolysis_core::model::{
    RunId, RunStatus, SchemaKind, Service, SourceRef, TileCoordinates,
};
use pyrolysis_core::worker::imagery_service;
use pyrolysis_core::{
    Clock, Collaborators, Disposition, Engine, EngineConfig, IngestRow,
    IngestionReport, IngestionRequest, SystemClock, WorkerOrchestrator,
};

/// Failure injection shared by both synthetic services.
#[derive(Debug)]
struct Faults {
    transient_rate: f64,
    permanent_rate: f64,
    latency: Duration,
    rng: Mutex<StdRng>,
}

enum Roll {
    Pass,
    Transient,
    Permanent,
}

impl Faults {
    async fn roll(&self) -> (Roll, f64) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut rng = self.rng.lock().await;
        let fault: f64 = rng.random();
        let extra: f64 = rng.random();
        let roll = if fault < self.transient_rate {
            Roll::Transient
        } else if fault < self.transient_rate + self.permanent_rate {
            Roll::Permanent
        } else {
            Roll::Pass
        };
        (roll, extra)
    }
}

#[derive(Debug)]
struct SyntheticFetcher {
    faults: Arc<Faults>,
}

#[async_trait]
impl ImageryFetcher for SyntheticFetcher {
    async fn fetch(
        &self,
        coordinates: &TileCoordinates,
    ) -> Result<Vec<u8>, CollaboratorFailure> {
        let service = imagery_service(coordinates);
        match self.faults.roll().await.0 {
            Roll::Transient => Err(CollaboratorFailure::Http {
                service,
                status: 503,
                message: "synthetic outage".into(),
            }),
            Roll::Permanent => Err(CollaboratorFailure::Http {
                service,
                status: 404,
                message: "synthetic missing tile".into(),
            }),
            Roll::Pass => Ok(coordinates.tile_id().as_str().as_bytes().to_vec()),
        }
    }
}

#[derive(Debug)]
struct SyntheticVision {
    faults: Arc<Faults>,
}

#[async_trait]
impl VisionClassifier for SyntheticVision {
    async fn classify(
        &self,
        _image: &[u8],
    ) -> Result<Classification, CollaboratorFailure> {
        let (roll, extra) = self.faults.roll().await;
        match roll {
            Roll::Transient => Err(CollaboratorFailure::Http {
                service: Service::Vision,
                status: 429,
                message: "synthetic throttle".into(),
            }),
            Roll::Permanent => Err(CollaboratorFailure::Http {
                service: Service::Vision,
                status: 400,
                message: "synthetic rejected image".into(),
            }),
            Roll::Pass => Ok(Classification {
                label: if extra < 0.2 { "YES" } else { "NO" }.into(),
                confidence: (0.5 + extra / 2.0) as f32,
                reasoning: None,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub workers: usize,
    pub transient_rate: f64,
    pub permanent_rate: f64,
    pub latency: Duration,
    pub seed: Option<u64>,
    /// How long a received message stays hidden before redelivery.
    pub visibility: Duration,
    /// Pause between empty receives.
    pub idle_poll: Duration,
    /// Bound on each synthetic external call.
    pub request_timeout: Duration,
}

impl SimulationOptions {
    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.workers > 0, "at least one worker is required");
        anyhow::ensure!(
            !self.request_timeout.is_zero(),
            "request timeout must be positive"
        );
        for (name, rate) in [
            ("transient failure rate", self.transient_rate),
            ("permanent failure rate", self.permanent_rate),
        ] {
            anyhow::ensure!(
                (0.0..=1.0).contains(&rate),
                "{name} must be within 0..=1, got {rate}"
            );
        }
        anyhow::ensure!(
            self.transient_rate + self.permanent_rate <= 1.0,
            "failure rates add up to more than 1"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeliveryStats {
    pub deliveries: u64,
    pub acked: u64,
    pub left_for_redelivery: u64,
}

impl DeliveryStats {
    fn merge(&mut self, other: &DeliveryStats) {
        self.deliveries += other.deliveries;
        self.acked += other.acked;
        self.left_for_redelivery += other.left_for_redelivery;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    pub total_tiles: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub pending: u64,
    pub artifacts: usize,
    pub ingestion: IngestionReport,
    pub delivery: DeliveryStats,
    pub elapsed_ms: u64,
}

pub struct Simulation {
    engine: Engine,
    store: InMemoryRecordStore,
    queue: InMemoryQueue,
    artifacts: InMemoryArtifactStore,
    collaborators: Collaborators,
    options: SimulationOptions,
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("engine", &self.engine)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Simulation {
    pub fn new(
        config: EngineConfig,
        artifact_bucket: &str,
        clock: Arc<dyn Clock>,
        options: SimulationOptions,
    ) -> anyhow::Result<Self> {
        options.validate()?;
        let store = InMemoryRecordStore::new();
        let queue = InMemoryQueue::new(Arc::clone(&clock));
        let artifacts = InMemoryArtifactStore::new(artifact_bucket);
        let engine = Engine::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(queue.clone()),
            clock,
            config,
        )
        .context("invalid engine configuration")?;

        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let faults = Arc::new(Faults {
            transient_rate: options.transient_rate,
            permanent_rate: options.permanent_rate,
            latency: options.latency,
            rng: Mutex::new(rng),
        });
        let collaborators = Collaborators::new(
            Arc::new(SyntheticFetcher {
                faults: Arc::clone(&faults),
            }),
            Arc::new(SyntheticVision { faults }),
            Arc::new(artifacts.clone()),
        )
        .with_request_timeout(options.request_timeout);

        Ok(Self {
            engine,
            store,
            queue,
            artifacts,
            collaborators,
            options,
        })
    }

    /// Ingests the rows, runs the workers until the queue drains and reports
    /// the final run state.
    pub async fn run(
        &self,
        run_id: RunId,
        schema_kind: SchemaKind,
        source: Option<SourceRef>,
        rows: Vec<IngestRow>,
    ) -> anyhow::Result<SimulationSummary> {
        let started = Instant::now();
        let ingestion = self
            .engine
            .dispatcher()
            .ingest(IngestionRequest {
                run_id: run_id.clone(),
                schema_kind,
                source,
                rows,
            })
            .await
            .context("ingestion failed")?;

        let worker = Arc::new(self.engine.worker(self.collaborators.clone()));
        let tasks: Vec<_> = (0..self.options.workers)
            .map(|idx| {
                let worker = Arc::clone(&worker);
                let queue = self.queue.clone();
                let options = self.options.clone();
                tokio::spawn(async move {
                    drain(idx, &worker, &queue, &options).await
                })
            })
            .collect();

        let mut delivery = DeliveryStats::default();
        for joined in futures::future::join_all(tasks).await {
            let stats = joined.context("worker task panicked")?;
            delivery.merge(&stats);
        }

        let run = self
            .store
            .get_run(&run_id)
            .await
            .context("failed to load run")?
            .with_context(|| format!("run {run_id} disappeared"))?;
        let summary = SimulationSummary {
            run_id,
            status: run.status,
            total_tiles: run.total_tiles,
            succeeded: run.succeeded_count,
            failed: run.failed_count,
            pending: run.pending_count,
            artifacts: self.artifacts.len().await,
            ingestion,
            delivery,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            run_id = %summary.run_id,
            status = summary.status.as_str(),
            succeeded = summary.succeeded,
            failed = summary.failed,
            deliveries = summary.delivery.deliveries,
            "simulation finished"
        );
        Ok(summary)
    }
}

/// One worker's receive loop. Exits once nothing is left in the queue,
/// visible or not.
async fn drain(
    idx: usize,
    worker: &WorkerOrchestrator,
    queue: &InMemoryQueue,
    options: &SimulationOptions,
) -> DeliveryStats {
    let mut stats = DeliveryStats::default();
    loop {
        let batch = queue.receive(1, options.visibility).await;
        if batch.is_empty() {
            if queue.outstanding().await == 0 {
                debug!(worker = idx, "queue drained");
                return stats;
            }
            tokio::time::sleep(options.idle_poll).await;
            continue;
        }
        for message in batch {
            stats.deliveries += 1;
            match worker.handle_raw(&message.body).await {
                Disposition::Ack => {
                    queue.ack(message.receipt).await;
                    stats.acked += 1;
                }
                Disposition::Retry => stats.left_for_redelivery += 1,
            }
        }
    }
}

/// Simulator over the wall clock.
pub fn with_system_clock(
    config: EngineConfig,
    artifact_bucket: &str,
    options: SimulationOptions,
) -> anyhow::Result<Simulation> {
    Simulation::new(config, artifact_bucket, Arc::new(SystemClock), options)
}
