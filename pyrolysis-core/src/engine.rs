use std::fmt;
use std::sync::Arc;

use pyrolysis_contracts::queue::TileQueue;
use pyrolysis_contracts::store::{RunStore, TileJobStore};

use crate::aggregator::RunAggregator;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::dispatcher::IngestionDispatcher;
use crate::error::Result;
use crate::lease::LeaseProtocol;
use crate::worker::{Collaborators, WorkerOrchestrator};

/// Wires the engine components over one set of backends.
pub struct Engine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    queue: Arc<dyn TileQueue>,
    lease: Arc<LeaseProtocol>,
    aggregator: Arc<RunAggregator>,
    dispatcher: IngestionDispatcher,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(
        tile_jobs: Arc<dyn TileJobStore>,
        runs: Arc<dyn RunStore>,
        queue: Arc<dyn TileQueue>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let lease = Arc::new(LeaseProtocol::new(
            Arc::clone(&tile_jobs),
            Arc::clone(&clock),
            config.lease,
            config.retry,
        ));
        let aggregator =
            Arc::new(RunAggregator::new(Arc::clone(&runs), Arc::clone(&clock)));
        let dispatcher = IngestionDispatcher::new(
            tile_jobs,
            runs,
            Arc::clone(&queue),
            Arc::clone(&aggregator),
            Arc::clone(&clock),
            config.ingest,
        );
        Ok(Self {
            config,
            clock,
            queue,
            lease,
            aggregator,
            dispatcher,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn lease(&self) -> &Arc<LeaseProtocol> {
        &self.lease
    }

    pub fn aggregator(&self) -> &Arc<RunAggregator> {
        &self.aggregator
    }

    pub fn dispatcher(&self) -> &IngestionDispatcher {
        &self.dispatcher
    }

    pub fn worker(&self, collaborators: Collaborators) -> WorkerOrchestrator {
        WorkerOrchestrator::new(
            Arc::clone(&self.lease),
            Arc::clone(&self.aggregator),
            Arc::clone(&self.queue),
            collaborators,
            &self.config,
            Arc::clone(&self.clock),
        )
    }
}
