//! Builder pattern for the compute engine.

use std::sync::Arc;

use trellis_traits::config::EngineConfig;
use trellis_traits::market_data::MarketDataProvider;

use crate::cache::ComputationCache;
use crate::config::{validate_engine_config, FunctionRepositoryConfig, TrellisConfig};
use crate::error::EngineError;
use crate::function::FunctionCatalogue;
use crate::market_data::{MarketDataAvailabilityProvider, MarketDataFanout, NoMarketData};
use crate::repository::FunctionRepository;
use crate::scheduler::JobScheduler;
use crate::target::ComputationTargetResolver;
use crate::worker::{CalculationWorker, LocalWorker, WorkerPool};
use crate::ComputeEngine;

/// Builder for constructing a [`ComputeEngine`].
pub struct ComputeEngineBuilder {
    config: Option<EngineConfig>,
    repository: Option<Arc<dyn FunctionRepository>>,
    repository_config: Option<FunctionRepositoryConfig>,
    catalogue: Option<Arc<FunctionCatalogue>>,
    targets: Option<Arc<dyn ComputationTargetResolver>>,
    market_data: Option<Arc<dyn MarketDataProvider>>,
    availability: Option<Arc<dyn MarketDataAvailabilityProvider>>,
    workers: Vec<Arc<dyn CalculationWorker>>,
    local_workers: usize,
    cache: Option<Arc<ComputationCache>>,
}

impl ComputeEngineBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: None,
            repository: None,
            repository_config: None,
            catalogue: None,
            targets: None,
            market_data: None,
            availability: None,
            workers: Vec::new(),
            local_workers: 0,
            cache: None,
        }
    }

    /// Set the engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Apply a loaded configuration file: engine settings and repository entries.
    pub fn with_trellis_config(mut self, config: TrellisConfig) -> Self {
        self.config = Some(config.engine);
        self.repository_config = Some(config.repository);
        self
    }

    /// Set the function repository.
    pub fn with_repository(mut self, repository: Arc<dyn FunctionRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Build the repository from configuration entries and the catalogue.
    pub fn with_repository_config(mut self, config: FunctionRepositoryConfig) -> Self {
        self.repository_config = Some(config);
        self
    }

    /// Set the catalogue of compiled functions, used by local workers and
    /// repository configuration.
    pub fn with_catalogue(mut self, catalogue: Arc<FunctionCatalogue>) -> Self {
        self.catalogue = Some(catalogue);
        self
    }

    /// Set the computation target resolver.
    pub fn with_target_resolver(mut self, targets: Arc<dyn ComputationTargetResolver>) -> Self {
        self.targets = Some(targets);
        self
    }

    /// Set the market data feed.
    pub fn with_market_data(mut self, provider: Arc<dyn MarketDataProvider>) -> Self {
        self.market_data = Some(provider);
        self
    }

    /// Set which requirements market data satisfies.
    pub fn with_availability(mut self, availability: Arc<dyn MarketDataAvailabilityProvider>) -> Self {
        self.availability = Some(availability);
        self
    }

    /// Add a worker.
    pub fn with_worker(mut self, worker: Arc<dyn CalculationWorker>) -> Self {
        self.workers.push(worker);
        self
    }

    /// Add in-process workers executing against the catalogue.
    pub fn with_local_workers(mut self, count: usize) -> Self {
        self.local_workers = count;
        self
    }

    /// Share an existing cache.
    pub fn with_cache(mut self, cache: Arc<ComputationCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Build the compute engine.
    pub fn build(self) -> Result<ComputeEngine, EngineError> {
        let config = self.config.unwrap_or_default();
        validate_engine_config(&config)?;

        let repository: Arc<dyn FunctionRepository> = match (self.repository, &self.repository_config) {
            (Some(repository), _) => repository,
            (None, Some(entries)) => {
                let catalogue = self.catalogue.as_ref().ok_or_else(|| {
                    EngineError::ConfigError("repository configuration requires a function catalogue".into())
                })?;
                Arc::new(entries.build_repository(catalogue)?)
            }
            (None, None) => return Err(EngineError::ConfigError("function repository not configured".into())),
        };

        let targets = self
            .targets
            .ok_or_else(|| EngineError::ConfigError("target resolver not configured".into()))?;

        let market_data = self
            .market_data
            .ok_or_else(|| EngineError::ConfigError("market_data not configured".into()))?;

        let availability = self.availability.unwrap_or_else(|| Arc::new(NoMarketData));

        let mut workers = self.workers;
        if self.local_workers > 0 {
            let catalogue = self
                .catalogue
                .ok_or_else(|| EngineError::ConfigError("local workers require a function catalogue".into()))?;
            for i in 0..self.local_workers {
                workers.push(Arc::new(LocalWorker::new(format!("local-{}", i), Arc::clone(&catalogue))));
            }
        }
        if workers.is_empty() {
            return Err(EngineError::ConfigError("no workers configured".into()));
        }
        let pool = workers
            .into_iter()
            .fold(WorkerPool::new(config.scheduler.worker_capacity), |pool, w| pool.with_worker(w));

        let cache = self.cache.unwrap_or_default();
        let scheduler = Arc::new(JobScheduler::new(Arc::new(pool), cache, config.scheduler.clone()));

        Ok(ComputeEngine::new(
            config,
            repository,
            targets,
            availability,
            MarketDataFanout::new(market_data),
            scheduler,
        ))
    }
}

impl Default for ComputeEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
