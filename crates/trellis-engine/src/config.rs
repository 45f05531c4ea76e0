//! Configuration loading.
//!
//! TOML files carry the engine settings and the function repository
//! definition. Functions themselves are compiled code registered in a
//! [`FunctionCatalogue`]; the repository file only says which of them are
//! active, at what priority and in which exclusion group.
//!
//! ```toml
//! [engine]
//! name = "risk-engine"
//!
//! [engine.scheduler]
//! max_job_items = 32
//!
//! [[functions]]
//! id = "BlackScholesPV"
//! priority = 10
//! exclusion_group = "PV"
//!
//! [[functions]]
//! id = "BinomialPV"
//! exclusion_group = "PV"
//! enabled = false
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use trellis_traits::config::EngineConfig;
use trellis_traits::ids::{ExclusionGroup, FunctionId};

use crate::error::{EngineError, EngineResult};
use crate::function::FunctionCatalogue;
use crate::repository::{InMemoryFunctionRepository, RegisteredFunction};

/// One `[[functions]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionEntry {
    /// Catalogue id of the function.
    pub id: FunctionId,

    /// Higher priority candidates are tried first.
    #[serde(default)]
    pub priority: i32,

    /// Exclusion group.
    #[serde(default)]
    pub exclusion_group: Option<ExclusionGroup>,

    /// Disabled entries are skipped.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl FunctionEntry {
    /// Enabled entry with default priority.
    pub fn new(id: impl Into<FunctionId>) -> Self {
        Self {
            id: id.into(),
            priority: 0,
            exclusion_group: None,
            enabled: true,
        }
    }
}

/// Function repository ingestion format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRepositoryConfig {
    /// Entries in registration order.
    #[serde(default)]
    pub functions: Vec<FunctionEntry>,
}

impl FunctionRepositoryConfig {
    /// Checks for duplicate ids.
    pub fn validate(&self) -> EngineResult<()> {
        let mut seen = HashSet::new();
        for entry in &self.functions {
            if entry.id.as_str().is_empty() {
                return Err(EngineError::ConfigError("function entry with empty id".into()));
            }
            if !seen.insert(&entry.id) {
                return Err(EngineError::ConfigError(format!("function {} listed twice", entry.id)));
            }
        }
        Ok(())
    }

    /// Registers the enabled entries, taking definitions from the catalogue.
    ///
    /// Every enabled id must be in the catalogue.
    pub fn apply(&self, catalogue: &FunctionCatalogue, repository: &InMemoryFunctionRepository) -> EngineResult<usize> {
        self.validate()?;
        let mut registered = 0;
        for entry in self.functions.iter().filter(|e| e.enabled) {
            let function = catalogue
                .get(&entry.id)
                .ok_or_else(|| EngineError::ConfigError(format!("function {} is not in the catalogue", entry.id)))?;
            let mut function = RegisteredFunction::new(function).with_priority(entry.priority);
            if let Some(group) = &entry.exclusion_group {
                function = function.with_exclusion_group(group.clone());
            }
            repository.register(function)?;
            registered += 1;
        }
        debug!(registered, skipped = self.functions.len() - registered, "function repository configured");
        Ok(registered)
    }

    /// Builds a repository from the catalogue.
    pub fn build_repository(&self, catalogue: &FunctionCatalogue) -> EngineResult<InMemoryFunctionRepository> {
        let repository = InMemoryFunctionRepository::new();
        self.apply(catalogue, &repository)?;
        Ok(repository)
    }
}

/// A complete configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrellisConfig {
    /// Engine settings.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Function repository.
    #[serde(default, flatten)]
    pub repository: FunctionRepositoryConfig,
}

impl TrellisConfig {
    /// Parses TOML.
    pub fn from_toml_str(content: &str) -> EngineResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!(path = %path.display(), functions = config.repository.functions.len(), "configuration loaded");
        Ok(config)
    }

    /// Checks engine limits and repository entries.
    pub fn validate(&self) -> EngineResult<()> {
        validate_engine_config(&self.engine)?;
        self.repository.validate()
    }
}

/// Checks engine limits.
pub fn validate_engine_config(config: &EngineConfig) -> EngineResult<()> {
    let checks = [
        (config.resolution.max_depth == 0, "resolution.max_depth must be > 0"),
        (config.scheduler.max_job_items == 0, "scheduler.max_job_items must be > 0"),
        (config.scheduler.job_timeout_ms == 0, "scheduler.job_timeout_ms must be > 0"),
        (
            config.scheduler.max_dispatch_attempts == 0,
            "scheduler.max_dispatch_attempts must be > 0",
        ),
        (config.scheduler.worker_capacity == 0, "scheduler.worker_capacity must be > 0"),
        (
            config.cycle.result_channel_capacity == 0,
            "cycle.result_channel_capacity must be > 0",
        ),
    ];
    match checks.iter().find(|(failed, _)| *failed) {
        Some((_, message)) => Err(EngineError::ConfigError((*message).to_string())),
        None => Ok(()),
    }
}
