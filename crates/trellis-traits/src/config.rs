//! Engine configuration.
//!
//! Configuration contains:
//! - Resolution limits (depth, failure detail)
//! - Scheduling parameters (job size, deadlines, retries, worker capacity)
//! - Cycle pacing
//!
//! Configuration does NOT contain:
//! - Function definitions (see the function repository)
//! - Market data values

use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// RESOLUTION CONFIG
// =============================================================================

/// How much detail resolution failures retain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FailureDetail {
    /// Full tree: every candidate function and every unsatisfied input.
    #[default]
    Full,
    /// Top-level requirement and reason only.
    Summary,
}

/// Configuration for dependency graph building.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    /// Maximum depth of the active resolution stack.
    pub max_depth: usize,

    /// Failure detail retained for diagnostics.
    pub failure_detail: FailureDetail,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            max_depth: 256,
            failure_detail: FailureDetail::Full,
        }
    }
}

// =============================================================================
// SCHEDULER CONFIG
// =============================================================================

/// Configuration for job scheduling and dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of graph nodes batched into one job.
    pub max_job_items: usize,

    /// Deadline for a dispatched job, in milliseconds.
    pub job_timeout_ms: u64,

    /// Dispatch attempts per job for worker/transport failures (1 = no retry).
    pub max_dispatch_attempts: u32,

    /// Concurrent jobs each worker accepts.
    pub worker_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_job_items: 16,
            job_timeout_ms: 30_000,
            max_dispatch_attempts: 2,
            worker_capacity: 4,
        }
    }
}

impl SchedulerConfig {
    /// Config for in-process workers: small jobs, short deadlines.
    pub fn local() -> Self {
        Self {
            max_job_items: 4,
            job_timeout_ms: 5_000,
            max_dispatch_attempts: 1,
            worker_capacity: 2,
        }
    }

    /// Config for remote worker processes: larger batches amortise transport cost.
    pub fn distributed() -> Self {
        Self {
            max_job_items: 64,
            job_timeout_ms: 60_000,
            max_dispatch_attempts: 2,
            worker_capacity: 8,
        }
    }

    /// Job deadline as a duration.
    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }
}

// =============================================================================
// CYCLE CONFIG
// =============================================================================

/// Configuration for repeated computation cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// Minimum interval between cycles, in milliseconds.
    pub min_cycle_interval_ms: u64,

    /// Re-attempt nodes that failed in the previous cycle.
    pub retry_failed_nodes: bool,

    /// Capacity of the result broadcast channel.
    pub result_channel_capacity: usize,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            min_cycle_interval_ms: 100,
            retry_failed_nodes: true,
            result_channel_capacity: 64,
        }
    }
}

impl CycleConfig {
    /// Minimum cycle interval as a duration.
    pub fn min_cycle_interval(&self) -> Duration {
        Duration::from_millis(self.min_cycle_interval_ms)
    }
}

// =============================================================================
// ENGINE CONFIG
// =============================================================================

/// Computation engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine name/identifier
    pub name: String,

    /// Graph building
    pub resolution: ResolutionConfig,

    /// Job scheduling
    pub scheduler: SchedulerConfig,

    /// Cycle pacing
    pub cycle: CycleConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "trellis-engine".to_string(),
            resolution: ResolutionConfig::default(),
            scheduler: SchedulerConfig::default(),
            cycle: CycleConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.name, "trellis-engine");
        assert_eq!(config.scheduler.max_dispatch_attempts, 2);
        assert_eq!(config.scheduler.job_timeout(), Duration::from_secs(30));
        assert_eq!(config.cycle.min_cycle_interval(), Duration::from_millis(100));
        assert_eq!(config.resolution.failure_detail, FailureDetail::Full);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "name": "risk", "scheduler": { "max_job_items": 2 } }"#)
                .unwrap();
        assert_eq!(config.name, "risk");
        assert_eq!(config.scheduler.max_job_items, 2);
        assert_eq!(config.scheduler.worker_capacity, 4);
        assert_eq!(config.resolution.max_depth, 256);
    }
}
