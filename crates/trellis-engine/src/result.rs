//! View results delivered to consumers after each cycle.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use trellis_traits::value::DataValue;

use crate::failure::ResolutionFailure;
use crate::job::CycleId;
use crate::scheduler::ExecutionFailure;
use crate::value::{ValueRequirement, ValueSpecification};

/// What a cycle produced for one requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResultOutcome {
    /// Computed value.
    Value {
        /// Resolved specification.
        specification: ValueSpecification,
        /// The value.
        value: DataValue,
    },
    /// Resolved, but execution failed.
    Failed {
        /// Resolved specification.
        specification: ValueSpecification,
        /// Why its producer failed.
        failure: ExecutionFailure,
    },
    /// No function chain satisfies the requirement.
    Unresolved {
        /// Failure tree.
        failure: ResolutionFailure,
    },
}

/// One requested value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEntry {
    /// The requirement as declared by the view.
    pub requirement: ValueRequirement,
    /// Its outcome.
    pub outcome: ResultOutcome,
}

impl ResultEntry {
    /// The value, if computed.
    pub fn value(&self) -> Option<&DataValue> {
        match &self.outcome {
            ResultOutcome::Value { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Whether a value was computed.
    pub fn is_value(&self) -> bool {
        matches!(self.outcome, ResultOutcome::Value { .. })
    }
}

/// Cycle statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CycleStats {
    /// Nodes computed by workers this cycle.
    pub executed: usize,
    /// Function nodes whose cached outputs were reused.
    pub reused: usize,
    /// Market data keys that changed since the previous cycle.
    pub market_data_changes: usize,
    /// Whether the graph was rebuilt before the cycle.
    pub graph_rebuilt: bool,
    /// Jobs dispatched.
    pub jobs: usize,
}

/// Result of one cycle of a view.
///
/// Lists every requirement of the view, each with a value or a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewResultModel {
    /// View name.
    pub view: String,
    /// Cycle id.
    pub cycle_id: CycleId,
    /// Cycle start.
    pub started_at: DateTime<Utc>,
    /// Cycle end.
    pub finished_at: DateTime<Utc>,
    /// One entry per requirement, in view order.
    pub entries: Vec<ResultEntry>,
    /// Statistics.
    pub stats: CycleStats,
}

impl ViewResultModel {
    /// Entry for a requirement.
    pub fn entry(&self, requirement: &ValueRequirement) -> Option<&ResultEntry> {
        self.entries.iter().find(|e| &e.requirement == requirement)
    }

    /// Value for a requirement.
    pub fn value(&self, requirement: &ValueRequirement) -> Option<&DataValue> {
        self.entry(requirement).and_then(|e| e.value())
    }

    /// Computed values.
    pub fn values(&self) -> impl Iterator<Item = (&ValueSpecification, &DataValue)> {
        self.entries.iter().filter_map(|e| match &e.outcome {
            ResultOutcome::Value { specification, value } => Some((specification, value)),
            _ => None,
        })
    }

    /// Entries without a value.
    pub fn failures(&self) -> impl Iterator<Item = &ResultEntry> {
        self.entries.iter().filter(|e| !e.is_value())
    }

    /// Whether every requirement has a value.
    pub fn is_complete(&self) -> bool {
        self.entries.iter().all(|e| e.is_value())
    }

    /// Cycle duration.
    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at).to_std().unwrap_or_default()
    }

    /// JSON export.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Receives completed cycle results.
#[async_trait]
pub trait ResultListener: Send + Sync {
    /// Called once per completed, non-cancelled cycle.
    async fn on_result(&self, result: &ViewResultModel);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::FailureReason;
    use crate::value::{ComputationTargetSpecification, ValueProperties};

    fn req(name: &str) -> ValueRequirement {
        ValueRequirement::new(name, ComputationTargetSpecification::security("AAPL"))
    }

    fn model() -> ViewResultModel {
        let spec = ValueSpecification::new("PV", req("PV").target, ValueProperties::none());
        let now = Utc::now();
        ViewResultModel {
            view: "risk".into(),
            cycle_id: CycleId::new(),
            started_at: now,
            finished_at: now + chrono::Duration::milliseconds(5),
            entries: vec![
                ResultEntry {
                    requirement: req("PV"),
                    outcome: ResultOutcome::Value {
                        specification: spec.clone(),
                        value: DataValue::Double(10.0),
                    },
                },
                ResultEntry {
                    requirement: req("Delta"),
                    outcome: ResultOutcome::Failed {
                        specification: spec,
                        failure: ExecutionFailure::Timeout,
                    },
                },
                ResultEntry {
                    requirement: req("Vega"),
                    outcome: ResultOutcome::Unresolved {
                        failure: ResolutionFailure::new(req("Vega"), FailureReason::NoProvider),
                    },
                },
            ],
            stats: CycleStats::default(),
        }
    }

    #[test]
    fn test_lookup_and_partition() {
        let m = model();
        assert_eq!(m.value(&req("PV")), Some(&DataValue::Double(10.0)));
        assert_eq!(m.value(&req("Delta")), None);
        assert_eq!(m.values().count(), 1);
        assert_eq!(m.failures().count(), 2);
        assert!(!m.is_complete());
        assert_eq!(m.duration(), Duration::from_millis(5));
    }

    #[test]
    fn test_json_export_tags() {
        let json = model().to_json().unwrap();
        assert!(json.contains("\"status\": \"unresolved\""));
        assert!(json.contains("\"kind\": \"timeout\""));
    }
}
