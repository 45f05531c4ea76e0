//! Calculation jobs: the unit of work shipped to a worker.
//!
//! A job batches mutually independent graph nodes together with every input
//! value they need. A result reports, per node, either the computed values or
//! why the node failed. Both are serializable so they can cross a process
//! boundary.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use trellis_traits::ids::{FunctionId, JobId, WorkerId};

use crate::function::FunctionInputs;
use crate::graph::NodeId;
use crate::value::{ComputationTarget, ComputedValue, ValueSpecification};

/// Identifier of one computation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CycleId(pub Uuid);

impl CycleId {
    /// Creates a fresh random cycle id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CycleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cycle-{}", self.0)
    }
}

// =============================================================================
// JOB
// =============================================================================

/// One node's work within a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationJobItem {
    /// Graph node being computed.
    pub node: NodeId,
    /// Function to invoke.
    pub function_id: FunctionId,
    /// Target to invoke it on.
    pub target: ComputationTarget,
    /// Input specifications, resolved from the job's inputs.
    pub inputs: Vec<ValueSpecification>,
    /// Outputs the function must produce.
    pub outputs: Vec<ValueSpecification>,
}

/// A batch of independent nodes dispatched to a single worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationJob {
    /// Job id, unique per scheduler.
    pub id: JobId,
    /// Cycle the job belongs to.
    pub cycle_id: CycleId,
    /// Dispatch attempt, starting at 1.
    pub attempt: u32,
    /// Nodes to compute.
    pub items: Vec<CalculationJobItem>,
    /// Input values for all items.
    pub inputs: Vec<ComputedValue>,
}

impl CalculationJob {
    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the job has no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Nodes in the job.
    pub fn nodes(&self) -> Vec<NodeId> {
        self.items.iter().map(|i| i.node).collect()
    }

    /// Splits the shared inputs per item.
    ///
    /// Returns, per item, either its inputs or the first missing specification.
    pub fn item_inputs(&self) -> Vec<Result<FunctionInputs, ValueSpecification>> {
        let by_spec: HashMap<&ValueSpecification, &ComputedValue> =
            self.inputs.iter().map(|v| (&v.specification, v)).collect();
        self.items
            .iter()
            .map(|item| {
                item.inputs
                    .iter()
                    .map(|spec| by_spec.get(spec).map(|v| (*v).clone()).ok_or_else(|| spec.clone()))
                    .collect::<Result<Vec<_>, _>>()
                    .map(FunctionInputs::new)
            })
            .collect()
    }
}

// =============================================================================
// RESULT
// =============================================================================

/// What happened to one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobItemOutcome {
    /// The function ran and returned values.
    Success {
        /// Values returned.
        values: Vec<ComputedValue>,
    },
    /// The function returned an error or panicked.
    FunctionFailed {
        /// Error message.
        message: String,
    },
    /// An input was not shipped with the job.
    MissingInput {
        /// The missing input.
        specification: ValueSpecification,
    },
    /// The worker does not know the function.
    UnknownFunction {
        /// The unknown function.
        function_id: FunctionId,
    },
}

impl JobItemOutcome {
    /// Whether the item succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Result of one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobItemResult {
    /// Graph node.
    pub node: NodeId,
    /// Outcome.
    pub outcome: JobItemOutcome,
}

/// Result of a whole job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationJobResult {
    /// Job this answers.
    pub job_id: JobId,
    /// Worker that executed it.
    pub worker_id: WorkerId,
    /// Per-item results.
    pub items: Vec<JobItemResult>,
    /// Execution time on the worker.
    pub duration: Duration,
}

impl CalculationJobResult {
    /// Number of failed items.
    pub fn failure_count(&self) -> usize {
        self.items.iter().filter(|i| !i.outcome.is_success()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{ComputationTargetSpecification, ValueProperties};
    use trellis_traits::value::DataValue;

    fn spec(name: &str) -> ValueSpecification {
        ValueSpecification::new(name, ComputationTargetSpecification::security("AAPL"), ValueProperties::none())
    }

    fn item(node: usize, inputs: &[&str]) -> CalculationJobItem {
        CalculationJobItem {
            node: NodeId(node),
            function_id: FunctionId::new("F"),
            target: ComputationTarget::new(ComputationTargetSpecification::security("AAPL")),
            inputs: inputs.iter().map(|n| spec(n)).collect(),
            outputs: vec![spec("Out")],
        }
    }

    #[test]
    fn test_item_inputs_split() {
        let job = CalculationJob {
            id: JobId::new(1),
            cycle_id: CycleId::new(),
            attempt: 1,
            items: vec![item(0, &["Spot"]), item(1, &["Spot", "Vol"])],
            inputs: vec![ComputedValue::new(spec("Spot"), 100.0)],
        };

        let split = job.item_inputs();
        let first = split[0].as_ref().unwrap();
        assert_eq!(first.get(&spec("Spot")), Some(&DataValue::Double(100.0)));
        assert_eq!(split[1].as_ref().unwrap_err(), &spec("Vol"));
        assert_eq!(job.nodes(), vec![NodeId(0), NodeId(1)]);
    }

    #[test]
    fn test_result_serialization_tags() {
        let result = CalculationJobResult {
            job_id: JobId::new(7),
            worker_id: WorkerId::new("w1"),
            items: vec![JobItemResult {
                node: NodeId(3),
                outcome: JobItemOutcome::FunctionFailed {
                    message: "boom".into(),
                },
            }],
            duration: Duration::from_millis(5),
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"status\":\"function_failed\""));
        let back: CalculationJobResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.failure_count(), 1);
    }

    #[test]
    fn test_cycle_ids_are_unique() {
        assert_ne!(CycleId::new(), CycleId::new());
        assert!(CycleId::new().to_string().starts_with("cycle-"));
    }
}
