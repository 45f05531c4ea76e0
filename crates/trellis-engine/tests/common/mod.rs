//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use trellis_engine::function::FunctionDefinition;
use trellis_engine::{
    ComputationTargetSpecification, ComputationTargetType, FunctionBuilder, FunctionError, ValueRequirement,
};
use trellis_traits::value::DataValue;

/// Installs a test-writer subscriber once; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// The single security all fixtures compute on.
pub fn target() -> ComputationTargetSpecification {
    ComputationTargetSpecification::security("T")
}

/// Requirement for a value on [`target`].
pub fn req(name: &str) -> ValueRequirement {
    ValueRequirement::new(name, target())
}

/// Counts executions per function id.
#[derive(Default)]
pub struct Executions {
    counts: Mutex<HashMap<String, usize>>,
}

impl Executions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, id: &str) {
        *self.counts.lock().entry(id.to_string()).or_default() += 1;
    }

    pub fn count(&self, id: &str) -> usize {
        self.counts.lock().get(id).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.lock().values().sum()
    }
}

/// A function summing its inputs plus a constant, recording each run.
pub fn summing(
    id: &str,
    output: &str,
    inputs: &[&str],
    constant: f64,
    executions: &Arc<Executions>,
) -> Arc<dyn FunctionDefinition> {
    let names: Vec<String> = inputs.iter().map(|n| n.to_string()).collect();
    let requirements: Vec<ValueRequirement> = inputs.iter().map(|n| req(n)).collect();
    let executions = Arc::clone(executions);
    let function_id = id.to_string();
    FunctionBuilder::new(id, ComputationTargetType::Security)
        .output(output)
        .requires_fixed(requirements)
        .computes(move |_, values| {
            executions.record(&function_id);
            let mut sum = constant;
            for name in &names {
                sum += values.f64_named(name)?;
            }
            Ok(DataValue::Double(sum))
        })
        .build_arc()
}

/// A function that always fails, recording each run.
pub fn failing(id: &str, output: &str, inputs: &[&str], executions: &Arc<Executions>) -> Arc<dyn FunctionDefinition> {
    let requirements: Vec<ValueRequirement> = inputs.iter().map(|n| req(n)).collect();
    let executions = Arc::clone(executions);
    let function_id = id.to_string();
    FunctionBuilder::new(id, ComputationTargetType::Security)
        .output(output)
        .requires_fixed(requirements)
        .computes(move |_, _| {
            executions.record(&function_id);
            Err(FunctionError::Calculation(format!("{} diverged", function_id)))
        })
        .build_arc()
}

