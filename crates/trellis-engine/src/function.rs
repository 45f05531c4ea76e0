//! Calculation function contract.
//!
//! A [`FunctionDefinition`] is a stateless callable bound to one target type. It
//! declares what it can produce for a target, what it needs to produce a given
//! output, and computes outputs from resolved inputs. The engine never looks
//! inside a function body.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use trellis_traits::ids::FunctionId;
use trellis_traits::value::DataValue;

use crate::value::{
    ComputationTarget, ComputationTargetType, ComputedValue, ValueProperties, ValueRequirement,
    ValueSpecification,
};

// =============================================================================
// ERRORS
// =============================================================================

/// Error raised by a function body or by a function's requirement declaration.
#[derive(Debug, Error)]
pub enum FunctionError {
    /// A required input was not supplied
    #[error("missing input: {0}")]
    MissingInput(String),

    /// Function was invoked on an unsupported target
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// Function cannot declare inputs for the desired output
    #[error("invalid requirement: {0}")]
    InvalidRequirement(String),

    /// Calculation failed
    #[error("calculation failed: {0}")]
    Calculation(String),

    /// Any other error from the function body
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for function operations.
pub type FunctionResult<T> = Result<T, FunctionError>;

// =============================================================================
// INPUTS
// =============================================================================

/// Resolved input values handed to a function at execution time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionInputs {
    values: Vec<ComputedValue>,
}

impl FunctionInputs {
    /// Creates an input set.
    pub fn new(values: Vec<ComputedValue>) -> Self {
        Self { values }
    }

    /// Number of inputs.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether there are no inputs.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// All inputs.
    pub fn iter(&self) -> impl Iterator<Item = &ComputedValue> {
        self.values.iter()
    }

    /// Value for an exact specification.
    pub fn get(&self, specification: &ValueSpecification) -> Option<&DataValue> {
        self.values
            .iter()
            .find(|v| &v.specification == specification)
            .map(|v| &v.value)
    }

    /// First value whose specification satisfies the requirement.
    pub fn value_for(&self, requirement: &ValueRequirement) -> Option<&DataValue> {
        self.values
            .iter()
            .find(|v| v.specification.satisfies(requirement))
            .map(|v| &v.value)
    }

    /// First value with the given name, on any target.
    pub fn value_named(&self, value_name: &str) -> Option<&DataValue> {
        self.values
            .iter()
            .find(|v| v.specification.value_name == value_name)
            .map(|v| &v.value)
    }

    /// Like [`value_for`](Self::value_for), failing with [`FunctionError::MissingInput`].
    pub fn require(&self, requirement: &ValueRequirement) -> FunctionResult<&DataValue> {
        self.value_for(requirement)
            .ok_or_else(|| FunctionError::MissingInput(requirement.to_string()))
    }

    /// Numeric value with the given name.
    pub fn f64_named(&self, value_name: &str) -> FunctionResult<f64> {
        self.value_named(value_name)
            .and_then(DataValue::as_f64)
            .ok_or_else(|| FunctionError::MissingInput(value_name.to_string()))
    }
}

// =============================================================================
// FUNCTION DEFINITION
// =============================================================================

/// A calculation function.
///
/// Implementations must be stateless: the same inputs yield the same outputs,
/// and one instance is shared by every graph and worker.
pub trait FunctionDefinition: Send + Sync {
    /// Unique function identifier.
    fn function_id(&self) -> &FunctionId;

    /// Target type this function applies to.
    fn target_type(&self) -> ComputationTargetType;

    /// Finer applicability check on a resolved target.
    fn can_apply_to(&self, target: &ComputationTarget) -> bool {
        target.target_type() == self.target_type()
    }

    /// Maximal specifications this function can produce for the target.
    ///
    /// Properties may be wildcards; they are narrowed against the requirement
    /// during resolution.
    fn results(&self, target: &ComputationTarget) -> Vec<ValueSpecification>;

    /// Names of every value this function can produce, on any target.
    ///
    /// Repositories index candidates by these names, so `results` must never
    /// return a name missing here.
    fn output_names(&self) -> Vec<String>;

    /// Inputs needed to produce `desired` on `target`.
    ///
    /// An error is a configuration error: the function is disabled for the
    /// remainder of the graph build.
    fn requirements(
        &self,
        target: &ComputationTarget,
        desired: &ValueRequirement,
    ) -> FunctionResult<Vec<ValueRequirement>>;

    /// Computes `desired` outputs from resolved inputs.
    fn execute(
        &self,
        target: &ComputationTarget,
        inputs: &FunctionInputs,
        desired: &[ValueSpecification],
    ) -> FunctionResult<Vec<ComputedValue>>;
}

impl fmt::Debug for dyn FunctionDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDefinition")
            .field("function_id", self.function_id())
            .field("target_type", &self.target_type())
            .finish()
    }
}

// =============================================================================
// CLOSURE FUNCTIONS
// =============================================================================

type ApplicabilityFn = dyn Fn(&ComputationTarget) -> bool + Send + Sync;
type RequirementsFn =
    dyn Fn(&ComputationTarget, &ValueRequirement) -> FunctionResult<Vec<ValueRequirement>>
        + Send
        + Sync;
type ExecuteFn = dyn Fn(&ComputationTarget, &FunctionInputs, &[ValueSpecification]) -> FunctionResult<Vec<ComputedValue>>
    + Send
    + Sync;

/// A function assembled from closures.
pub struct ClosureFunction {
    id: FunctionId,
    target_type: ComputationTargetType,
    outputs: Vec<(String, ValueProperties)>,
    applicability: Option<Box<ApplicabilityFn>>,
    requirements: Box<RequirementsFn>,
    execute: Box<ExecuteFn>,
}

impl FunctionDefinition for ClosureFunction {
    fn function_id(&self) -> &FunctionId {
        &self.id
    }

    fn target_type(&self) -> ComputationTargetType {
        self.target_type
    }

    fn can_apply_to(&self, target: &ComputationTarget) -> bool {
        target.target_type() == self.target_type
            && self.applicability.as_ref().map_or(true, |f| f(target))
    }

    fn results(&self, target: &ComputationTarget) -> Vec<ValueSpecification> {
        self.outputs
            .iter()
            .map(|(name, properties)| {
                ValueSpecification::new(name.clone(), target.specification.clone(), properties.clone())
            })
            .collect()
    }

    fn output_names(&self) -> Vec<String> {
        self.outputs.iter().map(|(name, _)| name.clone()).collect()
    }

    fn requirements(
        &self,
        target: &ComputationTarget,
        desired: &ValueRequirement,
    ) -> FunctionResult<Vec<ValueRequirement>> {
        (self.requirements)(target, desired)
    }

    fn execute(
        &self,
        target: &ComputationTarget,
        inputs: &FunctionInputs,
        desired: &[ValueSpecification],
    ) -> FunctionResult<Vec<ComputedValue>> {
        (self.execute)(target, inputs, desired)
    }
}

impl fmt::Debug for ClosureFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosureFunction")
            .field("id", &self.id)
            .field("target_type", &self.target_type)
            .field("outputs", &self.outputs)
            .finish()
    }
}

/// Builder for [`ClosureFunction`].
///
/// ```ignore
/// let pv = FunctionBuilder::new("EquityPV", ComputationTargetType::Security)
///     .produces("PresentValue", ValueProperties::builder().with_any("Currency").build())
///     .requires(|target, _| Ok(vec![ValueRequirement::new("Spot", target.specification.clone())]))
///     .computes(|_, inputs| Ok(DataValue::Double(inputs.f64_named("Spot")? * 100.0)))
///     .build();
/// ```
pub struct FunctionBuilder {
    id: FunctionId,
    target_type: ComputationTargetType,
    outputs: Vec<(String, ValueProperties)>,
    applicability: Option<Box<ApplicabilityFn>>,
    requirements: Option<Box<RequirementsFn>>,
    execute: Option<Box<ExecuteFn>>,
}

impl FunctionBuilder {
    /// Starts a function definition.
    pub fn new(id: impl Into<FunctionId>, target_type: ComputationTargetType) -> Self {
        Self {
            id: id.into(),
            target_type,
            outputs: Vec::new(),
            applicability: None,
            requirements: None,
            execute: None,
        }
    }

    /// Declares an output with no properties.
    pub fn output(self, value_name: impl Into<String>) -> Self {
        self.produces(value_name, ValueProperties::none())
    }

    /// Declares an output with maximal properties.
    pub fn produces(mut self, value_name: impl Into<String>, properties: ValueProperties) -> Self {
        self.outputs.push((value_name.into(), properties));
        self
    }

    /// Restricts applicability beyond the target type.
    pub fn applies_when<F>(mut self, f: F) -> Self
    where
        F: Fn(&ComputationTarget) -> bool + Send + Sync + 'static,
    {
        self.applicability = Some(Box::new(f));
        self
    }

    /// Declares inputs for a desired output.
    pub fn requires<F>(mut self, f: F) -> Self
    where
        F: Fn(&ComputationTarget, &ValueRequirement) -> FunctionResult<Vec<ValueRequirement>>
            + Send
            + Sync
            + 'static,
    {
        self.requirements = Some(Box::new(f));
        self
    }

    /// Declares the same inputs regardless of target or desired output.
    pub fn requires_fixed(self, requirements: Vec<ValueRequirement>) -> Self {
        self.requires(move |_, _| Ok(requirements.clone()))
    }

    /// Sets the execution body.
    pub fn executes<F>(mut self, f: F) -> Self
    where
        F: Fn(&ComputationTarget, &FunctionInputs, &[ValueSpecification]) -> FunctionResult<Vec<ComputedValue>>
            + Send
            + Sync
            + 'static,
    {
        self.execute = Some(Box::new(f));
        self
    }

    /// Sets an execution body producing one value, reported for every desired output.
    pub fn computes<F>(self, f: F) -> Self
    where
        F: Fn(&ComputationTarget, &FunctionInputs) -> FunctionResult<DataValue> + Send + Sync + 'static,
    {
        self.executes(move |target, inputs, desired| {
            let value = f(target, inputs)?;
            Ok(desired
                .iter()
                .map(|spec| ComputedValue::new(spec.clone(), value.clone()))
                .collect())
        })
    }

    /// Builds the function.
    pub fn build(self) -> ClosureFunction {
        let requirements: Box<RequirementsFn> = match self.requirements {
            Some(f) => f,
            None => Box::new(|_, _| Ok(Vec::new())),
        };
        let execute: Box<ExecuteFn> = match self.execute {
            Some(f) => f,
            None => {
                let id = self.id.clone();
                Box::new(move |_, _, _| {
                    Err(FunctionError::Calculation(format!(
                        "function {} has no execution body",
                        id
                    )))
                })
            }
        };
        ClosureFunction {
            id: self.id,
            target_type: self.target_type,
            outputs: self.outputs,
            applicability: self.applicability,
            requirements,
            execute,
        }
    }

    /// Builds the function behind an `Arc`.
    pub fn build_arc(self) -> Arc<dyn FunctionDefinition> {
        Arc::new(self.build())
    }
}

// =============================================================================
// CATALOGUE
// =============================================================================

/// Function definitions by id.
///
/// Workers look up functions here when executing jobs; repository
/// configuration is applied against it.
#[derive(Default)]
pub struct FunctionCatalogue {
    functions: DashMap<FunctionId, Arc<dyn FunctionDefinition>>,
}

impl FunctionCatalogue {
    /// Creates an empty catalogue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a function.
    pub fn register(&self, function: Arc<dyn FunctionDefinition>) {
        self.functions.insert(function.function_id().clone(), function);
    }

    /// Adds functions, returning self.
    pub fn with_functions<I>(self, functions: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn FunctionDefinition>>,
    {
        for function in functions {
            self.register(function);
        }
        self
    }

    /// Looks up a function.
    pub fn get(&self, id: &FunctionId) -> Option<Arc<dyn FunctionDefinition>> {
        self.functions.get(id).map(|f| Arc::clone(f.value()))
    }

    /// Whether a function is present.
    pub fn contains(&self, id: &FunctionId) -> bool {
        self.functions.contains_key(id)
    }

    /// Registered ids.
    pub fn ids(&self) -> Vec<FunctionId> {
        let mut ids: Vec<FunctionId> = self.functions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Number of functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Whether the catalogue is empty.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Snapshot as a plain map.
    pub fn to_map(&self) -> HashMap<FunctionId, Arc<dyn FunctionDefinition>> {
        self.functions
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }
}

impl fmt::Debug for FunctionCatalogue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionCatalogue")
            .field("functions", &self.ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ComputationTargetSpecification;

    fn aapl() -> ComputationTarget {
        ComputationTarget::new(ComputationTargetSpecification::security("AAPL"))
            .with_attribute("Currency", "USD")
    }

    #[test]
    fn test_closure_function_results() {
        let f = FunctionBuilder::new("PV", ComputationTargetType::Security)
            .produces("PresentValue", ValueProperties::builder().with_any("Currency").build())
            .output("Delta")
            .build();

        let results = f.results(&aapl());
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].value_name, "PresentValue");
        assert_eq!(results[0].target, aapl().specification);
        assert!(f.can_apply_to(&aapl()));

        let position = ComputationTarget::new(ComputationTargetSpecification::position("P1"));
        assert!(!f.can_apply_to(&position));
    }

    #[test]
    fn test_applicability_predicate() {
        let f = FunctionBuilder::new("UsdOnly", ComputationTargetType::Security)
            .output("PresentValue")
            .applies_when(|t| t.attribute("Currency") == Some("USD"))
            .build();
        assert!(f.can_apply_to(&aapl()));

        let eur = ComputationTarget::new(ComputationTargetSpecification::security("SAP"))
            .with_attribute("Currency", "EUR");
        assert!(!f.can_apply_to(&eur));
    }

    #[test]
    fn test_computes_reports_every_desired_output() {
        let f = FunctionBuilder::new("Spot", ComputationTargetType::Security)
            .output("Spot")
            .computes(|_, _| Ok(DataValue::Double(101.5)))
            .build();

        let desired = f.results(&aapl());
        let out = f.execute(&aapl(), &FunctionInputs::default(), &desired).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, DataValue::Double(101.5));
    }

    #[test]
    fn test_missing_body_fails() {
        let f = FunctionBuilder::new("Empty", ComputationTargetType::Security)
            .output("X")
            .build();
        let result = f.execute(&aapl(), &FunctionInputs::default(), &[]);
        assert!(matches!(result, Err(FunctionError::Calculation(_))));
    }

    #[test]
    fn test_inputs_lookup() {
        let target = ComputationTargetSpecification::security("AAPL");
        let spot = ValueSpecification::new(
            "Spot",
            target.clone(),
            ValueProperties::builder().with("Function", "MarketData").build(),
        );
        let inputs = FunctionInputs::new(vec![ComputedValue::new(spot.clone(), 101.5)]);

        assert_eq!(inputs.get(&spot), Some(&DataValue::Double(101.5)));
        assert_eq!(inputs.f64_named("Spot").unwrap(), 101.5);
        assert!(inputs.value_for(&ValueRequirement::new("Spot", target.clone())).is_some());
        assert!(matches!(
            inputs.require(&ValueRequirement::new("Vol", target)),
            Err(FunctionError::MissingInput(_))
        ));
    }

    #[test]
    fn test_anyhow_errors_convert() {
        fn body() -> FunctionResult<f64> {
            let parsed: f64 = "abc".parse().map_err(anyhow::Error::from)?;
            Ok(parsed)
        }
        assert!(matches!(body(), Err(FunctionError::Other(_))));
    }

    #[test]
    fn test_catalogue() {
        let catalogue = FunctionCatalogue::new().with_functions([
            FunctionBuilder::new("B", ComputationTargetType::Security).build_arc(),
            FunctionBuilder::new("A", ComputationTargetType::Security).build_arc(),
        ]);
        assert_eq!(catalogue.len(), 2);
        assert!(catalogue.contains(&FunctionId::new("A")));
        assert_eq!(catalogue.ids(), vec![FunctionId::new("A"), FunctionId::new("B")]);
        assert!(catalogue.get(&FunctionId::new("C")).is_none());
    }
}
