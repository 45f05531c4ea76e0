//! Property-based tests for graph building and caching invariants.
//!
//! Repositories are generated at random, including self and mutual
//! recursion, and every build must still hold:
//! - The graph is acyclic and every input is produced in-graph
//! - Each requirement is resolved by one node
//! - No exclusion group appears twice along a dependency path
//! - Concurrent equal cache writes leave a readable value

mod common;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use proptest::prelude::*;

use common::{req, target};
use trellis_engine::{
    BuildOutput, ComputationTarget, ComputationTargetType, ComputationCache, DependencyGraphBuilder, FunctionBuilder,
    InMemoryFunctionRepository, InMemoryTargetResolver, RegisteredFunction, ValueProperties, ValueRequirement,
    ValueSpecification,
};
use trellis_traits::value::DataValue;

// =============================================================================
// TEST DATA GENERATORS
// =============================================================================

/// One generated function: the value it produces, its inputs and its group.
#[derive(Debug, Clone)]
struct GeneratedFunction {
    output: usize,
    inputs: Vec<usize>,
    group: Option<usize>,
}

fn value_name(i: usize) -> String {
    format!("V{}", i)
}

fn function_strategy(values: usize, groups: usize) -> impl Strategy<Value = GeneratedFunction> {
    let group = if groups == 0 {
        Just(None).boxed()
    } else {
        prop::option::of(0..groups).boxed()
    };
    (0..values, prop::collection::vec(0..values, 0..3), group).prop_map(|(output, inputs, group)| GeneratedFunction {
        output,
        inputs,
        group,
    })
}

fn repository_strategy(groups: usize) -> impl Strategy<Value = Vec<GeneratedFunction>> {
    (2usize..8).prop_flat_map(move |values| prop::collection::vec(function_strategy(values, groups), 1..12))
}

fn builder(functions: &[GeneratedFunction]) -> DependencyGraphBuilder {
    let repository = InMemoryFunctionRepository::new();
    for (i, generated) in functions.iter().enumerate() {
        let inputs: Vec<ValueRequirement> = generated.inputs.iter().map(|v| req(&value_name(*v))).collect();
        let definition = FunctionBuilder::new(format!("F{}", i), ComputationTargetType::Security)
            .output(value_name(generated.output))
            .requires_fixed(inputs)
            .build_arc();
        let mut registered = RegisteredFunction::new(definition);
        if let Some(group) = generated.group {
            registered = registered.with_exclusion_group(format!("G{}", group));
        }
        repository.register(registered).unwrap();
    }
    let resolver = InMemoryTargetResolver::new().with_target(ComputationTarget::new(target()));
    DependencyGraphBuilder::new(Arc::new(repository), Arc::new(resolver))
}

/// One requirement per produced value.
fn requirements(functions: &[GeneratedFunction]) -> Vec<ValueRequirement> {
    let mut wanted: Vec<usize> = functions.iter().map(|f| f.output).collect();
    wanted.sort_unstable();
    wanted.dedup();
    wanted.into_iter().map(|v| req(&value_name(v))).collect()
}

fn build(functions: &[GeneratedFunction]) -> BuildOutput {
    builder(functions).build(&requirements(functions))
}

// =============================================================================
// PROPERTY: ACYCLICITY
// =============================================================================

proptest! {
    /// No node is reachable from itself, even when functions require their own output.
    #[test]
    fn property_built_graph_is_acyclic(functions in repository_strategy(2)) {
        let output = build(&functions);
        prop_assert!(output.graph.validate().is_ok());

        let order = output.graph.topological_order();
        prop_assert!(order.is_ok());
        let order = order.unwrap_or_default();
        prop_assert_eq!(order.len(), output.graph.len());

        let position: HashMap<_, _> = order.iter().enumerate().map(|(i, n)| (*n, i)).collect();
        for node in output.graph.node_ids() {
            for input in output.graph.inputs_of(node) {
                prop_assert!(position[&input] < position[&node]);
            }
        }
    }

    /// Every requirement either resolved or has a recorded failure.
    #[test]
    fn property_every_requirement_accounted_for(functions in repository_strategy(2)) {
        let output = build(&functions);
        let outputs: HashSet<usize> = functions.iter().map(|f| f.output).collect();
        for v in outputs {
            let requirement = req(&value_name(v));
            let resolved = output.resolved(&requirement).is_some();
            let failed = output.failures.find(&requirement).is_some();
            prop_assert!(resolved != failed, "{} resolved={} failed={}", requirement, resolved, failed);
        }
    }
}

// =============================================================================
// PROPERTY: MEMOIZATION
// =============================================================================

proptest! {
    /// Without exclusion groups, each value and each function appears in one node at most.
    #[test]
    fn property_shared_inputs_are_memoized(functions in repository_strategy(0)) {
        let output = build(&functions);

        let mut values = HashSet::new();
        let mut function_ids = HashSet::new();
        for node in output.graph.nodes() {
            prop_assert!(function_ids.insert(node.function_id()));
            for spec in node.outputs() {
                prop_assert!(values.insert(spec.value_name.clone()), "{} produced twice", spec.value_name);
            }
        }
    }

    /// Requesting every value twice yields the same specifications and no extra nodes.
    #[test]
    fn property_duplicate_requests_share_nodes(functions in repository_strategy(0)) {
        let requirements = requirements(&functions);
        let once = builder(&functions).build(&requirements);
        let twice = builder(&functions).build(&[requirements.clone(), requirements.clone()].concat());

        prop_assert_eq!(once.graph.len(), twice.graph.len());
        for requirement in &requirements {
            prop_assert_eq!(once.resolved(requirement), twice.resolved(requirement));
        }
    }
}

// =============================================================================
// PROPERTY: EXCLUSION ENFORCEMENT
// =============================================================================

proptest! {
    /// A node's group never appears among its transitive inputs.
    #[test]
    fn property_exclusion_groups_do_not_nest(functions in repository_strategy(2)) {
        let output = build(&functions);
        for node in output.graph.nodes() {
            let Some(group) = node.exclusion_group() else {
                continue;
            };
            for upstream in output.graph.upstream_of([node.id()]) {
                if upstream == node.id() {
                    continue;
                }
                let ancestor = output.graph.node(upstream).and_then(|n| n.exclusion_group());
                prop_assert_ne!(ancestor, Some(group), "{} nested under {}", upstream, node.id());
            }
        }
    }
}

// =============================================================================
// PROPERTY: IDEMPOTENT CACHE WRITES
// =============================================================================

proptest! {
    /// Racing writers storing the same value leave one readable entry.
    #[test]
    fn property_concurrent_equal_writes(value in -1.0e6f64..1.0e6, writers in 2usize..8) {
        let cache = ComputationCache::new();
        let spec = ValueSpecification::new("PV", target(), ValueProperties::none());

        std::thread::scope(|scope| {
            for _ in 0..writers {
                scope.spawn(|| cache.put(spec.clone(), DataValue::Double(value)));
            }
        });

        prop_assert_eq!(cache.len(), 1);
        prop_assert_eq!(cache.get(&spec), Some(DataValue::Double(value)));
    }
}
