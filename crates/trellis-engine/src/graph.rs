//! Dependency graph of function applications.
//!
//! The graph is produced by the [`DependencyGraphBuilder`](crate::graph_builder::DependencyGraphBuilder)
//! and is immutable afterwards; cycles share it behind an `Arc`.
//!
//! Edges run from producer to consumer and are labelled with the
//! [`ValueSpecification`] flowing along them. Every node input is the output of
//! an earlier node, so node ids (creation order) are already a topological order.
//!
//! # Example
//!
//! ```rust,ignore
//! let output = builder.build(&[ValueRequirement::new("PresentValue", aapl)]);
//! let graph = output.graph;
//!
//! // Everything that must be recomputed when a market data key ticks
//! let md = graph.market_data_node(&MarketDataKey::new("AAPL.LAST")).unwrap();
//! let dirty = graph.downstream_of([md]);
//! ```

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use trellis_traits::ids::{ExclusionGroup, FunctionId, MarketDataKey};

use crate::error::{EngineError, EngineResult};
use crate::function::FunctionDefinition;
use crate::value::{
    property_names, ComputationTarget, ComputationTargetSpecification, ValueRequirement,
    ValueSpecification,
};

/// Function id recorded on market data leaf specifications.
pub const MARKET_DATA_FUNCTION: &str = "MarketDataSourcing";

// =============================================================================
// NODE IDENTIFIER
// =============================================================================

/// Identifier of a node within one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl NodeId {
    /// Raw index.
    pub fn index(&self) -> usize {
        self.0
    }

    fn graph_index(self) -> NodeIndex {
        NodeIndex::new(self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

impl From<NodeIndex> for NodeId {
    fn from(idx: NodeIndex) -> Self {
        Self(idx.index())
    }
}

// =============================================================================
// NODES
// =============================================================================

/// Kind of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Applies a calculation function.
    Function,
    /// Sources a value from market data.
    MarketData,
}

/// What a node does.
#[derive(Debug, Clone)]
pub enum NodeFunction {
    /// Reads one market data key.
    MarketData {
        /// Snapshot key.
        key: MarketDataKey,
    },
    /// Applies a calculation function.
    Function {
        /// The chosen function.
        function: Arc<dyn FunctionDefinition>,
        /// Its exclusion group, if any.
        exclusion_group: Option<ExclusionGroup>,
    },
}

/// One vertex of the dependency graph.
#[derive(Debug, Clone)]
pub struct DependencyNode {
    id: NodeId,
    function: NodeFunction,
    target: ComputationTarget,
    inputs: Vec<ValueSpecification>,
    outputs: Vec<ValueSpecification>,
    /// Exclusion groups of this node and everything upstream of it.
    subtree_groups: BTreeSet<ExclusionGroup>,
}

impl DependencyNode {
    /// Node id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Node kind.
    pub fn kind(&self) -> NodeKind {
        match self.function {
            NodeFunction::MarketData { .. } => NodeKind::MarketData,
            NodeFunction::Function { .. } => NodeKind::Function,
        }
    }

    /// Whether this is a market data leaf.
    pub fn is_market_data(&self) -> bool {
        self.kind() == NodeKind::MarketData
    }

    /// What the node does.
    pub fn function(&self) -> &NodeFunction {
        &self.function
    }

    /// Id of the producing function.
    pub fn function_id(&self) -> FunctionId {
        match &self.function {
            NodeFunction::MarketData { .. } => FunctionId::new(MARKET_DATA_FUNCTION),
            NodeFunction::Function { function, .. } => function.function_id().clone(),
        }
    }

    /// The calculation function, for function nodes.
    pub fn definition(&self) -> Option<&Arc<dyn FunctionDefinition>> {
        match &self.function {
            NodeFunction::Function { function, .. } => Some(function),
            NodeFunction::MarketData { .. } => None,
        }
    }

    /// The market data key, for market data nodes.
    pub fn market_data_key(&self) -> Option<&MarketDataKey> {
        match &self.function {
            NodeFunction::MarketData { key } => Some(key),
            NodeFunction::Function { .. } => None,
        }
    }

    /// Exclusion group of the node's own function.
    pub fn exclusion_group(&self) -> Option<&ExclusionGroup> {
        match &self.function {
            NodeFunction::Function {
                exclusion_group, ..
            } => exclusion_group.as_ref(),
            NodeFunction::MarketData { .. } => None,
        }
    }

    /// Exclusion groups of this node and its upstream subtree.
    pub fn subtree_groups(&self) -> &BTreeSet<ExclusionGroup> {
        &self.subtree_groups
    }

    /// Resolved target.
    pub fn target(&self) -> &ComputationTarget {
        &self.target
    }

    /// Input specifications.
    pub fn inputs(&self) -> &[ValueSpecification] {
        &self.inputs
    }

    /// Output specifications.
    pub fn outputs(&self) -> &[ValueSpecification] {
        &self.outputs
    }

    /// Whether the node produces the specification.
    pub fn produces(&self, specification: &ValueSpecification) -> bool {
        self.outputs.contains(specification)
    }
}

impl fmt::Display for DependencyNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}[{}]", self.id, self.function_id(), self.target.specification)
    }
}

/// Market data leaf specification for a requirement.
pub fn market_data_specification(requirement: &ValueRequirement) -> ValueSpecification {
    ValueSpecification::new(
        requirement.value_name.clone(),
        requirement.target.clone(),
        requirement
            .constraints
            .to_builder()
            .with(property_names::FUNCTION, MARKET_DATA_FUNCTION)
            .build(),
    )
}

// =============================================================================
// DEPENDENCY GRAPH
// =============================================================================

type ValueKey = (String, ComputationTargetSpecification);

/// Directed acyclic graph of function applications.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Producer → consumer edges labelled by the flowing specification.
    graph: DiGraph<DependencyNode, ValueSpecification>,

    /// Producing node of each specification.
    producers: HashMap<ValueSpecification, NodeId>,

    /// Produced specifications by (value name, target), in creation order.
    by_value: HashMap<ValueKey, Vec<ValueSpecification>>,

    /// Market data leaves by key.
    market_data: HashMap<MarketDataKey, NodeId>,

    /// Top-level requirements and the specifications chosen for them.
    terminal_outputs: HashMap<ValueRequirement, ValueSpecification>,
    terminal_order: Vec<ValueRequirement>,
}

impl DependencyGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    // ----- construction (builder only) -----

    fn push_node(
        &mut self,
        function: NodeFunction,
        target: ComputationTarget,
        inputs: Vec<ValueSpecification>,
        outputs: Vec<ValueSpecification>,
    ) -> NodeId {
        let id = NodeId(self.graph.node_count());

        let mut subtree_groups = BTreeSet::new();
        if let NodeFunction::Function {
            exclusion_group: Some(group),
            ..
        } = &function
        {
            subtree_groups.insert(group.clone());
        }
        let mut producer_ids = Vec::with_capacity(inputs.len());
        for input in &inputs {
            if let Some(&producer) = self.producers.get(input) {
                subtree_groups.extend(self.graph[producer.graph_index()].subtree_groups.iter().cloned());
                producer_ids.push((producer, input.clone()));
            }
        }
        if let NodeFunction::MarketData { key } = &function {
            self.market_data.insert(key.clone(), id);
        }

        let idx = self.graph.add_node(DependencyNode {
            id,
            function,
            target,
            inputs,
            outputs: Vec::new(),
            subtree_groups,
        });
        debug_assert_eq!(NodeId::from(idx), id);

        for (producer, spec) in producer_ids {
            self.graph.add_edge(producer.graph_index(), idx, spec);
        }
        for output in outputs {
            self.register_output(id, output);
        }
        id
    }

    fn register_output(&mut self, node: NodeId, output: ValueSpecification) -> NodeId {
        if let Some(&existing) = self.producers.get(&output) {
            return existing;
        }
        self.by_value
            .entry((output.value_name.clone(), output.target.clone()))
            .or_default()
            .push(output.clone());
        self.producers.insert(output.clone(), node);
        self.graph[node.graph_index()].outputs.push(output);
        node
    }

    /// Adds (or extends) the market data leaf for a key.
    pub(crate) fn add_market_data_node(
        &mut self,
        key: MarketDataKey,
        target: ComputationTarget,
        output: ValueSpecification,
    ) -> NodeId {
        if let Some(&existing) = self.producers.get(&output) {
            return existing;
        }
        match self.market_data.get(&key) {
            Some(&node) => self.register_output(node, output),
            None => self.push_node(NodeFunction::MarketData { key }, target, Vec::new(), vec![output]),
        }
    }

    /// Adds a function node, merging into an existing node of the same function,
    /// target and inputs.
    ///
    /// An `output` already produced from different inputs is stamped with a
    /// [`property_names::VARIANT`] so both applications stay in the graph.
    /// Returns the specification actually produced and its node.
    pub(crate) fn add_function_node(
        &mut self,
        function: Arc<dyn FunctionDefinition>,
        exclusion_group: Option<ExclusionGroup>,
        target: ComputationTarget,
        inputs: Vec<ValueSpecification>,
        output: ValueSpecification,
    ) -> (ValueSpecification, NodeId) {
        let function_id = function.function_id().clone();
        let mut specification = output.clone();
        let mut variant = 1usize;
        while let Some(&existing) = self.producers.get(&specification) {
            if self.is_application(existing, &function_id, &target.specification, &inputs) {
                return (specification, existing);
            }
            variant += 1;
            specification = ValueSpecification {
                properties: output
                    .properties
                    .to_builder()
                    .with(property_names::VARIANT, variant.to_string())
                    .build(),
                ..output.clone()
            };
        }

        if let Some(existing) = self.find_function_node(&function_id, &target.specification, &inputs) {
            let node = self.register_output(existing, specification.clone());
            return (specification, node);
        }
        let node = self.push_node(
            NodeFunction::Function {
                function,
                exclusion_group,
            },
            target,
            inputs,
            vec![specification.clone()],
        );
        (specification, node)
    }

    fn is_application(
        &self,
        node: NodeId,
        function_id: &FunctionId,
        target: &ComputationTargetSpecification,
        inputs: &[ValueSpecification],
    ) -> bool {
        let node = &self.graph[node.graph_index()];
        !node.is_market_data()
            && &node.function_id() == function_id
            && &node.target.specification == target
            && node.inputs == inputs
    }

    /// Records the specification chosen for a top-level requirement.
    pub(crate) fn add_terminal_output(&mut self, requirement: ValueRequirement, specification: ValueSpecification) {
        if self
            .terminal_outputs
            .insert(requirement.clone(), specification)
            .is_none()
        {
            self.terminal_order.push(requirement);
        }
    }

    /// Drops nodes no terminal output depends on.
    pub(crate) fn retain_reachable(self) -> Self {
        let roots: Vec<NodeId> = self
            .terminal_order
            .iter()
            .filter_map(|r| self.terminal_outputs.get(r))
            .filter_map(|spec| self.producers.get(spec).copied())
            .collect();
        let keep = self.upstream_of(roots);
        if keep.len() == self.len() {
            return self;
        }

        let mut pruned = DependencyGraph::new();
        let mut old_nodes: Vec<NodeId> = keep.into_iter().collect();
        old_nodes.sort();
        for old in old_nodes {
            let node = &self.graph[old.graph_index()];
            pruned.push_node(
                node.function.clone(),
                node.target.clone(),
                node.inputs.clone(),
                node.outputs.clone(),
            );
        }
        pruned.terminal_outputs = self.terminal_outputs;
        pruned.terminal_order = self.terminal_order;
        pruned
    }

    // ----- queries -----

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Number of edges.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// A node by id.
    pub fn node(&self, id: NodeId) -> Option<&DependencyNode> {
        self.graph.node_weight(id.graph_index())
    }

    /// All nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &DependencyNode> {
        self.graph.node_weights()
    }

    /// All node ids.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.graph.node_indices().map(NodeId::from)
    }

    /// Node producing the specification.
    pub fn producer_of(&self, specification: &ValueSpecification) -> Option<NodeId> {
        self.producers.get(specification).copied()
    }

    /// All produced specifications.
    pub fn specifications(&self) -> impl Iterator<Item = &ValueSpecification> {
        self.producers.keys()
    }

    /// First produced specification satisfying the requirement whose producer's
    /// subtree uses none of the `excluded` groups.
    pub fn find_satisfying(
        &self,
        requirement: &ValueRequirement,
        excluded: &HashSet<ExclusionGroup>,
    ) -> Option<(ValueSpecification, NodeId)> {
        let key = (requirement.value_name.clone(), requirement.target.clone());
        self.by_value.get(&key)?.iter().find_map(|spec| {
            if !spec.satisfies(requirement) {
                return None;
            }
            let node = self.producers.get(spec).copied()?;
            let groups = &self.graph[node.graph_index()].subtree_groups;
            if groups.iter().any(|g| excluded.contains(g)) {
                None
            } else {
                Some((spec.clone(), node))
            }
        })
    }

    /// Function node with the given function, target and inputs.
    pub fn find_function_node(
        &self,
        function_id: &FunctionId,
        target: &ComputationTargetSpecification,
        inputs: &[ValueSpecification],
    ) -> Option<NodeId> {
        self.graph
            .node_indices()
            .map(NodeId::from)
            .find(|id| self.is_application(*id, function_id, target, inputs))
    }

    /// Distinct nodes whose outputs this node consumes.
    pub fn inputs_of(&self, id: NodeId) -> Vec<NodeId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Distinct nodes consuming this node's outputs.
    pub fn dependents_of(&self, id: NodeId) -> Vec<NodeId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: NodeId, direction: Direction) -> Vec<NodeId> {
        if id.index() >= self.len() {
            return Vec::new();
        }
        let mut ids: Vec<NodeId> = self
            .graph
            .neighbors_directed(id.graph_index(), direction)
            .map(NodeId::from)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// The seeds and every node they transitively depend on.
    pub fn upstream_of(&self, seeds: impl IntoIterator<Item = NodeId>) -> HashSet<NodeId> {
        self.closure(seeds, Direction::Incoming)
    }

    /// The seeds and every node transitively depending on them.
    pub fn downstream_of(&self, seeds: impl IntoIterator<Item = NodeId>) -> HashSet<NodeId> {
        self.closure(seeds, Direction::Outgoing)
    }

    fn closure(&self, seeds: impl IntoIterator<Item = NodeId>, direction: Direction) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<NodeId> = seeds.into_iter().filter(|id| id.index() < self.len()).collect();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            for next in self.graph.neighbors_directed(id.graph_index(), direction) {
                let next = NodeId::from(next);
                if !seen.contains(&next) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }

    /// Nodes in dependency order (inputs before consumers).
    pub fn topological_order(&self) -> EngineResult<Vec<NodeId>> {
        toposort(&self.graph, None)
            .map(|order| order.into_iter().map(NodeId::from).collect())
            .map_err(|cycle| EngineError::CircularDependency(NodeId::from(cycle.node_id()).to_string()))
    }

    /// Market data leaf ids.
    pub fn market_data_nodes(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.market_data.values().copied().collect();
        ids.sort();
        ids
    }

    /// Market data leaf for a key.
    pub fn market_data_node(&self, key: &MarketDataKey) -> Option<NodeId> {
        self.market_data.get(key).copied()
    }

    /// Specification chosen for a top-level requirement.
    pub fn terminal_output(&self, requirement: &ValueRequirement) -> Option<&ValueSpecification> {
        self.terminal_outputs.get(requirement)
    }

    /// Top-level requirements and their specifications, in request order.
    pub fn terminal_outputs(&self) -> impl Iterator<Item = (&ValueRequirement, &ValueSpecification)> {
        self.terminal_order
            .iter()
            .filter_map(|r| self.terminal_outputs.get(r).map(|s| (r, s)))
    }

    /// Checks acyclicity and that every input is produced by its edge's source.
    pub fn validate(&self) -> EngineResult<()> {
        if is_cyclic_directed(&self.graph) {
            return Err(EngineError::CircularDependency("dependency graph".into()));
        }
        for node in self.graph.node_weights() {
            for input in &node.inputs {
                let producer = self
                    .producers
                    .get(input)
                    .ok_or_else(|| EngineError::NodeNotFound(format!("no producer for {} (input of {})", input, node)))?;
                if producer.index() >= node.id.index() {
                    return Err(EngineError::CircularDependency(format!(
                        "{} consumes {} from later {}",
                        node, input, producer
                    )));
                }
            }
        }
        for (requirement, spec) in &self.terminal_outputs {
            if !self.producers.contains_key(spec) {
                return Err(EngineError::NodeNotFound(format!(
                    "terminal output {} for {}",
                    spec, requirement
                )));
            }
        }
        Ok(())
    }

    /// Graph statistics.
    pub fn stats(&self) -> GraphStats {
        let market_data_nodes = self.market_data.len();
        let mut depth = vec![0usize; self.len()];
        // ids are a topological order
        for node in self.graph.node_weights() {
            let d = self
                .graph
                .neighbors_directed(node.id.graph_index(), Direction::Incoming)
                .map(|p| depth[p.index()] + 1)
                .max()
                .unwrap_or(0);
            depth[node.id.index()] = d;
        }
        GraphStats {
            node_count: self.len(),
            edge_count: self.edge_count(),
            function_nodes: self.len() - market_data_nodes,
            market_data_nodes,
            terminal_outputs: self.terminal_outputs.len(),
            max_depth: depth.into_iter().max().unwrap_or(0),
        }
    }
}

// =============================================================================
// GRAPH STATISTICS
// =============================================================================

/// Statistics about a dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GraphStats {
    /// Number of nodes.
    pub node_count: usize,
    /// Number of edges.
    pub edge_count: usize,
    /// Function nodes.
    pub function_nodes: usize,
    /// Market data leaves.
    pub market_data_nodes: usize,
    /// Resolved top-level requirements.
    pub terminal_outputs: usize,
    /// Longest input chain.
    pub max_depth: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::FunctionBuilder;
    use crate::value::{ComputationTargetType, ValueProperties};

    fn target() -> ComputationTarget {
        ComputationTarget::new(ComputationTargetSpecification::security("AAPL"))
    }

    fn spec(name: &str, function: &str) -> ValueSpecification {
        ValueSpecification::new(
            name,
            target().specification,
            ValueProperties::builder().with(property_names::FUNCTION, function).build(),
        )
    }

    fn function(id: &str) -> Arc<dyn FunctionDefinition> {
        FunctionBuilder::new(id, ComputationTargetType::Security).build_arc()
    }

    /// spot(md) -> vol(F_VOL) -> pv(F_PV) <- spot
    fn sample() -> (DependencyGraph, NodeId, NodeId, NodeId) {
        let mut graph = DependencyGraph::new();
        let spot_req = ValueRequirement::new("Spot", target().specification);
        let spot = market_data_specification(&spot_req);
        let md = graph.add_market_data_node(MarketDataKey::new("AAPL.LAST"), target(), spot.clone());
        let vol = graph.add_function_node(
            function("F_VOL"),
            Some(ExclusionGroup::new("VOL")),
            target(),
            vec![spot.clone()],
            spec("Vol", "F_VOL"),
        )
        .1;
        let pv = graph.add_function_node(
            function("F_PV"),
            None,
            target(),
            vec![spot, spec("Vol", "F_VOL")],
            spec("PV", "F_PV"),
        )
        .1;
        graph.add_terminal_output(ValueRequirement::new("PV", target().specification), spec("PV", "F_PV"));
        (graph, md, vol, pv)
    }

    #[test]
    fn test_structure_queries() {
        let (graph, md, vol, pv) = sample();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.edge_count(), 3);
        assert_eq!(graph.inputs_of(pv), vec![md, vol]);
        assert_eq!(graph.dependents_of(md), vec![vol, pv]);
        assert_eq!(graph.producer_of(&spec("Vol", "F_VOL")), Some(vol));
        assert_eq!(graph.market_data_nodes(), vec![md]);
        assert!(graph.node(pv).unwrap().subtree_groups().contains(&ExclusionGroup::new("VOL")));
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_closures() {
        let (graph, md, vol, pv) = sample();
        assert_eq!(graph.downstream_of([vol]), HashSet::from([vol, pv]));
        assert_eq!(graph.upstream_of([vol]), HashSet::from([md, vol]));
        assert_eq!(graph.downstream_of([md]).len(), 3);
    }

    #[test]
    fn test_topological_order() {
        let (graph, md, vol, pv) = sample();
        let order = graph.topological_order().unwrap();
        let pos = |id: NodeId| order.iter().position(|n| *n == id).unwrap();
        assert!(pos(md) < pos(vol));
        assert!(pos(vol) < pos(pv));
    }

    #[test]
    fn test_merge_same_function_target_inputs() {
        let (mut graph, _, vol, _) = sample();
        let spot = market_data_specification(&ValueRequirement::new("Spot", target().specification));
        let (_, merged) = graph.add_function_node(
            function("F_VOL"),
            Some(ExclusionGroup::new("VOL")),
            target(),
            vec![spot],
            spec("VolSurface", "F_VOL"),
        );
        assert_eq!(merged, vol);
        assert_eq!(graph.node(vol).unwrap().outputs().len(), 2);
        assert_eq!(graph.len(), 3);
    }

    #[test]
    fn test_same_output_from_other_inputs_is_a_variant() {
        let (mut graph, _, vol, _) = sample();
        let (variant, node) = graph.add_function_node(
            function("F_VOL"),
            None,
            target(),
            vec![],
            spec("Vol", "F_VOL"),
        );

        assert_ne!(node, vol);
        assert_eq!(variant.properties.single_value(property_names::VARIANT), Some("2"));
        assert_eq!(graph.producer_of(&spec("Vol", "F_VOL")), Some(vol));
        assert_eq!(graph.producer_of(&variant), Some(node));
        assert!(graph.node(node).unwrap().subtree_groups().is_empty());

        // Same function and inputs again lands on the variant.
        let (again, same) = graph.add_function_node(function("F_VOL"), None, target(), vec![], spec("Vol", "F_VOL"));
        assert_eq!((again, same), (variant, node));
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_find_satisfying_respects_exclusion() {
        let (graph, _, vol, _) = sample();
        let req = ValueRequirement::new("Vol", target().specification);
        assert_eq!(graph.find_satisfying(&req, &HashSet::new()).map(|(_, n)| n), Some(vol));

        let excluded = HashSet::from([ExclusionGroup::new("VOL")]);
        assert!(graph.find_satisfying(&req, &excluded).is_none());
    }

    #[test]
    fn test_retain_reachable_prunes_orphans() {
        let (mut graph, _, _, _) = sample();
        graph.add_function_node(function("ORPHAN"), None, target(), vec![], spec("X", "ORPHAN"));
        assert_eq!(graph.len(), 4);

        let pruned = graph.retain_reachable();
        assert_eq!(pruned.len(), 3);
        assert!(pruned.producer_of(&spec("X", "ORPHAN")).is_none());
        assert!(pruned.validate().is_ok());
    }

    #[test]
    fn test_stats() {
        let (graph, _, _, _) = sample();
        let stats = graph.stats();
        assert_eq!(stats.node_count, 3);
        assert_eq!(stats.function_nodes, 2);
        assert_eq!(stats.market_data_nodes, 1);
        assert_eq!(stats.terminal_outputs, 1);
        assert_eq!(stats.max_depth, 2);
    }
}
