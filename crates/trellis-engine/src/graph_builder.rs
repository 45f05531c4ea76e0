//! Dependency graph builder.
//!
//! Resolves top-level [`ValueRequirement`]s into a [`DependencyGraph`] by
//! depth-first search with backtracking over candidate functions.
//!
//! For each requirement, in order:
//! 1. reuse a node already producing a satisfying specification
//! 2. fail on recursion (the requirement is already being resolved in this branch)
//! 3. fail when the branch exceeds the configured depth
//! 4. source it from market data if the availability provider knows it
//! 5. try candidate functions in repository order, skipping excluded ones,
//!    resolving each candidate's inputs and keeping the first that fully resolves
//!
//! The search runs on an explicit stack of frames, so deep graphs never grow
//! the call stack. Nodes created by candidates that later fail stay in the
//! working graph (and remain available for reuse) but are pruned before the
//! graph is returned.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use trellis_traits::config::ResolutionConfig;
use trellis_traits::ids::{ExclusionGroup, FunctionId};

use crate::failure::{
    AttemptOutcome, FailureReason, FunctionAttempt, ResolutionFailure, ResolutionFailureTracker,
};
use crate::graph::{market_data_specification, DependencyGraph, NodeId};
use crate::market_data::{MarketDataAvailabilityProvider, NoMarketData};
use crate::repository::{FunctionRepository, RegisteredFunction};
use crate::target::ComputationTargetResolver;
use crate::value::{ComputationTarget, ComputationTargetSpecification, ValueRequirement, ValueSpecification};

type Resolution = Result<(ValueSpecification, NodeId), ResolutionFailure>;

// =============================================================================
// BUILD OUTPUT
// =============================================================================

/// Result of a graph build.
#[derive(Debug)]
pub struct BuildOutput {
    /// The graph; holds every requirement that resolved.
    pub graph: DependencyGraph,
    /// Failure forest for requirements that did not.
    pub failures: ResolutionFailureTracker,
    /// Repository version the graph was built against.
    pub repository_version: u64,
    /// Time spent building.
    pub elapsed: Duration,
}

impl BuildOutput {
    /// Whether every requirement resolved.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Specification chosen for a top-level requirement.
    pub fn resolved(&self, requirement: &ValueRequirement) -> Option<&ValueSpecification> {
        self.graph.terminal_output(requirement)
    }
}

// =============================================================================
// SEARCH STATE
// =============================================================================

/// Mutable state of one build, threaded explicitly through the search.
struct BuildContext {
    graph: DependencyGraph,
    /// Requirements on the active stack.
    active: HashSet<ValueRequirement>,
    /// Exclusion groups of the candidates on the active stack.
    group_counts: HashMap<ExclusionGroup, usize>,
    /// Functions disabled after a requirement declaration error.
    disabled: HashSet<FunctionId>,
    targets: HashMap<ComputationTargetSpecification, Option<ComputationTarget>>,
}

impl BuildContext {
    fn new() -> Self {
        Self {
            graph: DependencyGraph::new(),
            active: HashSet::new(),
            group_counts: HashMap::new(),
            disabled: HashSet::new(),
            targets: HashMap::new(),
        }
    }

    fn active_groups(&self) -> HashSet<ExclusionGroup> {
        self.group_counts
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(g, _)| g.clone())
            .collect()
    }

    fn group_active(&self, group: &ExclusionGroup) -> bool {
        self.group_counts.get(group).is_some_and(|n| *n > 0)
    }

    fn enter_group(&mut self, group: Option<&ExclusionGroup>) {
        if let Some(group) = group {
            *self.group_counts.entry(group.clone()).or_default() += 1;
        }
    }

    fn leave_group(&mut self, group: Option<&ExclusionGroup>) {
        if let Some(group) = group {
            if let Some(n) = self.group_counts.get_mut(group) {
                *n = n.saturating_sub(1);
            }
        }
    }
}

/// A candidate function being tried for a requirement.
struct CandidateFrame {
    registered: RegisteredFunction,
    output: ValueSpecification,
    inputs: Vec<ValueRequirement>,
    resolved: Vec<ValueSpecification>,
}

/// A requirement being resolved.
struct RequirementFrame {
    requirement: ValueRequirement,
    target: ComputationTarget,
    candidates: std::vec::IntoIter<RegisteredFunction>,
    attempts: Vec<FunctionAttempt>,
    current: Option<CandidateFrame>,
}

/// Outcome of opening a requirement.
enum Opened {
    Immediate(Resolution),
    Frame(RequirementFrame),
}

/// Next step for the frame on top of the stack.
enum Step {
    Open(ValueRequirement),
    Materialize,
    Exhausted,
    Continue,
}

// =============================================================================
// BUILDER
// =============================================================================

/// Builds dependency graphs from top-level requirements.
pub struct DependencyGraphBuilder {
    repository: Arc<dyn FunctionRepository>,
    targets: Arc<dyn ComputationTargetResolver>,
    market_data: Arc<dyn MarketDataAvailabilityProvider>,
    config: ResolutionConfig,
}

impl DependencyGraphBuilder {
    /// Creates a builder with no market data and default limits.
    pub fn new(
        repository: Arc<dyn FunctionRepository>,
        targets: Arc<dyn ComputationTargetResolver>,
    ) -> Self {
        Self {
            repository,
            targets,
            market_data: Arc::new(NoMarketData),
            config: ResolutionConfig::default(),
        }
    }

    /// Sets the market data availability provider.
    pub fn with_market_data(mut self, market_data: Arc<dyn MarketDataAvailabilityProvider>) -> Self {
        self.market_data = market_data;
        self
    }

    /// Sets resolution limits.
    pub fn with_config(mut self, config: ResolutionConfig) -> Self {
        self.config = config;
        self
    }

    /// The function repository.
    pub fn repository(&self) -> &Arc<dyn FunctionRepository> {
        &self.repository
    }

    /// Resolves the requirements into a graph.
    ///
    /// Requirements resolve independently; a failure of one never affects
    /// another. Duplicate requirements are resolved once.
    pub fn build(&self, requirements: &[ValueRequirement]) -> BuildOutput {
        let start = Instant::now();
        let repository_version = self.repository.version();
        let mut ctx = BuildContext::new();
        let mut failures = ResolutionFailureTracker::new(self.config.failure_detail);
        let mut seen = HashSet::new();

        debug!(requirements = requirements.len(), "building dependency graph");

        for requirement in requirements {
            if !seen.insert(requirement.clone()) {
                continue;
            }
            match self.resolve(&mut ctx, requirement) {
                Ok((spec, node)) => {
                    debug!(requirement = %requirement, node = %node, "requirement resolved");
                    ctx.graph.add_terminal_output(requirement.clone(), spec);
                }
                Err(failure) => {
                    debug!(requirement = %requirement, reason = %failure.reason, "requirement unresolved");
                    failures.record(failure);
                }
            }
        }

        let graph = ctx.graph.retain_reachable();
        if let Err(e) = graph.validate() {
            warn!(error = %e, "built graph failed validation");
        }

        let elapsed = start.elapsed();
        info!(
            nodes = graph.len(),
            edges = graph.edge_count(),
            failures = failures.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "dependency graph built"
        );

        BuildOutput {
            graph,
            failures,
            repository_version,
            elapsed,
        }
    }

    /// Resolves one top-level requirement.
    fn resolve(&self, ctx: &mut BuildContext, root: &ValueRequirement) -> Resolution {
        let mut stack: Vec<RequirementFrame> = Vec::new();
        let mut incoming: Option<Resolution> = match self.open(ctx, root.clone(), 0) {
            Opened::Immediate(result) => return result,
            Opened::Frame(frame) => {
                stack.push(frame);
                None
            }
        };

        loop {
            let step = {
                let Some(top) = stack.last_mut() else {
                    // The loop returns when the root frame closes.
                    return Err(ResolutionFailure::new(root.clone(), FailureReason::CandidatesExhausted));
                };

                if let Some(result) = incoming.take() {
                    self.deliver(ctx, top, result);
                }

                match &top.current {
                    Some(candidate) if candidate.resolved.len() < candidate.inputs.len() => {
                        Step::Open(candidate.inputs[candidate.resolved.len()].clone())
                    }
                    Some(_) => Step::Materialize,
                    None => {
                        if self.select_candidate(ctx, top) {
                            Step::Continue
                        } else {
                            Step::Exhausted
                        }
                    }
                }
            };

            let closed = match step {
                Step::Continue => continue,
                Step::Open(requirement) => match self.open(ctx, requirement, stack.len()) {
                    Opened::Immediate(result) => {
                        incoming = Some(result);
                        continue;
                    }
                    Opened::Frame(frame) => {
                        stack.push(frame);
                        continue;
                    }
                },
                Step::Materialize => {
                    let Some(mut frame) = stack.pop() else { continue };
                    let resolution = match frame.current.take() {
                        Some(candidate) => {
                            ctx.leave_group(candidate.registered.exclusion_group.as_ref());
                            Ok(self.materialize(ctx, &frame, candidate))
                        }
                        None => Err(ResolutionFailure::exhausted(frame.requirement.clone(), frame.attempts)),
                    };
                    ctx.active.remove(&frame.requirement);
                    resolution
                }
                Step::Exhausted => {
                    let Some(frame) = stack.pop() else { continue };
                    ctx.active.remove(&frame.requirement);
                    Err(ResolutionFailure::exhausted(frame.requirement, frame.attempts))
                }
            };

            if stack.is_empty() {
                return closed;
            }
            incoming = Some(closed);
        }
    }

    /// Opens a requirement: either resolves it immediately or returns a frame to search.
    fn open(&self, ctx: &mut BuildContext, requirement: ValueRequirement, depth: usize) -> Opened {
        if let Some(found) = ctx.graph.find_satisfying(&requirement, &ctx.active_groups()) {
            return Opened::Immediate(Ok(found));
        }

        if ctx.active.contains(&requirement) {
            debug!(requirement = %requirement, "recursive requirement");
            return Opened::Immediate(Err(ResolutionFailure::new(
                requirement,
                FailureReason::RecursiveRequirement,
            )));
        }

        if depth >= self.config.max_depth {
            warn!(requirement = %requirement, depth, "resolution depth limit exceeded");
            return Opened::Immediate(Err(ResolutionFailure::new(
                requirement,
                FailureReason::DepthLimitExceeded,
            )));
        }

        let target = self.resolve_target(ctx, &requirement.target);

        if let Some(key) = self.market_data.resolve(&requirement) {
            let target = target.unwrap_or_else(|| ComputationTarget::new(requirement.target.clone()));
            let spec = market_data_specification(&requirement);
            let node = ctx.graph.add_market_data_node(key, target, spec.clone());
            return Opened::Immediate(Ok((spec, node)));
        }

        let Some(target) = target else {
            return Opened::Immediate(Err(ResolutionFailure::new(
                requirement,
                FailureReason::TargetNotFound,
            )));
        };

        let candidates = self
            .repository
            .find_candidates(&target, &requirement.value_name);
        if candidates.is_empty() {
            return Opened::Immediate(Err(ResolutionFailure::new(
                requirement,
                FailureReason::NoProvider,
            )));
        }

        ctx.active.insert(requirement.clone());
        Opened::Frame(RequirementFrame {
            requirement,
            target,
            candidates: candidates.into_iter(),
            attempts: Vec::new(),
            current: None,
        })
    }

    fn resolve_target(
        &self,
        ctx: &mut BuildContext,
        specification: &ComputationTargetSpecification,
    ) -> Option<ComputationTarget> {
        ctx.targets
            .entry(specification.clone())
            .or_insert_with(|| self.targets.resolve(specification))
            .clone()
    }

    /// Advances the frame to its next viable candidate. Returns false when none remain.
    fn select_candidate(&self, ctx: &mut BuildContext, frame: &mut RequirementFrame) -> bool {
        for registered in frame.candidates.by_ref() {
            let function_id = registered.id().clone();

            if ctx.disabled.contains(&function_id) {
                frame
                    .attempts
                    .push(FunctionAttempt::new(function_id, AttemptOutcome::Disabled));
                continue;
            }

            if let Some(group) = &registered.exclusion_group {
                if ctx.group_active(group) {
                    frame.attempts.push(FunctionAttempt::new(
                        function_id,
                        AttemptOutcome::Excluded {
                            group: group.clone(),
                        },
                    ));
                    continue;
                }
            }

            let matching = registered
                .function
                .results(&frame.target)
                .into_iter()
                .find(|spec| spec.satisfies(&frame.requirement));
            let Some(maximal) = matching else {
                frame
                    .attempts
                    .push(FunctionAttempt::new(function_id, AttemptOutcome::NoMatchingOutput));
                continue;
            };

            let inputs = match registered
                .function
                .requirements(&frame.target, &frame.requirement)
            {
                Ok(inputs) => inputs,
                Err(e) => {
                    warn!(function = %function_id, error = %e, "function disabled: invalid requirements");
                    ctx.disabled.insert(function_id.clone());
                    frame.attempts.push(FunctionAttempt::new(
                        function_id,
                        AttemptOutcome::InvalidRequirements {
                            message: e.to_string(),
                        },
                    ));
                    continue;
                }
            };

            ctx.enter_group(registered.exclusion_group.as_ref());
            frame.current = Some(CandidateFrame {
                output: maximal.resolve_for(&frame.requirement, &function_id),
                registered,
                inputs,
                resolved: Vec::new(),
            });
            return true;
        }
        false
    }

    /// Hands a child's resolution to the current candidate of `frame`.
    fn deliver(&self, ctx: &mut BuildContext, frame: &mut RequirementFrame, result: Resolution) {
        match result {
            Ok((spec, _)) => {
                if let Some(candidate) = frame.current.as_mut() {
                    candidate.resolved.push(spec);
                }
            }
            Err(failure) => {
                if let Some(candidate) = frame.current.take() {
                    ctx.leave_group(candidate.registered.exclusion_group.as_ref());
                    debug!(
                        function = %candidate.registered.id(),
                        requirement = %frame.requirement,
                        input = %failure.requirement,
                        "candidate rejected, backtracking"
                    );
                    frame.attempts.push(FunctionAttempt::new(
                        candidate.registered.id().clone(),
                        AttemptOutcome::UnsatisfiedInputs {
                            failures: vec![failure],
                        },
                    ));
                }
            }
        }
    }

    fn materialize(&self, ctx: &mut BuildContext, frame: &RequirementFrame, candidate: CandidateFrame) -> (ValueSpecification, NodeId) {
        let mut inputs = candidate.resolved;
        let mut seen = HashSet::new();
        inputs.retain(|spec| seen.insert(spec.clone()));

        ctx.graph.add_function_node(
            Arc::clone(&candidate.registered.function),
            candidate.registered.exclusion_group.clone(),
            frame.target.clone(),
            inputs,
            candidate.output,
        )
    }
}
