//! Resolution failure diagnostics.
//!
//! When a requirement cannot be satisfied, the graph builder records a
//! [`ResolutionFailure`] tree: the requirement, why it failed, and for each
//! candidate function considered, why that candidate was rejected (including
//! the failure trees of its unsatisfied inputs).
//!
//! Failure trees are data. They never take part in execution and are only
//! read by tooling.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};

use serde::{Deserialize, Serialize};

use trellis_traits::config::FailureDetail;
use trellis_traits::ids::{ExclusionGroup, FunctionId};

use crate::value::ValueRequirement;

// =============================================================================
// FAILURE TREE
// =============================================================================

/// Why a requirement could not be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// No function produces the value on this target.
    NoProvider,
    /// The requirement is already being resolved further up the branch.
    RecursiveRequirement,
    /// Every candidate function was tried and rejected.
    CandidatesExhausted,
    /// The target could not be resolved.
    TargetNotFound,
    /// The resolution branch exceeded the configured depth.
    DepthLimitExceeded,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NoProvider => "no provider",
            Self::RecursiveRequirement => "recursive requirement",
            Self::CandidatesExhausted => "candidates exhausted",
            Self::TargetNotFound => "target not found",
            Self::DepthLimitExceeded => "depth limit exceeded",
        };
        f.write_str(text)
    }
}

/// Why a single candidate function was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// A function of the same exclusion group is an ancestor in this branch.
    Excluded {
        /// The conflicting group.
        group: ExclusionGroup,
    },
    /// None of the function's outputs satisfies the requirement's constraints.
    NoMatchingOutput,
    /// The function could not declare its inputs (configuration error).
    InvalidRequirements {
        /// Error message from the function.
        message: String,
    },
    /// The function was disabled earlier in this build after a configuration error.
    Disabled,
    /// At least one input could not be resolved.
    UnsatisfiedInputs {
        /// Failure trees of the unsatisfied inputs.
        failures: Vec<ResolutionFailure>,
    },
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Excluded { group } => write!(f, "excluded (group {})", group),
            Self::NoMatchingOutput => write!(f, "no matching output"),
            Self::InvalidRequirements { message } => write!(f, "invalid requirements: {}", message),
            Self::Disabled => write!(f, "disabled"),
            Self::UnsatisfiedInputs { failures } => {
                write!(f, "{} unsatisfied input(s)", failures.len())
            }
        }
    }
}

/// One candidate function considered for a requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionAttempt {
    /// The candidate.
    pub function_id: FunctionId,
    /// Why it was rejected.
    pub outcome: AttemptOutcome,
}

impl FunctionAttempt {
    /// Creates an attempt record.
    pub fn new(function_id: FunctionId, outcome: AttemptOutcome) -> Self {
        Self {
            function_id,
            outcome,
        }
    }
}

/// A node of the failure forest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionFailure {
    /// The requirement that failed.
    pub requirement: ValueRequirement,
    /// Why it failed.
    pub reason: FailureReason,
    /// Candidate functions considered, in the order they were tried.
    pub attempts: Vec<FunctionAttempt>,
}

impl ResolutionFailure {
    /// Creates a failure with no attempts.
    pub fn new(requirement: ValueRequirement, reason: FailureReason) -> Self {
        Self {
            requirement,
            reason,
            attempts: Vec::new(),
        }
    }

    /// Creates a failure after all candidates were rejected.
    pub fn exhausted(requirement: ValueRequirement, attempts: Vec<FunctionAttempt>) -> Self {
        Self {
            requirement,
            reason: FailureReason::CandidatesExhausted,
            attempts,
        }
    }

    /// The same failure without candidate detail.
    pub fn summarize(&self) -> Self {
        Self::new(self.requirement.clone(), self.reason)
    }

    /// Unsatisfied input failures across all attempts.
    pub fn unsatisfied_inputs(&self) -> impl Iterator<Item = &ResolutionFailure> {
        self.attempts.iter().flat_map(|attempt| match &attempt.outcome {
            AttemptOutcome::UnsatisfiedInputs { failures } => failures.as_slice(),
            _ => &[][..],
        })
    }

    /// Walks the tree depth-first, pre-order.
    pub fn accept<V: ResolutionFailureVisitor + ?Sized>(&self, visitor: &mut V) {
        enum Item<'a> {
            Failure(&'a ResolutionFailure, usize),
            Attempt(&'a FunctionAttempt, usize),
        }

        let mut stack = vec![Item::Failure(self, 0)];
        while let Some(item) = stack.pop() {
            match item {
                Item::Failure(failure, depth) => {
                    visitor.visit_failure(failure, depth);
                    for attempt in failure.attempts.iter().rev() {
                        stack.push(Item::Attempt(attempt, depth + 1));
                    }
                }
                Item::Attempt(attempt, depth) => {
                    visitor.visit_attempt(attempt, depth);
                    if let AttemptOutcome::UnsatisfiedInputs { failures } = &attempt.outcome {
                        for failure in failures.iter().rev() {
                            stack.push(Item::Failure(failure, depth + 1));
                        }
                    }
                }
            }
        }
    }

    /// Number of failure nodes in the tree, this one included.
    pub fn size(&self) -> usize {
        let mut counter = ReasonCounter::default();
        self.accept(&mut counter);
        counter.counts.values().sum()
    }

    /// Renders the tree as indented text.
    pub fn render(&self) -> String {
        let mut formatter = FailureTreeFormatter::new();
        self.accept(&mut formatter);
        formatter.finish()
    }
}

impl fmt::Display for ResolutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.requirement, self.reason)
    }
}

// =============================================================================
// VISITORS
// =============================================================================

/// Read-only traversal of a failure tree.
pub trait ResolutionFailureVisitor {
    /// Called for each failure node.
    fn visit_failure(&mut self, failure: &ResolutionFailure, depth: usize);

    /// Called for each candidate attempt.
    fn visit_attempt(&mut self, _attempt: &FunctionAttempt, _depth: usize) {}
}

/// Renders failure trees as indented text.
#[derive(Debug)]
pub struct FailureTreeFormatter {
    output: String,
    indent: usize,
}

impl FailureTreeFormatter {
    /// Creates a formatter with two-space indentation.
    pub fn new() -> Self {
        Self {
            output: String::new(),
            indent: 2,
        }
    }

    /// Sets the indentation width.
    pub fn with_indent(mut self, indent: usize) -> Self {
        self.indent = indent;
        self
    }

    /// Returns the rendered text.
    pub fn finish(self) -> String {
        self.output
    }

    fn line(&mut self, depth: usize, text: fmt::Arguments<'_>) {
        let pad = " ".repeat(depth * self.indent);
        // Writing to a String cannot fail.
        let _ = writeln!(self.output, "{}{}", pad, text);
    }
}

impl Default for FailureTreeFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolutionFailureVisitor for FailureTreeFormatter {
    fn visit_failure(&mut self, failure: &ResolutionFailure, depth: usize) {
        self.line(depth, format_args!("{}: {}", failure.requirement, failure.reason));
    }

    fn visit_attempt(&mut self, attempt: &FunctionAttempt, depth: usize) {
        self.line(depth, format_args!("{}: {}", attempt.function_id, attempt.outcome));
    }
}

#[derive(Default)]
struct ReasonCounter {
    counts: BTreeMap<FailureReason, usize>,
}

impl ResolutionFailureVisitor for ReasonCounter {
    fn visit_failure(&mut self, failure: &ResolutionFailure, _depth: usize) {
        *self.counts.entry(failure.reason).or_default() += 1;
    }
}

// =============================================================================
// TRACKER
// =============================================================================

/// Collects the failure forest of one graph build.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolutionFailureTracker {
    detail: FailureDetail,
    failures: Vec<ResolutionFailure>,
    counts: BTreeMap<FailureReason, usize>,
}

impl ResolutionFailureTracker {
    /// Creates a tracker retaining the given detail.
    pub fn new(detail: FailureDetail) -> Self {
        Self {
            detail,
            failures: Vec::new(),
            counts: BTreeMap::new(),
        }
    }

    /// Records a top-level failure.
    pub fn record(&mut self, failure: ResolutionFailure) {
        let mut counter = ReasonCounter::default();
        failure.accept(&mut counter);
        for (reason, n) in counter.counts {
            *self.counts.entry(reason).or_default() += n;
        }
        let failure = match self.detail {
            FailureDetail::Full => failure,
            FailureDetail::Summary => failure.summarize(),
        };
        self.failures.push(failure);
    }

    /// Top-level failures in the order they were recorded.
    pub fn failures(&self) -> &[ResolutionFailure] {
        &self.failures
    }

    /// Consumes the tracker, returning the forest.
    pub fn into_failures(self) -> Vec<ResolutionFailure> {
        self.failures
    }

    /// Failure recorded for a top-level requirement.
    pub fn find(&self, requirement: &ValueRequirement) -> Option<&ResolutionFailure> {
        self.failures.iter().find(|f| &f.requirement == requirement)
    }

    /// Number of top-level failures.
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Whether nothing failed.
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failure nodes with the given reason, across all trees.
    pub fn count(&self, reason: FailureReason) -> usize {
        self.counts.get(&reason).copied().unwrap_or(0)
    }

    /// Failure node counts by reason.
    pub fn counts(&self) -> &BTreeMap<FailureReason, usize> {
        &self.counts
    }

    /// Renders every tree as indented text.
    pub fn render(&self) -> String {
        let mut formatter = FailureTreeFormatter::new();
        for failure in &self.failures {
            failure.accept(&mut formatter);
        }
        formatter.finish()
    }

    /// Exports the forest as JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.failures)
    }
}
