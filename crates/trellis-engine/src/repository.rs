//! Function repository: registry of calculation functions.
//!
//! Answers "which functions can produce value X on a target of type T", in a
//! deterministic order. Higher priority comes first; equal priorities keep
//! registration order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use trellis_traits::ids::{ExclusionGroup, FunctionId};

use crate::error::{EngineError, EngineResult};
use crate::function::FunctionDefinition;
use crate::value::{ComputationTarget, ComputationTargetType};

/// A function together with its registration metadata.
#[derive(Clone)]
pub struct RegisteredFunction {
    /// The function.
    pub function: Arc<dyn FunctionDefinition>,
    /// Ordering priority; higher is tried first.
    pub priority: i32,
    /// Exclusion group, if any.
    pub exclusion_group: Option<ExclusionGroup>,
}

impl RegisteredFunction {
    /// Wraps a function with default priority and no exclusion group.
    pub fn new(function: Arc<dyn FunctionDefinition>) -> Self {
        Self {
            function,
            priority: 0,
            exclusion_group: None,
        }
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the exclusion group.
    pub fn with_exclusion_group(mut self, group: impl Into<ExclusionGroup>) -> Self {
        self.exclusion_group = Some(group.into());
        self
    }

    /// Function id.
    pub fn id(&self) -> &FunctionId {
        self.function.function_id()
    }
}

impl std::fmt::Debug for RegisteredFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredFunction")
            .field("id", self.id())
            .field("priority", &self.priority)
            .field("exclusion_group", &self.exclusion_group)
            .finish()
    }
}

/// Query interface over available functions.
pub trait FunctionRepository: Send + Sync {
    /// Functions applicable to `target` that declare an output named `value_name`,
    /// in resolution order.
    fn find_candidates(&self, target: &ComputationTarget, value_name: &str) -> Vec<RegisteredFunction>;

    /// Looks up a registered function by id.
    fn get(&self, id: &FunctionId) -> Option<RegisteredFunction>;

    /// Number of registered functions.
    fn len(&self) -> usize;

    /// Whether the repository is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Monotonic version, bumped on every change.
    fn version(&self) -> u64;
}

// =============================================================================
// IN-MEMORY REPOSITORY
// =============================================================================

struct Entry {
    registered: RegisteredFunction,
    sequence: u64,
}

type CandidateKey = (ComputationTargetType, String);

#[derive(Default)]
struct Registry {
    by_id: HashMap<FunctionId, Arc<Entry>>,
    /// Sorted functions per target type.
    by_type: HashMap<ComputationTargetType, Vec<Arc<Entry>>>,
    /// Sorted candidate lists per (target type, output name).
    by_output: HashMap<CandidateKey, Vec<Arc<Entry>>>,
}

impl Registry {
    fn reindex(&mut self, target_type: ComputationTargetType) {
        let mut entries: Vec<Arc<Entry>> = self
            .by_id
            .values()
            .filter(|e| e.registered.function.target_type() == target_type)
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            b.registered
                .priority
                .cmp(&a.registered.priority)
                .then(a.sequence.cmp(&b.sequence))
        });

        self.by_output.retain(|(t, _), _| *t != target_type);
        for entry in &entries {
            let mut names = entry.registered.function.output_names();
            names.sort();
            names.dedup();
            for name in names {
                self.by_output
                    .entry((target_type, name))
                    .or_default()
                    .push(Arc::clone(entry));
            }
        }
        self.by_type.insert(target_type, entries);
    }
}

/// Thread-safe in-memory function repository.
#[derive(Default)]
pub struct InMemoryFunctionRepository {
    registry: RwLock<Registry>,
    sequence: AtomicU64,
    version: AtomicU64,
}

impl InMemoryFunctionRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function. Fails if the id is already registered.
    pub fn register(&self, registered: RegisteredFunction) -> EngineResult<()> {
        let id = registered.id().clone();
        let target_type = registered.function.target_type();
        let mut registry = self.registry.write();
        if registry.by_id.contains_key(&id) {
            return Err(EngineError::RepositoryError(format!(
                "function {} already registered",
                id
            )));
        }

        debug!(
            function = %id,
            priority = registered.priority,
            group = ?registered.exclusion_group,
            "registering function"
        );

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        registry.by_id.insert(
            id,
            Arc::new(Entry {
                registered,
                sequence,
            }),
        );
        registry.reindex(target_type);
        self.version.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Registers a function with default metadata.
    pub fn register_function(&self, function: Arc<dyn FunctionDefinition>) -> EngineResult<()> {
        self.register(RegisteredFunction::new(function))
    }

    /// Registers a function, builder style.
    pub fn with(self, registered: RegisteredFunction) -> EngineResult<Self> {
        self.register(registered)?;
        Ok(self)
    }

    /// Removes a function.
    pub fn remove(&self, id: &FunctionId) -> Option<RegisteredFunction> {
        let mut registry = self.registry.write();
        let entry = registry.by_id.remove(id)?;
        registry.reindex(entry.registered.function.target_type());
        self.version.fetch_add(1, Ordering::SeqCst);
        debug!(function = %id, "removed function");
        Some(entry.registered.clone())
    }

    /// Changes a function's priority, keeping its registration order for ties.
    pub fn set_priority(&self, id: &FunctionId, priority: i32) -> EngineResult<()> {
        let mut registry = self.registry.write();
        let entry = registry
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::RepositoryError(format!("unknown function {}", id)))?;
        let mut registered = entry.registered.clone();
        registered.priority = priority;
        let target_type = registered.function.target_type();
        registry.by_id.insert(
            id.clone(),
            Arc::new(Entry {
                registered,
                sequence: entry.sequence,
            }),
        );
        registry.reindex(target_type);
        self.version.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// All registered functions of a target type, in resolution order.
    pub fn functions_for(&self, target_type: ComputationTargetType) -> Vec<RegisteredFunction> {
        self.registry
            .read()
            .by_type
            .get(&target_type)
            .map(|entries| entries.iter().map(|e| e.registered.clone()).collect())
            .unwrap_or_default()
    }
}

impl FunctionRepository for InMemoryFunctionRepository {
    fn find_candidates(&self, target: &ComputationTarget, value_name: &str) -> Vec<RegisteredFunction> {
        let registry = self.registry.read();
        let key = (target.target_type(), value_name.to_string());
        let Some(entries) = registry.by_output.get(&key) else {
            return Vec::new();
        };
        entries
            .iter()
            .filter(|e| e.registered.function.can_apply_to(target))
            .map(|e| e.registered.clone())
            .collect()
    }

    fn get(&self, id: &FunctionId) -> Option<RegisteredFunction> {
        self.registry
            .read()
            .by_id
            .get(id)
            .map(|e| e.registered.clone())
    }

    fn len(&self) -> usize {
        self.registry.read().by_id.len()
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}
