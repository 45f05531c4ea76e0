//! Computation target resolution.

use dashmap::DashMap;

use crate::value::{ComputationTarget, ComputationTargetSpecification, ComputationTargetType};

/// Resolves target identities into targets.
///
/// Stands in for the security/position/portfolio masters, which live outside
/// the engine.
pub trait ComputationTargetResolver: Send + Sync {
    /// Resolves a target, or `None` if it does not exist.
    fn resolve(&self, specification: &ComputationTargetSpecification) -> Option<ComputationTarget>;
}

/// In-memory target resolver.
///
/// Primitive targets resolve to themselves unless the resolver is strict.
pub struct InMemoryTargetResolver {
    targets: DashMap<ComputationTargetSpecification, ComputationTarget>,
    resolve_primitives: bool,
}

impl InMemoryTargetResolver {
    /// Creates a resolver that passes primitives through.
    pub fn new() -> Self {
        Self {
            targets: DashMap::new(),
            resolve_primitives: true,
        }
    }

    /// Creates a resolver that only resolves registered targets.
    pub fn strict() -> Self {
        Self {
            targets: DashMap::new(),
            resolve_primitives: false,
        }
    }

    /// Registers or replaces a target.
    pub fn insert(&self, target: ComputationTarget) {
        self.targets.insert(target.specification.clone(), target);
    }

    /// Registers a target, builder style.
    pub fn with_target(self, target: ComputationTarget) -> Self {
        self.insert(target);
        self
    }

    /// Removes a target.
    pub fn remove(&self, specification: &ComputationTargetSpecification) -> Option<ComputationTarget> {
        self.targets.remove(specification).map(|(_, t)| t)
    }

    /// Number of registered targets.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether no targets are registered.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl Default for InMemoryTargetResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputationTargetResolver for InMemoryTargetResolver {
    fn resolve(&self, specification: &ComputationTargetSpecification) -> Option<ComputationTarget> {
        if let Some(target) = self.targets.get(specification) {
            return Some(target.clone());
        }
        if self.resolve_primitives && specification.target_type == ComputationTargetType::Primitive {
            return Some(ComputationTarget::new(specification.clone()));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registered_targets_resolve() {
        let resolver = InMemoryTargetResolver::new().with_target(
            ComputationTarget::new(ComputationTargetSpecification::security("AAPL"))
                .with_attribute("Currency", "USD"),
        );
        let target = resolver
            .resolve(&ComputationTargetSpecification::security("AAPL"))
            .unwrap();
        assert_eq!(target.attribute("Currency"), Some("USD"));
        assert!(resolver
            .resolve(&ComputationTargetSpecification::security("MSFT"))
            .is_none());
    }

    #[test]
    fn test_primitive_pass_through() {
        let usd = ComputationTargetSpecification::primitive("USD");
        assert!(InMemoryTargetResolver::new().resolve(&usd).is_some());
        assert!(InMemoryTargetResolver::strict().resolve(&usd).is_none());
    }
}
