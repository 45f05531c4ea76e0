//! Market data sourcing for the engine.
//!
//! - [`MarketDataAvailabilityProvider`]: decides which requirements are satisfied
//!   directly by market data (these become leaf nodes of the graph)
//! - [`InMemoryMarketDataProvider`]: a settable in-process feed with change tracking
//! - [`MarketDataFanout`]: shares one feed between views, each draining its own changes

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use trellis_traits::ids::MarketDataKey;
use trellis_traits::market_data::{MarketDataProvider, MarketDataSnapshot, SourceType};
use trellis_traits::value::DataValue;

use crate::value::{ComputationTargetSpecification, ValueRequirement};

// =============================================================================
// AVAILABILITY
// =============================================================================

/// Maps requirements onto market data keys.
pub trait MarketDataAvailabilityProvider: Send + Sync {
    /// Key sourcing this requirement, or `None` if it is not market data.
    fn resolve(&self, requirement: &ValueRequirement) -> Option<MarketDataKey>;
}

/// No requirement is market data.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMarketData;

impl MarketDataAvailabilityProvider for NoMarketData {
    fn resolve(&self, _requirement: &ValueRequirement) -> Option<MarketDataKey> {
        None
    }
}

/// Explicit (value name, target) → key table.
#[derive(Debug, Clone, Default)]
pub struct FixedMarketDataAvailability {
    entries: HashMap<(String, ComputationTargetSpecification), MarketDataKey>,
}

impl FixedMarketDataAvailability {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry.
    pub fn with(
        mut self,
        value_name: impl Into<String>,
        target: ComputationTargetSpecification,
        key: impl Into<MarketDataKey>,
    ) -> Self {
        self.insert(value_name, target, key);
        self
    }

    /// Adds an entry in place.
    pub fn insert(
        &mut self,
        value_name: impl Into<String>,
        target: ComputationTargetSpecification,
        key: impl Into<MarketDataKey>,
    ) {
        self.entries.insert((value_name.into(), target), key.into());
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl MarketDataAvailabilityProvider for FixedMarketDataAvailability {
    fn resolve(&self, requirement: &ValueRequirement) -> Option<MarketDataKey> {
        self.entries
            .get(&(requirement.value_name.clone(), requirement.target.clone()))
            .cloned()
    }
}

/// Treats a fixed set of value names as market data on any target, keyed
/// `"{target id}.{value name}"`.
#[derive(Debug, Clone, Default)]
pub struct ConventionMarketDataAvailability {
    value_names: HashSet<String>,
}

impl ConventionMarketDataAvailability {
    /// Creates the convention for the given value names.
    pub fn new<I, S>(value_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            value_names: value_names.into_iter().map(Into::into).collect(),
        }
    }

    /// Key for a value on a target.
    pub fn key_for(value_name: &str, target: &ComputationTargetSpecification) -> MarketDataKey {
        MarketDataKey::new(format!("{}.{}", target.id, value_name))
    }
}

impl MarketDataAvailabilityProvider for ConventionMarketDataAvailability {
    fn resolve(&self, requirement: &ValueRequirement) -> Option<MarketDataKey> {
        if self.value_names.contains(&requirement.value_name) {
            Some(Self::key_for(&requirement.value_name, &requirement.target))
        } else {
            None
        }
    }
}

// =============================================================================
// IN-MEMORY PROVIDER
// =============================================================================

/// Immutable map-backed snapshot.
#[derive(Debug, Clone)]
pub struct MapSnapshot {
    id: u64,
    values: Arc<HashMap<MarketDataKey, DataValue>>,
}

impl MapSnapshot {
    /// Creates a snapshot from a map.
    pub fn new(id: u64, values: HashMap<MarketDataKey, DataValue>) -> Self {
        Self {
            id,
            values: Arc::new(values),
        }
    }
}

impl MarketDataSnapshot for MapSnapshot {
    fn snapshot_id(&self) -> u64 {
        self.id
    }

    fn current_value(&self, key: &MarketDataKey) -> Option<DataValue> {
        self.values.get(key).cloned()
    }

    fn len(&self) -> usize {
        self.values.len()
    }
}

/// Settable market data source.
///
/// `set` and `remove` record the key as changed; [`MarketDataProvider::changed_keys`]
/// drains the record. Setting an unchanged value is not a change.
pub struct InMemoryMarketDataProvider {
    source_type: SourceType,
    values: RwLock<Arc<HashMap<MarketDataKey, DataValue>>>,
    changed: Mutex<HashSet<MarketDataKey>>,
    snapshot_seq: AtomicU64,
}

impl InMemoryMarketDataProvider {
    /// Creates an empty live provider.
    pub fn new() -> Self {
        Self::with_source_type(SourceType::Live)
    }

    /// Creates an empty provider of the given source type.
    pub fn with_source_type(source_type: SourceType) -> Self {
        Self {
            source_type,
            values: RwLock::new(Arc::new(HashMap::new())),
            changed: Mutex::new(HashSet::new()),
            snapshot_seq: AtomicU64::new(0),
        }
    }

    /// Sets a value. Returns true if it changed.
    pub fn set(&self, key: impl Into<MarketDataKey>, value: impl Into<DataValue>) -> bool {
        let key = key.into();
        let value = value.into();
        let mut values = self.values.write();
        if values.get(&key) == Some(&value) {
            return false;
        }
        trace!(key = %key, "market data updated");
        Arc::make_mut(&mut *values).insert(key.clone(), value);
        self.changed.lock().insert(key);
        true
    }

    /// Sets many values at once.
    pub fn set_all<I, K, V>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<MarketDataKey>,
        V: Into<DataValue>,
    {
        entries
            .into_iter()
            .map(|(k, v)| self.set(k, v))
            .filter(|changed| *changed)
            .count()
    }

    /// Removes a value. Returns the previous value.
    pub fn remove(&self, key: &MarketDataKey) -> Option<DataValue> {
        let mut values = self.values.write();
        let previous = Arc::make_mut(&mut *values).remove(key);
        if previous.is_some() {
            self.changed.lock().insert(key.clone());
        }
        previous
    }

    /// Current value for a key.
    pub fn get(&self, key: &MarketDataKey) -> Option<DataValue> {
        self.values.read().get(key).cloned()
    }

    /// Keys changed since the last drain, without draining.
    pub fn pending_changes(&self) -> usize {
        self.changed.lock().len()
    }
}

impl Default for InMemoryMarketDataProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketDataProvider for InMemoryMarketDataProvider {
    fn source_type(&self) -> SourceType {
        self.source_type
    }

    fn snapshot(&self) -> Arc<dyn MarketDataSnapshot> {
        let id = self.snapshot_seq.fetch_add(1, Ordering::SeqCst) + 1;
        Arc::new(MapSnapshot {
            id,
            values: Arc::clone(&self.values.read()),
        })
    }

    fn changed_keys(&self) -> HashSet<MarketDataKey> {
        std::mem::take(&mut *self.changed.lock())
    }
}

// =============================================================================
// FAN-OUT
// =============================================================================

/// Shares one provider between several consumers.
///
/// `changed_keys` drains the source, so two views reading the same provider
/// directly would steal each other's changes. Each subscriber here keeps its
/// own pending set.
pub struct MarketDataFanout {
    source: Arc<dyn MarketDataProvider>,
    subscribers: Mutex<Vec<Weak<Mutex<HashSet<MarketDataKey>>>>>,
}

impl MarketDataFanout {
    /// Wraps a provider.
    pub fn new(source: Arc<dyn MarketDataProvider>) -> Arc<Self> {
        Arc::new(Self {
            source,
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// New subscriber; sees changes made after this call.
    pub fn subscribe(self: &Arc<Self>) -> FanoutSubscriber {
        self.pump();
        let pending = Arc::new(Mutex::new(HashSet::new()));
        self.subscribers.lock().push(Arc::downgrade(&pending));
        FanoutSubscriber {
            hub: Arc::clone(self),
            pending,
        }
    }

    /// Live subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().iter().filter(|w| w.strong_count() > 0).count()
    }

    /// Moves source changes into every live subscriber.
    fn pump(&self) {
        let mut subscribers = self.subscribers.lock();
        let changed = self.source.changed_keys();
        subscribers.retain(|w| w.strong_count() > 0);
        if changed.is_empty() {
            return;
        }
        for pending in subscribers.iter().filter_map(Weak::upgrade) {
            pending.lock().extend(changed.iter().cloned());
        }
    }
}

/// One consumer of a [`MarketDataFanout`].
pub struct FanoutSubscriber {
    hub: Arc<MarketDataFanout>,
    pending: Arc<Mutex<HashSet<MarketDataKey>>>,
}

impl MarketDataProvider for FanoutSubscriber {
    fn source_type(&self) -> SourceType {
        self.hub.source.source_type()
    }

    fn snapshot(&self) -> Arc<dyn MarketDataSnapshot> {
        self.hub.source.snapshot()
    }

    fn changed_keys(&self) -> HashSet<MarketDataKey> {
        self.hub.pump();
        std::mem::take(&mut *self.pending.lock())
    }
}
