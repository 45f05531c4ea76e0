//! Computation cache.
//!
//! Computed values keyed by [`ValueSpecification`] (structural equality). The
//! cache is shared by every cycle and view of an engine and is the only
//! structure written concurrently. Cycles only overwrite entries, so a view
//! never loses an input another view is about to read;
//! [`ComputationCache::invalidate`] is for callers that want values dropped.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use trellis_traits::value::DataValue;

use crate::job::CycleId;
use crate::value::{ComputedValue, ValueSpecification};

/// A cached value with provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    /// The cached value.
    pub value: DataValue,
    /// Cycle that wrote the value, if written by a cycle.
    pub cycle_id: Option<CycleId>,
    /// When the value was written.
    pub written_at: DateTime<Utc>,
}

impl CachedValue {
    /// Creates a cached value stamped now.
    pub fn new(value: DataValue, cycle_id: Option<CycleId>) -> Self {
        Self {
            value,
            cycle_id,
            written_at: Utc::now(),
        }
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Current number of entries.
    pub entries: usize,
    /// Successful lookups.
    pub hits: u64,
    /// Failed lookups.
    pub misses: u64,
    /// Writes (including overwrites).
    pub writes: u64,
    /// Entries removed by invalidation.
    pub invalidations: u64,
}

impl CacheStats {
    /// Hit ratio in [0, 1]; zero when nothing was looked up.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Concurrent value cache keyed by specification.
///
/// Concurrent `put`s for one key are last-writer-wins.
#[derive(Debug, Default)]
pub struct ComputationCache {
    entries: DashMap<ValueSpecification, CachedValue>,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    invalidations: AtomicU64,
}

impl ComputationCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a value outside any cycle.
    pub fn put(&self, specification: ValueSpecification, value: DataValue) {
        self.put_for_cycle(specification, value, None);
    }

    /// Stores a value written by a cycle.
    pub fn put_for_cycle(&self, specification: ValueSpecification, value: DataValue, cycle_id: Option<CycleId>) {
        self.entries
            .insert(specification, CachedValue::new(value, cycle_id));
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Stores many values.
    pub fn put_all(&self, values: impl IntoIterator<Item = ComputedValue>, cycle_id: Option<CycleId>) -> usize {
        let mut n = 0;
        for computed in values {
            self.put_for_cycle(computed.specification, computed.value, cycle_id);
            n += 1;
        }
        n
    }

    /// Looks up a value.
    pub fn get(&self, specification: &ValueSpecification) -> Option<DataValue> {
        self.get_entry(specification).map(|e| e.value)
    }

    /// Looks up a value with its provenance.
    pub fn get_entry(&self, specification: &ValueSpecification) -> Option<CachedValue> {
        match self.entries.get(specification) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Whether a value is present. Does not count as a lookup.
    pub fn contains(&self, specification: &ValueSpecification) -> bool {
        self.entries.contains_key(specification)
    }

    /// Removes a value.
    pub fn remove(&self, specification: &ValueSpecification) -> Option<DataValue> {
        self.entries.remove(specification).map(|(_, e)| e.value)
    }

    /// Removes every entry matching the predicate. Returns the number removed.
    pub fn invalidate<F>(&self, predicate: F) -> usize
    where
        F: Fn(&ValueSpecification, &CachedValue) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|spec, entry| !predicate(spec, entry));
        let removed = before.saturating_sub(self.entries.len());
        self.invalidations.fetch_add(removed as u64, Ordering::Relaxed);
        if removed > 0 {
            tracing::debug!(removed, "cache entries invalidated");
        }
        removed
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes all entries.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Cache counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}
