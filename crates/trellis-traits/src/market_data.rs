//! Market data traits.
//!
//! The engine does not manage subscriptions or normalise ticks. It consumes:
//! - [`MarketDataSnapshot`]: an immutable view of current values
//! - [`MarketDataProvider`]: hands out snapshots and reports which keys changed
//!
//! Ingestion and wire transport of market data live outside the engine.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ids::MarketDataKey;
use crate::value::DataValue;

/// Source type for market data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceType {
    /// Real-time streaming feed
    Live,
    /// Historical / end-of-day snapshot
    Historical,
    /// User-supplied values (scenarios, overrides)
    Manual,
}

/// An immutable view over market data values at one point in time.
pub trait MarketDataSnapshot: Send + Sync {
    /// Monotonic snapshot identifier.
    fn snapshot_id(&self) -> u64;

    /// Current value for a key, if the snapshot has one.
    fn current_value(&self, key: &MarketDataKey) -> Option<DataValue>;

    /// Number of values in the snapshot.
    fn len(&self) -> usize;

    /// Whether the snapshot holds no values.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Provider of market data snapshots and change notifications.
pub trait MarketDataProvider: Send + Sync {
    /// Source type of this provider.
    fn source_type(&self) -> SourceType;

    /// Take a snapshot of current values.
    fn snapshot(&self) -> Arc<dyn MarketDataSnapshot>;

    /// Keys whose values changed since the previous call.
    ///
    /// Draining: a key is reported once per change.
    fn changed_keys(&self) -> HashSet<MarketDataKey>;
}
