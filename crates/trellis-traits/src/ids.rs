//! Identifier types used across the computation engine.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            #[doc = concat!("Create a new `", stringify!($name), "`.")]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the ID as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a computation target (security, position, trade, portfolio node).
    TargetId
);

string_id!(
    /// Identifier of a calculation function registered in a function repository.
    FunctionId
);

string_id!(
    /// Key into a market data snapshot (e.g. "AAPL.LAST", "USD.SOFR.3M").
    MarketDataKey
);

string_id!(
    /// Name of a set of mutually exclusive calculation functions.
    ///
    /// Two functions in the same group never appear as ancestor and descendant
    /// within one resolution branch.
    ExclusionGroup
);

string_id!(
    /// Identifier of a calculation worker.
    WorkerId
);

/// Calculation job identifier, unique within a scheduler.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl JobId {
    /// Create a new job ID.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_ids() {
        let target = TargetId::new("AAPL");
        assert_eq!(target.as_str(), "AAPL");
        assert_eq!(target.to_string(), "AAPL");
        assert_eq!(TargetId::from("AAPL"), target);

        let group: ExclusionGroup = String::from("CURVE_BUILD").into();
        assert_eq!(group.as_str(), "CURVE_BUILD");
    }

    #[test]
    fn test_job_id_display() {
        assert_eq!(JobId::new(42).to_string(), "job-42");
        assert!(JobId::new(1) < JobId::new(2));
    }
}
