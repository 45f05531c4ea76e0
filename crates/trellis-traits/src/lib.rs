//! # Trellis Traits
//!
//! Trait definitions and shared types for the Trellis computation engine.
//!
//! This crate contains only definitions and carries no async runtime.
//! All implementations are in the engine or in extension crates.
//!
//! ## Module Structure
//!
//! - [`ids`]: Identifier newtypes (targets, functions, market data keys, workers, jobs)
//! - [`value`]: Runtime data values
//! - [`market_data`]: Traits for market data snapshots and change notification
//! - [`transport`]: Traits for worker communication and wire codecs
//! - [`config`]: Engine configuration
//!
//! ## Dependency Injection
//!
//! The engine uses these traits via dependency injection:
//!
//! ```ignore
//! ComputeEngineBuilder::new()
//!     .with_market_data(impl MarketDataProvider)
//!     .with_worker(RemoteWorker::new(impl WorkerConnection, JsonCodec))
//!     .with_config(EngineConfig::default())
//!     .build()
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod ids;
pub mod market_data;
pub mod transport;
pub mod value;

// Re-export commonly used types
pub use error::TraitError;
pub use ids::*;
pub use value::DataValue;
