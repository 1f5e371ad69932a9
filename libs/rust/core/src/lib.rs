//! Ensemble inference core.
//!
//! A [`ModelRegistry`] names the available models, the [`ModelManager`] loads
//! and caches their backends on demand, and the [`PredictionEngine`] fans one
//! input out to several models through a bounded [`InferencePool`] and
//! aggregates what comes back, optionally serving repeats from a short-lived
//! [`ResultCache`]. [`EnsembleContext`] wires them together from an
//! [`EnsembleConfig`].

pub mod aggregate;
pub mod backend;
pub mod cache;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod manager;
pub mod memory;
pub mod pool;
pub mod registry;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use aggregate::{aggregate, AggregationPolicy};
pub use backend::{ArtifactLoader, Backend, BackendError, BackendLoader, LinearBackend};
pub use cache::{ResultCache, ResultKey};
pub use config::EnsembleConfig;
pub use context::EnsembleContext;
pub use engine::{ModelOutcome, OutcomeStatus, PredictOptions, PredictionEngine, PredictionResult};
pub use error::{EnsembleError, Result};
pub use manager::{CacheEntryStatus, LoadState, ManagerOptions, ModelHandle, ModelManager};
pub use memory::MemorySnapshot;
pub use pool::InferencePool;
pub use registry::{BackendKind, ModelDescriptor, ModelRegistry};
pub use telemetry::{init_tracing, metrics};
