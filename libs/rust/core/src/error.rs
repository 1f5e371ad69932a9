//! Error types for the ensemble core.

use thiserror::Error;

/// Errors surfaced by the registry, manager and prediction engine.
///
/// Per-model variants (`UnknownModel`, `ModelLoad`, `Inference`) are recorded in a
/// prediction's per-model status; the rest fail a whole call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnsembleError {
    /// Name not present in the registry
    #[error("unknown model '{0}'")]
    UnknownModel(String),

    /// Name already registered
    #[error("model '{0}' is already registered")]
    DuplicateModel(String),

    /// Backend deserialization or initialization failed
    #[error("failed to load model '{name}': {reason}")]
    ModelLoad { name: String, reason: String },

    /// Backend raised during inference
    #[error("inference failed for model '{name}': {reason}")]
    Inference { name: String, reason: String },

    /// Succeeding models disagree on output length
    #[error("output dimension mismatch across models: {}", format_dims(.dims))]
    DimensionMismatch { dims: Vec<(String, usize)> },

    /// No requested model produced an output. Carries each model's failure.
    #[error("all {} requested models failed{}", .failures.len(), format_failures(.failures))]
    AllModelsFailed { failures: Vec<(String, String)> },

    /// Whole call exceeded its budget
    #[error("prediction timed out after {budget_ms}ms")]
    Timeout { budget_ms: u64 },

    /// Invalid configuration or descriptor
    #[error("configuration error: {0}")]
    Config(String),

    /// Manager is tearing down and no longer hands out models
    #[error("model manager is shutting down")]
    ShuttingDown,
}

fn format_dims(dims: &[(String, usize)]) -> String {
    dims.iter().map(|(n, d)| format!("{n}={d}")).collect::<Vec<_>>().join(", ")
}

fn format_failures(failures: &[(String, String)]) -> String {
    if failures.is_empty() {
        return String::new();
    }
    let parts: Vec<String> = failures.iter().map(|(n, e)| format!("{n}: {e}")).collect();
    format!(" ({})", parts.join("; "))
}

impl EnsembleError {
    /// True for errors that only affect a single model within a batch.
    ///
    /// `ShuttingDown` counts as per-model: it is what `acquire` returns for
    /// each model once the manager is closed, so the call still reports every
    /// requested name and fails as `AllModelsFailed` when none succeeded.
    pub fn is_per_model(&self) -> bool {
        matches!(self, Self::UnknownModel(_) | Self::ModelLoad { .. } | Self::Inference { .. } | Self::ShuttingDown)
    }
}

impl From<config::ConfigError> for EnsembleError {
    fn from(e: config::ConfigError) -> Self { Self::Config(e.to_string()) }
}

/// Result type alias for ensemble operations.
pub type Result<T> = std::result::Result<T, EnsembleError>;
