//! Runtime configuration.
//!
//! Layering: built-in defaults, then an optional file named by
//! `ENSEMBLE_CONFIG_FILE` (format by extension), then `ENSEMBLE__*` environment
//! variables (e.g. `ENSEMBLE__CACHE_CAPACITY=4`).

use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::error::{EnsembleError, Result};
use crate::registry::ModelDescriptor;

pub const CONFIG_FILE_ENV: &str = "ENSEMBLE_CONFIG_FILE";

fn default_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    /// Soft cap on models kept loaded.
    pub cache_capacity: usize,
    pub max_concurrent_loads: usize,
    pub load_timeout_ms: u64,
    pub load_retries: usize,
    pub load_retry_delay_ms: u64,
    pub inference_workers: usize,
    pub inference_queue_depth: usize,
    pub predict_timeout_ms: u64,
    /// Default per-call fan-out bound; unset means one task per requested model.
    pub max_fan_out: Option<usize>,
    /// Inputs processed per round in `predict_batch`.
    pub max_batch_size: usize,
    /// Bound on cached prediction results; 0 disables the result cache.
    pub result_cache_capacity: usize,
    pub result_cache_sweep_ms: u64,
    pub models: Vec<ModelDescriptor>,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 8,
            max_concurrent_loads: 2,
            load_timeout_ms: 60_000,
            load_retries: 0,
            load_retry_delay_ms: 100,
            inference_workers: default_workers(),
            inference_queue_depth: 256,
            predict_timeout_ms: 5_000,
            max_fan_out: None,
            max_batch_size: 100,
            result_cache_capacity: 1024,
            result_cache_sweep_ms: 60_000,
            models: Vec::new(),
        }
    }
}

impl EnsembleConfig {
    /// Load from file (if `ENSEMBLE_CONFIG_FILE` is set) and environment.
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_FILE_ENV).ok();
        Self::load_from(file.as_deref())
    }

    pub fn load_from(file: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(config::File::with_name(file).required(true));
        }
        builder = builder.add_source(config::Environment::with_prefix("ENSEMBLE").separator("__").try_parsing(true));
        let cfg: Self = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        info!(
            cache_capacity = cfg.cache_capacity,
            max_concurrent_loads = cfg.max_concurrent_loads,
            inference_workers = cfg.inference_workers,
            models = cfg.models.len(),
            "ensemble config loaded"
        );
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("cache_capacity", self.cache_capacity),
            ("max_concurrent_loads", self.max_concurrent_loads),
            ("inference_workers", self.inference_workers),
            ("inference_queue_depth", self.inference_queue_depth),
            ("max_batch_size", self.max_batch_size),
        ];
        if let Some((key, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(EnsembleError::Config(format!("{key} must be greater than zero")));
        }
        if self.max_fan_out == Some(0) {
            return Err(EnsembleError::Config("max_fan_out must be greater than zero when set".into()));
        }
        if self.predict_timeout_ms == 0 || self.load_timeout_ms == 0 || self.result_cache_sweep_ms == 0 {
            return Err(EnsembleError::Config("timeouts and intervals must be greater than zero".into()));
        }
        Ok(())
    }

    pub fn load_timeout(&self) -> Duration { Duration::from_millis(self.load_timeout_ms) }
    pub fn load_retry_delay(&self) -> Duration { Duration::from_millis(self.load_retry_delay_ms) }
    pub fn predict_timeout(&self) -> Duration { Duration::from_millis(self.predict_timeout_ms) }
    pub fn result_cache_sweep(&self) -> Duration { Duration::from_millis(self.result_cache_sweep_ms) }
}
