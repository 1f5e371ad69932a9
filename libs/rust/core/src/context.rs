//! Wiring of registry, manager, worker pool and engine from one config.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::backend::{ArtifactLoader, BackendLoader};
use crate::config::EnsembleConfig;
use crate::engine::{PredictOptions, PredictionEngine, PredictionResult};
use crate::error::{EnsembleError, Result};
use crate::manager::{CacheEntryStatus, ManagerOptions, ModelManager};
use crate::pool::InferencePool;
use crate::registry::ModelRegistry;

/// Owns every long-lived component. Must be started inside a tokio runtime.
pub struct EnsembleContext {
    config: EnsembleConfig,
    registry: Arc<ModelRegistry>,
    manager: ModelManager,
    pool: Arc<InferencePool>,
    engine: PredictionEngine,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl EnsembleContext {
    /// Start with the filesystem artifact loader.
    pub fn start(config: EnsembleConfig) -> Result<Self> { Self::with_loader(config, Arc::new(ArtifactLoader)) }

    pub fn with_loader(config: EnsembleConfig, loader: Arc<dyn BackendLoader>) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(ModelRegistry::new());
        for descriptor in &config.models {
            registry.register(descriptor.clone())?;
        }
        let manager = ModelManager::new(registry.clone(), loader, ManagerOptions::from(&config));
        let pool = Arc::new(InferencePool::new(config.inference_workers, config.inference_queue_depth));
        let engine = PredictionEngine::new(manager.clone(), pool.clone(), &config);
        let sweeper = (config.result_cache_capacity > 0).then(|| engine.result_cache().spawn_sweeper(config.result_cache_sweep()));
        info!(
            models = registry.len(),
            cache_capacity = config.cache_capacity,
            result_cache_capacity = config.result_cache_capacity,
            workers = pool.size(),
            "ensemble context started"
        );
        Ok(Self { config, registry, manager, pool, engine, sweeper: Mutex::new(sweeper) })
    }

    pub fn config(&self) -> &EnsembleConfig { &self.config }
    pub fn registry(&self) -> &Arc<ModelRegistry> { &self.registry }
    pub fn manager(&self) -> &ModelManager { &self.manager }
    pub fn engine(&self) -> &PredictionEngine { &self.engine }

    pub async fn predict<S: AsRef<str>>(&self, input: &[f32], model_names: &[S], opts: PredictOptions) -> Result<PredictionResult> {
        self.engine.predict(input, model_names, opts).await
    }

    pub async fn predict_batch<S: AsRef<str>>(
        &self,
        inputs: &[Vec<f32>],
        model_names: &[S],
        opts: PredictOptions,
    ) -> Result<Vec<Result<PredictionResult>>> {
        self.engine.predict_batch(inputs, model_names, opts).await
    }

    /// Load every registered model ahead of traffic.
    pub async fn preload(&self) -> Vec<EnsembleError> {
        let mut names: Vec<String> = self.registry.list_names().collect();
        names.sort();
        self.manager.preload(names).await
    }

    pub fn status(&self) -> Vec<CacheEntryStatus> { self.manager.status() }

    /// Drain queued inference, then unload idle models. Returns how many models
    /// stayed resident because a caller still holds them.
    pub async fn shutdown(&self) -> usize {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        self.engine.result_cache().clear();
        self.pool.join().await;
        self.manager.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::LinearBackend;
    use crate::manager::LoadState;
    use crate::registry::{BackendKind, ModelDescriptor};
    use crate::testing::ScriptedLoader;

    fn config() -> EnsembleConfig {
        EnsembleConfig {
            inference_workers: 2,
            models: vec![
                ModelDescriptor::new("echo", BackendKind::Linear, "echo.json"),
                ModelDescriptor::new("plus_one", BackendKind::Linear, "plus_one.json"),
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn start_preload_predict_shutdown() {
        let loader = ScriptedLoader::new().model("echo", LinearBackend::identity()).model("plus_one", LinearBackend::offset(1.0));
        let ctx = EnsembleContext::with_loader(config(), Arc::new(loader)).unwrap();
        assert!(ctx.preload().await.is_empty());
        assert!(ctx.status().iter().all(|s| s.state == LoadState::Ready));

        let res = ctx.predict(&[1.0, 2.0, 3.0], &["echo", "plus_one"], PredictOptions::default()).await.unwrap();
        assert_eq!(res.aggregated, vec![1.5, 2.5, 3.5]);

        assert_eq!(ctx.shutdown().await, 0);
        assert!(ctx.status().iter().all(|s| s.state == LoadState::Unloaded));
    }

    #[tokio::test]
    async fn batch_and_cached_predictions_until_shutdown() {
        let loader = ScriptedLoader::new().model("echo", LinearBackend::identity()).model("plus_one", LinearBackend::offset(1.0));
        let ctx = EnsembleContext::with_loader(config(), Arc::new(loader)).unwrap();
        let opts = PredictOptions::default().with_cache_ttl(Duration::from_secs(30));

        let items = ctx.predict_batch(&[vec![0.0], vec![2.0]], &["echo", "plus_one"], opts.clone()).await.unwrap();
        let aggregated: Vec<Vec<f32>> = items.into_iter().map(|i| i.unwrap().aggregated).collect();
        assert_eq!(aggregated, vec![vec![0.5], vec![2.5]]);

        let hit = ctx.predict(&[2.0], &["echo", "plus_one"], opts).await.unwrap();
        assert!(hit.cache_hit);
        assert!(ctx.sweeper.lock().is_some());

        assert_eq!(ctx.shutdown().await, 0);
        assert!(ctx.sweeper.lock().is_none());
        assert!(ctx.engine().result_cache().is_empty());
    }

    #[tokio::test]
    async fn duplicate_descriptor_in_config_is_rejected() {
        let mut cfg = config();
        cfg.models.push(ModelDescriptor::new("echo", BackendKind::Linear, "other.json"));
        assert!(matches!(EnsembleContext::with_loader(cfg, Arc::new(ScriptedLoader::new())), Err(EnsembleError::DuplicateModel(n)) if n == "echo"));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let cfg = EnsembleConfig { inference_queue_depth: 0, ..config() };
        assert!(matches!(EnsembleContext::start(cfg), Err(EnsembleError::Config(_))));
    }
}
