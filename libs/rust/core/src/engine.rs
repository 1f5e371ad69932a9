//! Ensemble prediction: fan one input out to several models, collect every
//! outcome and aggregate the successful outputs.
//!
//! A model that fails to resolve, load or infer is reported in the result's
//! per-model list and excluded from aggregation. The call itself fails only
//! when no model succeeds, when successful outputs disagree on length, or when
//! the whole call overruns its time budget.
//!
//! `predict_batch` applies the same rules to each input of a batch while
//! acquiring every model once for the whole batch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use serde::{Serialize, Serializer};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::aggregate::{aggregate, Aggregate, AggregationPolicy, Contribution};
use crate::cache::{ResultCache, ResultKey};
use crate::config::EnsembleConfig;
use crate::error::{EnsembleError, Result};
use crate::manager::{ModelHandle, ModelManager};
use crate::memory::MemorySnapshot;
use crate::pool::InferencePool;
use crate::telemetry::metrics;

/// Per-call knobs. Unset fields fall back to the engine's configured defaults.
#[derive(Debug, Clone, Default)]
pub struct PredictOptions {
    pub timeout: Option<Duration>,
    /// Upper bound on models resolved and inferred at once within this call.
    pub max_concurrency: Option<usize>,
    pub aggregation: AggregationPolicy,
    /// Serve and store successful results in the result cache for this long.
    /// `None` bypasses the cache entirely.
    pub cache_ttl: Option<Duration>,
    /// Inputs run per round in `predict_batch`.
    pub max_batch_size: Option<usize>,
}

impl PredictOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    pub fn with_aggregation(mut self, policy: AggregationPolicy) -> Self {
        self.aggregation = policy;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = Some(size);
        self
    }
}

fn display<S: Serializer>(err: &EnsembleError, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.collect_str(err)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failed {
        #[serde(serialize_with = "display")]
        error: EnsembleError,
    },
}

/// What happened to one requested model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelOutcome {
    pub name: String,
    #[serde(flatten)]
    pub status: OutcomeStatus,
    pub output: Option<Vec<f32>>,
    /// Descriptor weight, 0 when the model could not be resolved.
    pub weight: f32,
    /// Acquire plus inference, in milliseconds. Batch items report inference only.
    pub latency_ms: f64,
}

impl ModelOutcome {
    fn success(name: String, output: Vec<f32>, weight: f32, latency_ms: f64) -> Self {
        Self { name, status: OutcomeStatus::Success, output: Some(output), weight, latency_ms }
    }

    fn failure(name: String, error: EnsembleError, latency_ms: f64) -> Self {
        Self { name, status: OutcomeStatus::Failed { error }, output: None, weight: 0.0, latency_ms }
    }

    pub fn failed(&self) -> bool { matches!(self.status, OutcomeStatus::Failed { .. }) }

    pub fn error(&self) -> Option<&EnsembleError> {
        match &self.status {
            OutcomeStatus::Failed { error } => Some(error),
            OutcomeStatus::Success => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictionResult {
    /// One entry per requested name, in request order. Duplicated names appear
    /// once per request.
    pub models: Vec<ModelOutcome>,
    pub aggregated: Vec<f32>,
    /// Elementwise standard deviation across successful models.
    pub spread: Vec<f32>,
    pub aggregation: AggregationPolicy,
    pub total_latency_ms: f64,
    pub memory: MemorySnapshot,
    /// Served from the result cache; `models` and `memory` are from the original run.
    pub cache_hit: bool,
}

impl PredictionResult {
    fn new(models: Vec<ModelOutcome>, agg: Aggregate, aggregation: AggregationPolicy, total_latency_ms: f64, memory: MemorySnapshot) -> Self {
        Self { models, aggregated: agg.values, spread: agg.spread, aggregation, total_latency_ms, memory, cache_hit: false }
    }

    /// Successful outputs by name; the first occurrence wins for duplicated names.
    pub fn results(&self) -> Vec<(&str, &[f32])> {
        let mut out: Vec<(&str, &[f32])> = Vec::new();
        for m in &self.models {
            if let Some(output) = m.output.as_deref() {
                if !out.iter().any(|(n, _)| *n == m.name) {
                    out.push((&m.name, output));
                }
            }
        }
        out
    }

    pub fn output(&self, name: &str) -> Option<&[f32]> {
        self.models.iter().filter(|m| m.name == name).find_map(|m| m.output.as_deref())
    }

    /// First outcome recorded for `name`.
    pub fn status(&self, name: &str) -> Option<&ModelOutcome> { self.models.iter().find(|m| m.name == name) }

    pub fn succeeded(&self) -> usize { self.models.iter().filter(|m| !m.failed()).count() }

    pub fn failed(&self) -> impl Iterator<Item = &ModelOutcome> { self.models.iter().filter(|m| m.failed()) }
}

/// Outcome of acquiring one distinct model for a batch.
struct Acquired {
    handle: Result<ModelHandle>,
    latency_ms: f64,
}

pub struct PredictionEngine {
    manager: ModelManager,
    pool: Arc<InferencePool>,
    cache: Arc<ResultCache>,
    default_timeout: Duration,
    max_fan_out: Option<usize>,
    max_batch_size: usize,
}

impl PredictionEngine {
    pub fn new(manager: ModelManager, pool: Arc<InferencePool>, cfg: &EnsembleConfig) -> Self {
        Self {
            manager,
            pool,
            cache: Arc::new(ResultCache::new(cfg.result_cache_capacity)),
            default_timeout: cfg.predict_timeout(),
            max_fan_out: cfg.max_fan_out,
            max_batch_size: cfg.max_batch_size.max(1),
        }
    }

    pub fn manager(&self) -> &ModelManager { &self.manager }

    pub fn result_cache(&self) -> &Arc<ResultCache> { &self.cache }

    pub fn default_timeout(&self) -> Duration { self.default_timeout }

    /// Run `input` through every named model and aggregate the successes.
    #[instrument(skip(self, input, model_names, opts), fields(models = model_names.len(), input_len = input.len()))]
    pub async fn predict<S: AsRef<str>>(&self, input: &[f32], model_names: &[S], opts: PredictOptions) -> Result<PredictionResult> {
        let started = Instant::now();
        metrics().predictions_total.add(1, &[]);
        let names: Vec<String> = model_names.iter().map(|n| n.as_ref().to_string()).collect();
        let budget = opts.timeout.unwrap_or(self.default_timeout);
        let key = opts.cache_ttl.map(|_| ResultKey::new(&names, input, opts.aggregation));

        let result = match key.as_ref().and_then(|k| self.cached(k, started)) {
            Some(hit) => Ok(hit),
            None => {
                let run = match tokio::time::timeout(budget, self.fan_out(input, &names, &opts)).await {
                    Ok(outcomes) => self.finish(outcomes, opts.aggregation, started).await,
                    Err(_) => Err(EnsembleError::Timeout { budget_ms: budget.as_millis() as u64 }),
                };
                if let (Some(key), Some(ttl), Ok(r)) = (key, opts.cache_ttl, &run) {
                    self.cache.insert(key, r.clone(), ttl);
                }
                run
            }
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics().predict_latency_ms.record(elapsed_ms, &[]);
        match &result {
            Ok(r) => info!(
                models = names.len(),
                succeeded = r.succeeded(),
                failed = names.len() - r.succeeded(),
                cache_hit = r.cache_hit,
                latency_ms = elapsed_ms,
                rss_mb = r.memory.process_rss_mb(),
                "prediction complete"
            ),
            Err(e) => {
                metrics().prediction_failures_total.add(1, &[]);
                warn!(models = names.len(), error = %e, latency_ms = elapsed_ms, "prediction failed");
            }
        }
        result
    }

    /// Run every input through every named model. Each distinct model is
    /// acquired once and held for the whole batch; inputs run in rounds of
    /// `max_batch_size`. Items fail independently; the timeout covers the
    /// whole batch.
    #[instrument(skip(self, inputs, model_names, opts), fields(items = inputs.len(), models = model_names.len()))]
    pub async fn predict_batch<S: AsRef<str>>(
        &self,
        inputs: &[Vec<f32>],
        model_names: &[S],
        opts: PredictOptions,
    ) -> Result<Vec<Result<PredictionResult>>> {
        let started = Instant::now();
        metrics().batch_predictions_total.add(1, &[]);
        let names: Vec<String> = model_names.iter().map(|n| n.as_ref().to_string()).collect();
        let budget = opts.timeout.unwrap_or(self.default_timeout);

        let result = match tokio::time::timeout(budget, self.run_batch(inputs, &names, &opts, started)).await {
            Ok(items) => Ok(items),
            Err(_) => Err(EnsembleError::Timeout { budget_ms: budget.as_millis() as u64 }),
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics().predict_latency_ms.record(elapsed_ms, &[KeyValue::new("mode", "batch")]);
        match &result {
            Ok(items) => info!(
                items = items.len(),
                succeeded = items.iter().filter(|r| r.is_ok()).count(),
                models = names.len(),
                latency_ms = elapsed_ms,
                "batch prediction complete"
            ),
            Err(e) => {
                metrics().prediction_failures_total.add(1, &[KeyValue::new("mode", "batch")]);
                warn!(items = inputs.len(), error = %e, latency_ms = elapsed_ms, "batch prediction failed");
            }
        }
        result
    }

    fn cached(&self, key: &ResultKey, started: Instant) -> Option<PredictionResult> {
        match self.cache.get(key) {
            Some(mut hit) => {
                metrics().result_cache_hits_total.add(1, &[]);
                hit.cache_hit = true;
                hit.total_latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                Some(hit)
            }
            None => {
                metrics().result_cache_misses_total.add(1, &[]);
                None
            }
        }
    }

    fn fan_out_limit(&self, opts: &PredictOptions) -> Option<usize> { opts.max_concurrency.or(self.max_fan_out).map(|n| n.max(1)) }

    /// One task per requested name. Dropping this future (on timeout) drops
    /// the set, which aborts the tasks and releases any handles they hold.
    async fn fan_out(&self, input: &[f32], names: &[String], opts: &PredictOptions) -> Vec<ModelOutcome> {
        let input: Arc<[f32]> = Arc::from(input);
        let limit = self.fan_out_limit(opts).unwrap_or(names.len()).max(1);
        let permits = Arc::new(Semaphore::new(limit));
        let mut tasks = JoinSet::new();
        for (idx, name) in names.iter().enumerate() {
            let manager = self.manager.clone();
            let pool = self.pool.clone();
            let input = input.clone();
            let permits = permits.clone();
            let name = name.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                (idx, run_model(&manager, &pool, name, input).await)
            });
        }

        let mut slots: Vec<Option<ModelOutcome>> = (0..names.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, outcome)) => slots[idx] = Some(outcome),
                Err(e) => warn!(error = %e, "model task ended abnormally"),
            }
        }
        fill_missing(slots, names)
    }

    async fn finish(&self, models: Vec<ModelOutcome>, policy: AggregationPolicy, started: Instant) -> Result<PredictionResult> {
        let total_latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let agg = combine(&models, policy)?;
        let memory = MemorySnapshot::capture_async(self.manager.ready_count()).await;
        Ok(PredictionResult::new(models, agg, policy, total_latency_ms, memory))
    }

    async fn run_batch(&self, inputs: &[Vec<f32>], names: &[String], opts: &PredictOptions, started: Instant) -> Vec<Result<PredictionResult>> {
        let keys: Vec<Option<ResultKey>> =
            inputs.iter().map(|input| opts.cache_ttl.map(|_| ResultKey::new(names, input, opts.aggregation))).collect();
        let mut items: Vec<Option<Result<PredictionResult>>> =
            keys.iter().map(|k| k.as_ref().and_then(|k| self.cached(k, started)).map(Ok)).collect();
        let pending: Vec<usize> = (0..inputs.len()).filter(|i| items[*i].is_none()).collect();

        if !pending.is_empty() {
            let limit = self.fan_out_limit(opts);
            let acquired = self.acquire_distinct(names, limit).await;
            let round_size = opts.max_batch_size.unwrap_or(self.max_batch_size).max(1);
            let mut outcomes: Vec<(usize, Vec<ModelOutcome>)> = Vec::with_capacity(pending.len());
            for (round, chunk) in pending.chunks(round_size).enumerate() {
                debug!(round, items = chunk.len(), "running batch round");
                outcomes.extend(self.infer_round(inputs, chunk, names, &acquired, limit).await);
            }
            let total_latency_ms = started.elapsed().as_secs_f64() * 1000.0;
            for (_, a) in acquired {
                if let Ok(handle) = a.handle {
                    self.manager.release(handle);
                }
            }

            let memory = MemorySnapshot::capture_async(self.manager.ready_count()).await;
            for (idx, models) in outcomes {
                let item = combine(&models, opts.aggregation)
                    .map(|agg| PredictionResult::new(models, agg, opts.aggregation, total_latency_ms, memory.clone()));
                if let (Some(Some(key)), Some(ttl), Ok(r)) = (keys.get(idx), opts.cache_ttl, &item) {
                    self.cache.insert(key.clone(), r.clone(), ttl);
                }
                items[idx] = Some(item);
            }
        }

        items
            .into_iter()
            .map(|item| item.unwrap_or_else(|| Err(EnsembleError::AllModelsFailed { failures: Vec::new() })))
            .collect()
    }

    /// Acquire each distinct name once, at most `limit` at a time.
    async fn acquire_distinct(&self, names: &[String], limit: Option<usize>) -> HashMap<String, Acquired> {
        let mut distinct: Vec<&String> = Vec::new();
        for name in names {
            if !distinct.contains(&name) {
                distinct.push(name);
            }
        }
        let permits = Arc::new(Semaphore::new(limit.unwrap_or(distinct.len()).max(1)));
        let mut tasks = JoinSet::new();
        for name in distinct {
            let manager = self.manager.clone();
            let permits = permits.clone();
            let name = name.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let started = Instant::now();
                let handle = manager.acquire(&name).await;
                (name, Acquired { handle, latency_ms: started.elapsed().as_secs_f64() * 1000.0 })
            });
        }
        let mut acquired = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, a)) => {
                    acquired.insert(name, a);
                }
                Err(e) => warn!(error = %e, "acquire task ended abnormally"),
            }
        }
        acquired
    }

    /// Submit every (input, model) pair of one round to the pool.
    async fn infer_round(
        &self,
        inputs: &[Vec<f32>],
        round: &[usize],
        names: &[String],
        acquired: &HashMap<String, Acquired>,
        limit: Option<usize>,
    ) -> Vec<(usize, Vec<ModelOutcome>)> {
        let permits = Arc::new(Semaphore::new(limit.unwrap_or(Semaphore::MAX_PERMITS)));
        let mut slots: Vec<Vec<Option<ModelOutcome>>> = round.iter().map(|_| (0..names.len()).map(|_| None).collect()).collect();
        let mut tasks = JoinSet::new();
        for (r, &idx) in round.iter().enumerate() {
            let input: Arc<[f32]> = Arc::from(inputs[idx].as_slice());
            for (m, name) in names.iter().enumerate() {
                match acquired.get(name) {
                    Some(Acquired { handle: Ok(handle), .. }) => {
                        let backend = handle.backend().clone();
                        let weight = handle.descriptor().weight;
                        let pool = self.pool.clone();
                        let permits = permits.clone();
                        let input = input.clone();
                        let name = name.clone();
                        tasks.spawn(async move {
                            let _permit = permits.acquire_owned().await.ok();
                            let started = Instant::now();
                            let result = pool
                                .submit(&name, backend, input)
                                .await
                                .map(|out| (out, weight))
                                .map_err(|e| EnsembleError::Inference { name: name.clone(), reason: e.to_string() });
                            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                            (r, m, settle(name, result, latency_ms))
                        });
                    }
                    Some(Acquired { handle: Err(e), latency_ms }) => {
                        slots[r][m] = Some(settle(name.clone(), Err(e.clone()), *latency_ms));
                    }
                    None => {}
                }
            }
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((r, m, outcome)) => slots[r][m] = Some(outcome),
                Err(e) => warn!(error = %e, "model task ended abnormally"),
            }
        }
        round.iter().zip(slots).map(|(&idx, row)| (idx, fill_missing(row, names))).collect()
    }
}

fn fill_missing(slots: Vec<Option<ModelOutcome>>, names: &[String]) -> Vec<ModelOutcome> {
    slots
        .into_iter()
        .zip(names)
        .map(|(slot, name)| {
            slot.unwrap_or_else(|| {
                let error = EnsembleError::Inference { name: name.clone(), reason: "model task ended abnormally".into() };
                ModelOutcome::failure(name.clone(), error, 0.0)
            })
        })
        .collect()
}

/// Aggregate the successful outcomes, or explain why there is nothing to aggregate.
fn combine(models: &[ModelOutcome], policy: AggregationPolicy) -> Result<Aggregate> {
    let contributions: Vec<Contribution<'_>> = models
        .iter()
        .filter_map(|m| m.output.as_deref().map(|output| Contribution { name: &m.name, output, weight: m.weight }))
        .collect();
    if contributions.is_empty() {
        let failures = models.iter().map(|m| (m.name.clone(), m.error().map(|e| e.to_string()).unwrap_or_default())).collect();
        return Err(EnsembleError::AllModelsFailed { failures });
    }
    aggregate(policy, &contributions)
}

async fn run_model(manager: &ModelManager, pool: &InferencePool, name: String, input: Arc<[f32]>) -> ModelOutcome {
    let started = Instant::now();
    let result = async {
        let handle = manager.acquire(&name).await?;
        let weight = handle.descriptor().weight;
        let output = pool.submit(&name, handle.backend().clone(), input).await;
        manager.release(handle);
        output
            .map(|out| (out, weight))
            .map_err(|e| EnsembleError::Inference { name: name.clone(), reason: e.to_string() })
    }
    .await;
    settle(name, result, started.elapsed().as_secs_f64() * 1000.0)
}

/// Record one model's result and turn it into an outcome.
fn settle(name: String, result: Result<(Vec<f32>, f32)>, latency_ms: f64) -> ModelOutcome {
    let labels = [KeyValue::new("model", name.clone())];
    metrics().model_latency_ms.record(latency_ms, &labels);
    match result {
        Ok((output, weight)) => {
            debug!(model = %name, latency_ms, dim = output.len(), "model inference ok");
            ModelOutcome::success(name, output, weight, latency_ms)
        }
        Err(e) => {
            metrics().model_failures_total.add(1, &labels);
            warn!(model = %name, error = %e, latency_ms, "model failed within ensemble");
            ModelOutcome::failure(name, e, latency_ms)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LinearBackend;
    use crate::manager::{LoadState, ManagerOptions};
    use crate::registry::{BackendKind, ModelDescriptor, ModelRegistry};
    use crate::testing::ScriptedLoader;

    fn engine_with(models: &[(&str, f32)], loader: Arc<ScriptedLoader>, cfg: EnsembleConfig) -> PredictionEngine {
        let registry = Arc::new(ModelRegistry::new());
        for (n, w) in models {
            registry.register(ModelDescriptor::new(*n, BackendKind::Linear, format!("{n}.json")).with_weight(*w)).unwrap();
        }
        let manager = ModelManager::new(registry, loader, ManagerOptions::from(&cfg));
        let pool = Arc::new(InferencePool::new(2, 16));
        PredictionEngine::new(manager, pool, &cfg)
    }

    fn engine(models: &[(&str, f32)], loader: ScriptedLoader, cfg: EnsembleConfig) -> PredictionEngine {
        engine_with(models, Arc::new(loader), cfg)
    }

    fn echo_and_plus_one() -> ScriptedLoader {
        ScriptedLoader::new().model("m1", LinearBackend::identity()).model("m2", LinearBackend::offset(1.0))
    }

    #[tokio::test]
    async fn averages_two_models() {
        let eng = engine(&[("m1", 1.0), ("m2", 1.0)], echo_and_plus_one(), EnsembleConfig::default());
        let res = eng.predict(&[1.0, 2.0, 3.0], &["m1", "m2"], PredictOptions::default()).await.unwrap();
        assert_eq!(res.aggregated, vec![1.5, 2.5, 3.5]);
        assert_eq!(res.output("m1").unwrap(), &[1.0, 2.0, 3.0]);
        assert_eq!(res.output("m2").unwrap(), &[2.0, 3.0, 4.0]);
        assert_eq!(res.succeeded(), 2);
        assert!(res.status("m1").map(|m| !m.failed()).unwrap());
        assert_eq!(res.memory.ready_models, 2);
        assert_eq!(eng.manager().entry_status("m1").unwrap().ref_count, 0);
    }

    #[tokio::test]
    async fn failing_model_is_reported_not_fatal() {
        let loader = ScriptedLoader::new().failing("m1").model("m2", LinearBackend::offset(1.0));
        let eng = engine(&[("m1", 1.0), ("m2", 1.0)], loader, EnsembleConfig::default());
        let res = eng.predict(&[1.0, 2.0, 3.0], &["m1", "m2"], PredictOptions::default()).await.unwrap();
        assert_eq!(res.aggregated, vec![2.0, 3.0, 4.0]);
        let m1 = res.status("m1").unwrap();
        assert!(m1.failed());
        assert!(matches!(m1.error(), Some(EnsembleError::ModelLoad { .. })));
        assert_eq!(res.failed().count(), 1);
    }

    #[tokio::test]
    async fn unknown_name_is_a_per_model_failure() {
        let eng = engine(&[("m1", 1.0)], echo_and_plus_one(), EnsembleConfig::default());
        let res = eng.predict(&[1.0], &["m1", "ghost"], PredictOptions::default()).await.unwrap();
        assert_eq!(res.status("ghost").unwrap().error(), Some(&EnsembleError::UnknownModel("ghost".into())));
        assert_eq!(res.aggregated, vec![1.0]);
    }

    #[tokio::test]
    async fn all_failures_fail_the_call_with_reasons() {
        let loader = ScriptedLoader::new().failing("a").failing("b");
        let eng = engine(&[("a", 1.0), ("b", 1.0)], loader, EnsembleConfig::default());
        let err = eng.predict(&[1.0], &["a", "b"], PredictOptions::default()).await.unwrap_err();
        match err {
            EnsembleError::AllModelsFailed { failures } => {
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].0, "a");
                assert_eq!(failures[1].0, "b");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn empty_request_fails() {
        let eng = engine(&[], ScriptedLoader::new(), EnsembleConfig::default());
        let names: [&str; 0] = [];
        assert!(matches!(
            eng.predict(&[1.0], &names, PredictOptions::default()).await,
            Err(EnsembleError::AllModelsFailed { failures }) if failures.is_empty()
        ));
    }

    #[tokio::test]
    async fn mismatched_dimensions_fail_the_call() {
        let wide = LinearBackend::dense(vec![vec![1.0], vec![1.0]], vec![]).unwrap();
        let loader = ScriptedLoader::new().model("narrow", LinearBackend::identity()).model("wide", wide);
        let eng = engine(&[("narrow", 1.0), ("wide", 1.0)], loader, EnsembleConfig::default());
        let err = eng.predict(&[3.0], &["narrow", "wide"], PredictOptions::default()).await.unwrap_err();
        assert_eq!(err, EnsembleError::DimensionMismatch { dims: vec![("narrow".into(), 1), ("wide".into(), 2)] });
    }

    #[tokio::test]
    async fn duplicates_keep_request_order() {
        let eng = engine(&[("m1", 1.0), ("m2", 1.0)], echo_and_plus_one(), EnsembleConfig::default());
        let res = eng.predict(&[0.0], &["m2", "m1", "m2"], PredictOptions::default()).await.unwrap();
        let order: Vec<&str> = res.models.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(order, vec!["m2", "m1", "m2"]);
        assert!((res.aggregated[0] - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(res.results().len(), 2);
        assert_eq!(eng.manager().load_count("m2"), 1);
    }

    #[tokio::test]
    async fn weighted_mean_uses_descriptor_weight() {
        let eng = engine(&[("m1", 3.0), ("m2", 1.0)], echo_and_plus_one(), EnsembleConfig::default());
        let opts = PredictOptions::default().with_aggregation(AggregationPolicy::WeightedMean);
        let res = eng.predict(&[0.0], &["m1", "m2"], opts).await.unwrap();
        assert_eq!(res.aggregated, vec![0.25]);
    }

    #[tokio::test]
    async fn timeout_fails_whole_call_and_leaves_no_handles() {
        let loader = echo_and_plus_one().delay(Duration::from_millis(200));
        let eng = engine(&[("m1", 1.0), ("m2", 1.0)], loader, EnsembleConfig::default());
        let opts = PredictOptions::default().with_timeout(Duration::from_millis(20));
        let err = eng.predict(&[1.0], &["m1", "m2"], opts).await.unwrap_err();
        assert_eq!(err, EnsembleError::Timeout { budget_ms: 20 });
        tokio::time::sleep(Duration::from_millis(300)).await;
        for name in ["m1", "m2"] {
            let status = eng.manager().entry_status(name).unwrap();
            assert_eq!(status.state, LoadState::Ready);
            assert_eq!(status.ref_count, 0);
        }
    }

    #[tokio::test]
    async fn fan_out_bound_of_one_still_completes() {
        let eng = engine(&[("m1", 1.0), ("m2", 1.0)], echo_and_plus_one(), EnsembleConfig::default());
        let opts = PredictOptions::default().with_max_concurrency(1);
        let res = eng.predict(&[1.0], &["m1", "m2", "m1"], opts).await.unwrap();
        assert_eq!(res.succeeded(), 3);
    }

    #[tokio::test]
    async fn fan_out_bound_caps_parallel_loads() {
        let names = ["a", "b", "c", "d"];
        let script = || names.iter().fold(ScriptedLoader::new(), |l, n| l.model(n, LinearBackend::identity())).delay(Duration::from_millis(40));
        let models: Vec<(&str, f32)> = names.iter().map(|n| (*n, 1.0)).collect();
        let cfg = EnsembleConfig { max_concurrent_loads: 8, ..Default::default() };

        let bounded = Arc::new(script());
        let eng = engine_with(&models, bounded.clone(), cfg.clone());
        let res = eng.predict(&[1.0], &names, PredictOptions::default().with_max_concurrency(2)).await.unwrap();
        assert_eq!(res.succeeded(), 4);
        assert!(bounded.peak_in_flight() <= 2, "peak {}", bounded.peak_in_flight());

        let open = Arc::new(script());
        let eng = engine_with(&models, open.clone(), cfg);
        eng.predict(&[1.0], &names, PredictOptions::default()).await.unwrap();
        assert!(open.peak_in_flight() >= 3, "peak {}", open.peak_in_flight());
    }

    #[tokio::test]
    async fn cached_result_is_served_without_the_models() {
        let eng = engine(&[("m1", 1.0), ("m2", 1.0)], echo_and_plus_one(), EnsembleConfig::default());
        let opts = PredictOptions::default().with_cache_ttl(Duration::from_secs(60));
        let first = eng.predict(&[1.0], &["m1", "m2"], opts.clone()).await.unwrap();
        assert!(!first.cache_hit);
        assert_eq!(eng.result_cache().len(), 1);

        eng.manager().shutdown();
        let again = eng.predict(&[1.0], &["m1", "m2"], opts.clone()).await.unwrap();
        assert!(again.cache_hit);
        assert_eq!(again.aggregated, first.aggregated);
        assert_eq!(again.models, first.models);

        // a different order is a different request
        assert!(eng.predict(&[1.0], &["m2", "m1"], opts).await.is_err());
    }

    #[tokio::test]
    async fn no_ttl_bypasses_the_cache() {
        let eng = engine(&[("m1", 1.0)], echo_and_plus_one(), EnsembleConfig::default());
        let res = eng.predict(&[1.0], &["m1"], PredictOptions::default()).await.unwrap();
        assert!(!res.cache_hit);
        assert!(eng.result_cache().is_empty());
    }

    #[tokio::test]
    async fn expired_result_reruns_the_models() {
        let eng = engine(&[("m1", 1.0)], echo_and_plus_one(), EnsembleConfig::default());
        let opts = PredictOptions::default().with_cache_ttl(Duration::from_millis(20));
        eng.predict(&[1.0], &["m1"], opts.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        eng.manager().shutdown();
        let err = eng.predict(&[1.0], &["m1"], opts).await.unwrap_err();
        assert!(matches!(err, EnsembleError::AllModelsFailed { .. }), "{err}");
    }

    #[tokio::test]
    async fn failed_call_is_not_cached() {
        let loader = ScriptedLoader::new().flaky("m1", 1, LinearBackend::identity());
        let cfg = EnsembleConfig { load_retries: 0, ..Default::default() };
        let eng = engine(&[("m1", 1.0)], loader, cfg);
        let opts = PredictOptions::default().with_cache_ttl(Duration::from_secs(60));
        assert!(eng.predict(&[2.0], &["m1"], opts.clone()).await.is_err());
        assert!(eng.result_cache().is_empty());
        let res = eng.predict(&[2.0], &["m1"], opts).await.unwrap();
        assert!(!res.cache_hit);
        assert_eq!(res.aggregated, vec![2.0]);
    }

    #[tokio::test]
    async fn batch_acquires_each_model_once() {
        let loader = Arc::new(echo_and_plus_one());
        let eng = engine_with(&[("m1", 1.0), ("m2", 1.0)], loader.clone(), EnsembleConfig::default());
        let inputs: Vec<Vec<f32>> = (0..7).map(|i| vec![i as f32]).collect();
        let opts = PredictOptions::default().with_max_batch_size(3);
        let items = eng.predict_batch(&inputs, &["m1", "m2", "m1"], opts).await.unwrap();

        assert_eq!(items.len(), 7);
        for (i, item) in items.iter().enumerate() {
            let res = item.as_ref().unwrap();
            assert_eq!(res.models.len(), 3);
            assert_eq!(res.output("m1").unwrap(), &[i as f32]);
            assert_eq!(res.output("m2").unwrap(), &[i as f32 + 1.0]);
        }
        for name in ["m1", "m2"] {
            assert_eq!(loader.attempts(name), 1);
            assert_eq!(eng.manager().entry_status(name).unwrap().ref_count, 0);
        }
    }

    #[tokio::test]
    async fn batch_items_fail_independently() {
        let pair = LinearBackend::dense(vec![vec![1.0, 1.0]], vec![]).unwrap();
        let half = LinearBackend::dense(vec![vec![0.5, 0.5]], vec![]).unwrap();
        let loader = ScriptedLoader::new().model("pair", pair).model("half", half);
        let eng = engine(&[("pair", 1.0), ("half", 1.0)], loader, EnsembleConfig::default());
        let inputs = vec![vec![1.0, 1.0], vec![1.0]];
        let opts = PredictOptions::default().with_max_batch_size(1);
        let items = eng.predict_batch(&inputs, &["pair", "half", "ghost"], opts).await.unwrap();

        let ok = items[0].as_ref().unwrap();
        assert_eq!(ok.aggregated, vec![1.5]);
        assert_eq!(ok.status("ghost").unwrap().error(), Some(&EnsembleError::UnknownModel("ghost".into())));
        match &items[1] {
            Err(EnsembleError::AllModelsFailed { failures }) => {
                let names: Vec<&str> = failures.iter().map(|(n, _)| n.as_str()).collect();
                assert_eq!(names, vec!["pair", "half", "ghost"]);
            }
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[tokio::test]
    async fn batch_serves_cached_items_and_stores_new_ones() {
        let loader = Arc::new(echo_and_plus_one());
        let eng = engine_with(&[("m1", 1.0)], loader.clone(), EnsembleConfig::default());
        let opts = PredictOptions::default().with_cache_ttl(Duration::from_secs(60));
        eng.predict(&[1.0], &["m1"], opts.clone()).await.unwrap();

        let inputs = vec![vec![1.0], vec![2.0]];
        let items = eng.predict_batch(&inputs, &["m1"], opts.clone()).await.unwrap();
        assert!(items[0].as_ref().unwrap().cache_hit);
        assert!(!items[1].as_ref().unwrap().cache_hit);
        assert_eq!(eng.result_cache().len(), 2);

        let items = eng.predict_batch(&inputs, &["m1"], opts).await.unwrap();
        assert!(items.iter().all(|i| i.as_ref().unwrap().cache_hit));
        assert_eq!(loader.attempts("m1"), 1);
    }

    #[tokio::test]
    async fn batch_timeout_covers_the_whole_batch() {
        let loader = echo_and_plus_one().delay(Duration::from_millis(200));
        let eng = engine(&[("m1", 1.0)], loader, EnsembleConfig::default());
        let opts = PredictOptions::default().with_timeout(Duration::from_millis(20));
        let err = eng.predict_batch(&[vec![1.0], vec![2.0]], &["m1"], opts).await.unwrap_err();
        assert_eq!(err, EnsembleError::Timeout { budget_ms: 20 });
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(eng.manager().entry_status("m1").unwrap().ref_count, 0);
    }

    #[tokio::test]
    async fn empty_batch_is_empty() {
        let loader = Arc::new(echo_and_plus_one());
        let eng = engine_with(&[("m1", 1.0)], loader.clone(), EnsembleConfig::default());
        let items = eng.predict_batch(&[], &["m1"], PredictOptions::default()).await.unwrap();
        assert!(items.is_empty());
        assert_eq!(loader.attempts("m1"), 0);
    }

    #[test]
    fn outcome_serializes_error_text() {
        let outcome = ModelOutcome::failure("x".into(), EnsembleError::UnknownModel("x".into()), 1.5);
        let v = serde_json::to_value(&outcome).unwrap();
        assert_eq!(v["status"], "failed");
        assert_eq!(v["error"], "unknown model 'x'");
        assert_eq!(v["name"], "x");
    }
}
