//! Tracing initialisation and the ensemble metrics group.

use once_cell::sync::{Lazy, OnceCell};
use opentelemetry::metrics::{Counter, Histogram, Meter, Unit};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::{EnsembleError, Result};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Install the global subscriber. `RUST_LOG` drives filtering; `ENSEMBLE_JSON_LOG=1`
/// switches to JSON lines. Safe to call more than once.
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| {
        let json = std::env::var("ENSEMBLE_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(env_filter);
        let res = if json {
            registry
                .with(tracing_subscriber::fmt::layer().json().flatten_event(true).with_current_span(true).with_span_list(false))
                .try_init()
        } else {
            registry
                .with(tracing_subscriber::fmt::layer().with_target(true).with_thread_ids(false).with_line_number(true))
                .try_init()
        };
        res.map_err(|e| EnsembleError::Config(format!("tracing init failed: {e}")))
    })?;
    info!(target: "ensemble", %service, "tracing initialized");
    Ok(())
}

pub struct EnsembleMetrics {
    pub predictions_total: Counter<u64>,
    pub prediction_failures_total: Counter<u64>,
    pub model_failures_total: Counter<u64>,
    pub loads_total: Counter<u64>,
    pub load_failures_total: Counter<u64>,
    pub evictions_total: Counter<u64>,
    pub batch_predictions_total: Counter<u64>,
    pub result_cache_hits_total: Counter<u64>,
    pub result_cache_misses_total: Counter<u64>,
    pub predict_latency_ms: Histogram<f64>,
    pub model_latency_ms: Histogram<f64>,
    pub load_latency_ms: Histogram<f64>,
}

static ENSEMBLE_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("ensemble"));

pub static ENSEMBLE_METRICS: Lazy<EnsembleMetrics> = Lazy::new(|| EnsembleMetrics {
    predictions_total: ENSEMBLE_METER.u64_counter("ensemble_predictions_total").with_description("Predict calls started").init(),
    prediction_failures_total: ENSEMBLE_METER.u64_counter("ensemble_prediction_failures_total").with_description("Predict calls that failed as a whole").init(),
    model_failures_total: ENSEMBLE_METER.u64_counter("ensemble_model_failures_total").with_description("Per-model failures inside predict calls").init(),
    loads_total: ENSEMBLE_METER.u64_counter("ensemble_model_loads_total").with_description("Backend loads started").init(),
    load_failures_total: ENSEMBLE_METER.u64_counter("ensemble_model_load_failures_total").with_description("Backend loads that failed").init(),
    evictions_total: ENSEMBLE_METER.u64_counter("ensemble_model_evictions_total").with_description("Idle models evicted from the cache").init(),
    batch_predictions_total: ENSEMBLE_METER.u64_counter("ensemble_batch_predictions_total").with_description("Batch predict calls started").init(),
    result_cache_hits_total: ENSEMBLE_METER.u64_counter("ensemble_result_cache_hits_total").with_description("Predictions served from the result cache").init(),
    result_cache_misses_total: ENSEMBLE_METER.u64_counter("ensemble_result_cache_misses_total").with_description("Cacheable predictions that had to run").init(),
    predict_latency_ms: ENSEMBLE_METER.f64_histogram("ensemble_predict_latency_ms").with_description("Wall-clock latency of predict calls (ms)").with_unit(Unit::new("ms")).init(),
    model_latency_ms: ENSEMBLE_METER.f64_histogram("ensemble_model_latency_ms").with_description("Acquire + inference latency per model (ms)").with_unit(Unit::new("ms")).init(),
    load_latency_ms: ENSEMBLE_METER.f64_histogram("ensemble_model_load_latency_ms").with_description("Backend load latency (ms)").with_unit(Unit::new("ms")).init(),
});

pub fn metrics() -> &'static EnsembleMetrics { &ENSEMBLE_METRICS }
