//! Resilience utilities: retry with exponential backoff for model loading.
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use once_cell::sync::Lazy;
use opentelemetry::{global, metrics::Counter};
use tracing::{debug, warn};

static RETRY_ATTEMPTS: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter("ensemble-resilience")
        .u64_counter("ensemble_resilience_retry_attempts_total")
        .with_description("Total retry attempts executed after a failure")
        .init()
});

static RETRY_EXHAUSTED: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter("ensemble-resilience")
        .u64_counter("ensemble_resilience_retry_exhausted_total")
        .with_description("Operations that failed on every attempt")
        .init()
});

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra attempts after the first one. Zero means a single try.
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self { Self { max_retries: 0, base_delay: Duration::from_millis(100), max_delay: Duration::from_secs(5) } }
}

impl RetryPolicy {
    pub fn new(max_retries: usize, base_delay: Duration) -> Self { Self { max_retries, base_delay, ..Default::default() } }

    /// Backoff before attempt `attempt + 1`, doubling per attempt and capped at `max_delay`.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let factor = 2f64.powi(attempt.min(30) as i32);
        std::cmp::min(self.base_delay.mul_f64(factor), self.max_delay)
    }
}

/// Run `op` until it succeeds or the policy's attempts are used up.
/// `op` receives the zero-based attempt index. The last error is returned on exhaustion.
pub async fn retry_async<F, Fut, T, E>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => {
                if attempt > 0 { debug!(target: "ensemble_resilience", %label, attempt, "succeeded after retry"); }
                return Ok(v);
            }
            Err(e) if attempt >= policy.max_retries => {
                if policy.max_retries > 0 { RETRY_EXHAUSTED.add(1, &[]); }
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                warn!(target: "ensemble_resilience", %label, attempt, error = %e, delay_ms = delay.as_millis() as u64, "attempt failed, retrying");
                RETRY_ATTEMPTS.add(1, &[]);
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}
