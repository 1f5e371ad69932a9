//! Scripted backend loader for unit tests: counts attempts per model and
//! injects failures and delays.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::backend::{Backend, BackendError, BackendLoader, LinearBackend};
use crate::registry::ModelDescriptor;

enum Script {
    Ready(LinearBackend),
    Fail,
    /// Fail the first `n` attempts, then succeed.
    Flaky(usize, LinearBackend),
}

#[derive(Default)]
pub(crate) struct ScriptedLoader {
    scripts: HashMap<String, Script>,
    attempts: Mutex<HashMap<String, usize>>,
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Counts one load as in flight until dropped, including when the load is aborted.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(loader: &'a ScriptedLoader) -> Self {
        let now = loader.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        loader.peak.fetch_max(now, Ordering::SeqCst);
        Self(&loader.in_flight)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) { self.0.fetch_sub(1, Ordering::SeqCst); }
}

impl ScriptedLoader {
    pub(crate) fn new() -> Self { Self::default() }

    pub(crate) fn model(mut self, name: &str, backend: LinearBackend) -> Self {
        self.scripts.insert(name.to_string(), Script::Ready(backend));
        self
    }

    pub(crate) fn failing(mut self, name: &str) -> Self {
        self.scripts.insert(name.to_string(), Script::Fail);
        self
    }

    pub(crate) fn flaky(mut self, name: &str, failures: usize, backend: LinearBackend) -> Self {
        self.scripts.insert(name.to_string(), Script::Flaky(failures, backend));
        self
    }

    pub(crate) fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn attempts(&self, name: &str) -> usize { self.attempts.lock().get(name).copied().unwrap_or(0) }

    /// Most loads observed running at the same time.
    pub(crate) fn peak_in_flight(&self) -> usize { self.peak.load(Ordering::SeqCst) }
}

#[async_trait]
impl BackendLoader for ScriptedLoader {
    async fn load(&self, descriptor: &ModelDescriptor) -> Result<Backend, BackendError> {
        let _gauge = InFlight::enter(self);
        let attempt = {
            let mut attempts = self.attempts.lock();
            let n = attempts.entry(descriptor.name.clone()).or_insert(0);
            *n += 1;
            *n
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.scripts.get(&descriptor.name) {
            Some(Script::Ready(b)) => Ok(Backend::Linear(b.clone())),
            Some(Script::Flaky(failures, b)) if attempt > *failures => Ok(Backend::Linear(b.clone())),
            Some(Script::Flaky(..)) | Some(Script::Fail) => Err(BackendError::Format(format!("scripted failure (attempt {attempt})"))),
            None => Err(BackendError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, descriptor.artifact.clone()))),
        }
    }
}
