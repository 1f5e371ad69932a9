//! Model manager: lazy loading, caching and eviction of backend instances.
//!
//! Each registered name owns a slot with its own lock; the slot moves through
//! `Unloaded -> Loading -> Ready` and back to `Unloaded` on eviction or load
//! failure. Loads run on a detached task and publish their outcome on a
//! `watch` channel, so every caller that arrives while a load is in flight
//! attaches to it, and a caller giving up never strands the slot in `Loading`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ensemble_resilience::{retry_async, RetryPolicy};
use opentelemetry::KeyValue;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, instrument, warn};

use crate::backend::{Backend, BackendLoader};
use crate::config::EnsembleConfig;
use crate::error::{EnsembleError, Result};
use crate::registry::{ModelDescriptor, ModelRegistry};
use crate::telemetry::metrics;

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Soft cap on Ready entries. Exceeded only when every Ready entry is in use.
    pub capacity: usize,
    pub max_concurrent_loads: usize,
    pub load_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ManagerOptions {
    fn default() -> Self { Self::from(&EnsembleConfig::default()) }
}

impl From<&EnsembleConfig> for ManagerOptions {
    fn from(cfg: &EnsembleConfig) -> Self {
        Self {
            capacity: cfg.cache_capacity,
            max_concurrent_loads: cfg.max_concurrent_loads,
            load_timeout: cfg.load_timeout(),
            retry: RetryPolicy::new(cfg.load_retries, cfg.load_retry_delay()),
        }
    }
}

/// A backend instance resident in the cache.
pub struct LoadedModel {
    descriptor: Arc<ModelDescriptor>,
    backend: Arc<Backend>,
    loaded_at: Instant,
    last_used: Mutex<Instant>,
    ref_count: AtomicUsize,
}

impl LoadedModel {
    fn new(descriptor: Arc<ModelDescriptor>, backend: Backend) -> Self {
        let now = Instant::now();
        Self { descriptor, backend: Arc::new(backend), loaded_at: now, last_used: Mutex::new(now), ref_count: AtomicUsize::new(0) }
    }

    fn touch(&self) { *self.last_used.lock() = Instant::now(); }

    pub fn ref_count(&self) -> usize { self.ref_count.load(Ordering::SeqCst) }
}

/// Reference to a Ready model. Releasing (explicitly or on drop) decrements
/// the model's reference count exactly once.
pub struct ModelHandle {
    model: Arc<LoadedModel>,
    released: bool,
}

impl ModelHandle {
    fn new(model: Arc<LoadedModel>) -> Self {
        model.ref_count.fetch_add(1, Ordering::SeqCst);
        model.touch();
        Self { model, released: false }
    }

    pub fn name(&self) -> &str { &self.model.descriptor.name }
    pub fn descriptor(&self) -> &Arc<ModelDescriptor> { &self.model.descriptor }
    pub fn backend(&self) -> &Arc<Backend> { &self.model.backend }
    pub fn ref_count(&self) -> usize { self.model.ref_count() }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.model.touch();
            self.model.ref_count.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for ModelHandle {
    fn drop(&mut self) { self.release_once(); }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle").field("name", &self.name()).field("ref_count", &self.ref_count()).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadState {
    Unloaded,
    Loading,
    Ready,
}

/// Point-in-time view of one cache slot.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryStatus {
    pub name: String,
    pub state: LoadState,
    pub ref_count: usize,
    /// Callers attached to this slot that do not hold a handle yet.
    pub waiters: usize,
    pub loads: u64,
    pub last_error: Option<String>,
    pub loaded_for_ms: Option<u64>,
    pub idle_for_ms: Option<u64>,
}

type LoadOutcome = std::result::Result<(), EnsembleError>;

enum SlotState {
    Unloaded,
    Loading(watch::Receiver<Option<LoadOutcome>>),
    Ready(Arc<LoadedModel>),
}

struct SlotInner {
    state: SlotState,
    last_error: Option<String>,
}

struct Slot {
    name: String,
    inner: Mutex<SlotInner>,
    loads: AtomicU64,
    waiters: AtomicUsize,
}

/// Marks a caller as waiting on a slot from the moment it attaches until its
/// `acquire` returns. A slot with waiters is never evicted.
struct WaitTicket(Arc<Slot>);

impl WaitTicket {
    fn new(slot: &Arc<Slot>) -> Self {
        slot.waiters.fetch_add(1, Ordering::SeqCst);
        Self(slot.clone())
    }
}

impl Drop for WaitTicket {
    fn drop(&mut self) { self.0.waiters.fetch_sub(1, Ordering::SeqCst); }
}

impl Slot {
    fn new(name: &str) -> Self {
        Self { name: name.to_string(), inner: Mutex::new(SlotInner { state: SlotState::Unloaded, last_error: None }), loads: AtomicU64::new(0), waiters: AtomicUsize::new(0) }
    }

    fn is_ready(&self) -> bool { matches!(self.inner.lock().state, SlotState::Ready(_)) }

    fn unclaimed(&self, model: &LoadedModel) -> bool { model.ref_count() == 0 && self.waiters.load(Ordering::SeqCst) == 0 }

    /// Last use of a Ready model nobody holds or waits for.
    fn idle_since(&self) -> Option<Instant> {
        match &self.inner.lock().state {
            SlotState::Ready(m) if self.unclaimed(m) => Some(*m.last_used.lock()),
            _ => None,
        }
    }

    fn evict_if_idle(&self) -> bool {
        let mut inner = self.inner.lock();
        let idle = matches!(&inner.state, SlotState::Ready(m) if self.unclaimed(m));
        if idle {
            inner.state = SlotState::Unloaded;
        }
        idle
    }

    fn status(&self) -> CacheEntryStatus {
        let inner = self.inner.lock();
        let (state, ref_count, loaded_for_ms, idle_for_ms) = match &inner.state {
            SlotState::Unloaded => (LoadState::Unloaded, 0, None, None),
            SlotState::Loading(_) => (LoadState::Loading, 0, None, None),
            SlotState::Ready(m) => {
                let refs = m.ref_count();
                let idle = (refs == 0).then(|| m.last_used.lock().elapsed().as_millis() as u64);
                (LoadState::Ready, refs, Some(m.loaded_at.elapsed().as_millis() as u64), idle)
            }
        };
        CacheEntryStatus {
            name: self.name.clone(),
            state,
            ref_count,
            waiters: self.waiters.load(Ordering::SeqCst),
            loads: self.loads.load(Ordering::SeqCst),
            last_error: inner.last_error.clone(),
            loaded_for_ms,
            idle_for_ms,
        }
    }
}

struct Inner {
    registry: Arc<ModelRegistry>,
    loader: Arc<dyn BackendLoader>,
    slots: RwLock<HashMap<String, Arc<Slot>>>,
    load_permits: Semaphore,
    opts: ManagerOptions,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct ModelManager {
    inner: Arc<Inner>,
}

impl ModelManager {
    pub fn new(registry: Arc<ModelRegistry>, loader: Arc<dyn BackendLoader>, opts: ManagerOptions) -> Self {
        let permits = opts.max_concurrent_loads.max(1);
        Self {
            inner: Arc::new(Inner {
                registry,
                loader,
                slots: RwLock::new(HashMap::new()),
                load_permits: Semaphore::new(permits),
                opts,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> { &self.inner.registry }
    pub fn capacity(&self) -> usize { self.inner.opts.capacity }

    /// Get a Ready handle for `name`, loading it first if needed. Concurrent
    /// callers for the same unloaded name share one load.
    #[instrument(skip(self), fields(model = %name))]
    pub async fn acquire(&self, name: &str) -> Result<ModelHandle> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(EnsembleError::ShuttingDown);
        }
        let descriptor = self.inner.registry.get_descriptor(name)?;
        let slot = self.inner.slot(name);
        // Taken under the slot lock and held until the handle exists.
        let mut ticket: Option<WaitTicket> = None;
        loop {
            let mut rx = {
                let mut inner = slot.inner.lock();
                let attached = match &inner.state {
                    SlotState::Ready(model) => return Ok(ModelHandle::new(model.clone())),
                    SlotState::Loading(rx) => Some(rx.clone()),
                    SlotState::Unloaded => None,
                };
                if ticket.is_none() {
                    ticket = Some(WaitTicket::new(&slot));
                }
                match attached {
                    Some(rx) => rx,
                    None => {
                        if self.inner.closed.load(Ordering::SeqCst) {
                            return Err(EnsembleError::ShuttingDown);
                        }
                        let (tx, rx) = watch::channel(None);
                        inner.state = SlotState::Loading(rx.clone());
                        Inner::spawn_load(self.inner.clone(), slot.clone(), descriptor.clone(), tx);
                        rx
                    }
                }
            };
            let outcome = rx.wait_for(|o| o.is_some()).await.map(|o| o.clone());
            match outcome {
                // Ready now, unless evicted in between; re-check under the lock.
                Ok(Some(Ok(()))) | Ok(None) => continue,
                Ok(Some(Err(e))) => return Err(e),
                Err(_) => {
                    return Err(EnsembleError::ModelLoad { name: name.to_string(), reason: "load task ended without a result".into() })
                }
            }
        }
    }

    /// Give a handle back. The model stays cached until capacity pressure evicts it.
    pub fn release(&self, mut handle: ModelHandle) {
        handle.release_once();
        debug!(model = %handle.name(), ref_count = handle.ref_count(), "model released");
    }

    /// Load the given models and release them immediately. Returns the failures.
    pub async fn preload<I, S>(&self, names: I) -> Vec<EnsembleError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut failures = Vec::new();
        for name in names {
            match self.acquire(name.as_ref()).await {
                Ok(handle) => self.release(handle),
                Err(e) => {
                    warn!(model = %name.as_ref(), error = %e, "preload failed");
                    failures.push(e);
                }
            }
        }
        failures
    }

    /// Evict idle models until the Ready count is within capacity.
    pub fn shrink_to_capacity(&self) -> usize { self.inner.evict_over_capacity(None) }

    pub fn ready_count(&self) -> usize { self.inner.ready_count() }

    /// Number of loads started for `name` over the manager's lifetime.
    pub fn load_count(&self, name: &str) -> u64 {
        self.inner.slots.read().get(name).map(|s| s.loads.load(Ordering::SeqCst)).unwrap_or(0)
    }

    pub fn status(&self) -> Vec<CacheEntryStatus> {
        let mut out: Vec<CacheEntryStatus> = self.inner.slots.read().values().map(|s| s.status()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn entry_status(&self, name: &str) -> Option<CacheEntryStatus> {
        self.inner.slots.read().get(name).map(|s| s.status())
    }

    /// Stop handing out models and unload every idle entry. Returns how many
    /// models stayed resident because they are still referenced.
    pub fn shutdown(&self) -> usize {
        self.inner.closed.store(true, Ordering::SeqCst);
        let slots: Vec<Arc<Slot>> = self.inner.slots.read().values().cloned().collect();
        let mut unloaded = 0;
        let mut pinned = 0;
        for slot in slots {
            if slot.evict_if_idle() {
                unloaded += 1;
            } else if slot.is_ready() {
                pinned += 1;
            }
        }
        info!(unloaded, pinned, "model manager shut down");
        pinned
    }

    pub fn is_shut_down(&self) -> bool { self.inner.closed.load(Ordering::SeqCst) }
}

impl Inner {
    fn slot(&self, name: &str) -> Arc<Slot> {
        if let Some(slot) = self.slots.read().get(name) {
            return slot.clone();
        }
        self.slots.write().entry(name.to_string()).or_insert_with(|| Arc::new(Slot::new(name))).clone()
    }

    fn ready_count(&self) -> usize { self.slots.read().values().filter(|s| s.is_ready()).count() }

    fn spawn_load(this: Arc<Self>, slot: Arc<Slot>, descriptor: Arc<ModelDescriptor>, tx: watch::Sender<Option<LoadOutcome>>) {
        tokio::spawn(async move {
            let outcome = this.run_load(&slot, descriptor).await;
            let _ = tx.send(Some(outcome));
        });
    }

    async fn run_load(&self, slot: &Slot, descriptor: Arc<ModelDescriptor>) -> LoadOutcome {
        let name = slot.name.as_str();
        let started = Instant::now();
        slot.loads.fetch_add(1, Ordering::SeqCst);
        metrics().loads_total.add(1, &[KeyValue::new("model", name.to_string())]);

        let result = match self.load_backend(descriptor.clone()).await {
            Ok(_) if self.closed.load(Ordering::SeqCst) => Err(EnsembleError::ShuttingDown),
            other => other,
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        match result {
            Ok(backend) => {
                {
                    let mut inner = slot.inner.lock();
                    inner.state = SlotState::Ready(Arc::new(LoadedModel::new(descriptor, backend)));
                    inner.last_error = None;
                }
                metrics().load_latency_ms.record(elapsed_ms, &[KeyValue::new("model", name.to_string())]);
                info!(model = %name, latency_ms = elapsed_ms, "model loaded");
                self.evict_over_capacity(Some(name));
                Ok(())
            }
            Err(e) => {
                {
                    let mut inner = slot.inner.lock();
                    inner.state = SlotState::Unloaded;
                    inner.last_error = Some(e.to_string());
                }
                metrics().load_failures_total.add(1, &[KeyValue::new("model", name.to_string())]);
                warn!(model = %name, error = %e, latency_ms = elapsed_ms, "model load failed");
                Err(e)
            }
        }
    }

    async fn load_backend(&self, descriptor: Arc<ModelDescriptor>) -> Result<Backend> {
        let _permit = self.load_permits.acquire().await.map_err(|_| EnsembleError::ShuttingDown)?;
        let name = descriptor.name.clone();
        let timeout = self.opts.load_timeout;
        retry_async(&self.opts.retry, &name, |_attempt| {
            let loader = self.loader.clone();
            let descriptor = descriptor.clone();
            let name = name.clone();
            async move {
                let mut task = tokio::spawn(async move { loader.load(&descriptor).await });
                let reason = match tokio::time::timeout(timeout, &mut task).await {
                    Ok(Ok(Ok(backend))) => return Ok(backend),
                    Ok(Ok(Err(e))) => e.to_string(),
                    Ok(Err(join)) => format!("loader panicked: {join}"),
                    Err(_) => {
                        task.abort();
                        format!("timed out after {}ms", timeout.as_millis())
                    }
                };
                Err(EnsembleError::ModelLoad { name, reason })
            }
        })
        .await
    }

    /// Evict least-recently-used idle models while Ready entries exceed capacity.
    /// `keep` protects a model that was just loaded for a waiting caller.
    fn evict_over_capacity(&self, keep: Option<&str>) -> usize {
        let mut evicted = 0;
        loop {
            let slots: Vec<Arc<Slot>> = self.slots.read().values().cloned().collect();
            let ready = slots.iter().filter(|s| s.is_ready()).count();
            if ready <= self.opts.capacity {
                break;
            }
            let candidate = slots
                .iter()
                .filter(|s| Some(s.name.as_str()) != keep)
                .filter_map(|s| s.idle_since().map(|t| (t, s)))
                .min_by_key(|(t, _)| *t);
            let Some((_, slot)) = candidate else {
                debug!(ready, capacity = self.opts.capacity, "cache over capacity, every model in use");
                break;
            };
            if slot.evict_if_idle() {
                evicted += 1;
                metrics().evictions_total.add(1, &[KeyValue::new("model", slot.name.clone())]);
                info!(model = %slot.name, ready = ready - 1, capacity = self.opts.capacity, "model evicted");
            }
        }
        evicted
    }
}
