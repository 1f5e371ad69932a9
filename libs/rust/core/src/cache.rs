//! Short-lived cache of successful prediction results.
//!
//! Keyed on the requested names (in order), the exact input bits and the
//! aggregation policy. Each entry carries its own TTL; a bounded map drops
//! expired entries first and then the least recently read one.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::aggregate::AggregationPolicy;
use crate::engine::PredictionResult;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResultKey {
    models: Vec<String>,
    input: Vec<u32>,
    aggregation: AggregationPolicy,
}

impl ResultKey {
    pub fn new(models: &[String], input: &[f32], aggregation: AggregationPolicy) -> Self {
        Self { models: models.to_vec(), input: input.iter().map(|v| v.to_bits()).collect(), aggregation }
    }
}

struct CachedResult {
    result: PredictionResult,
    expires_at: Instant,
    last_read: Instant,
}

pub struct ResultCache {
    entries: Mutex<HashMap<ResultKey, CachedResult>>,
    capacity: usize,
}

impl ResultCache {
    /// A capacity of zero disables caching.
    pub fn new(capacity: usize) -> Self { Self { entries: Mutex::new(HashMap::new()), capacity } }

    pub fn capacity(&self) -> usize { self.capacity }
    pub fn len(&self) -> usize { self.entries.lock().len() }
    pub fn is_empty(&self) -> bool { self.entries.lock().is_empty() }

    /// Live entry for `key`. An expired entry is dropped on the way.
    pub fn get(&self, key: &ResultKey) -> Option<PredictionResult> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.last_read = now;
                Some(entry.result.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: ResultKey, result: PredictionResult, ttl: Duration) {
        if self.capacity == 0 || ttl.is_zero() {
            return;
        }
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            entries.retain(|_, e| e.expires_at > now);
            if entries.len() >= self.capacity {
                let oldest = entries.iter().min_by_key(|(_, e)| e.last_read).map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(key, CachedResult { result, expires_at: now + ttl, last_read: now });
    }

    /// Drop every expired entry and return how many went.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub fn clear(&self) { self.entries.lock().clear(); }

    /// Purge expired entries every `every` until the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(cache) = cache.upgrade() else { break };
                let purged = cache.purge_expired();
                if purged > 0 {
                    info!(purged, remaining = cache.len(), "expired prediction results purged");
                }
            }
            debug!("result cache sweeper exiting");
        })
    }
}
