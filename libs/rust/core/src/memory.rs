//! Process and system memory snapshot taken at the end of each prediction.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::System;

// Shared by every capture; refreshes reuse its buffers.
static SYSTEM: Lazy<Mutex<System>> = Lazy::new(|| Mutex::new(System::new()));

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemorySnapshot {
    /// Resident set size of this process in bytes (0 when unavailable).
    pub process_rss_bytes: u64,
    pub process_virtual_bytes: u64,
    pub system_used_bytes: u64,
    pub system_total_bytes: u64,
    /// Models in the Ready state when the snapshot was taken.
    pub ready_models: usize,
}

impl MemorySnapshot {
    /// Reads `/proc` (or the platform equivalent); blocking.
    pub fn capture(ready_models: usize) -> Self {
        let mut sys = SYSTEM.lock();
        sys.refresh_memory();
        let mut snap = Self {
            system_used_bytes: sys.used_memory(),
            system_total_bytes: sys.total_memory(),
            ready_models,
            ..Default::default()
        };
        if let Ok(pid) = sysinfo::get_current_pid() {
            if sys.refresh_process(pid) {
                if let Some(p) = sys.process(pid) {
                    snap.process_rss_bytes = p.memory();
                    snap.process_virtual_bytes = p.virtual_memory();
                }
            }
        }
        snap
    }

    /// `capture` on the blocking pool.
    pub async fn capture_async(ready_models: usize) -> Self {
        tokio::task::spawn_blocking(move || Self::capture(ready_models))
            .await
            .unwrap_or_else(|_| Self { ready_models, ..Default::default() })
    }

    pub fn process_rss_mb(&self) -> f64 { self.process_rss_bytes as f64 / (1024.0 * 1024.0) }
}
