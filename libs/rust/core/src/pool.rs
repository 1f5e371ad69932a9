//! Bounded inference worker pool.
//!
//! Jobs go through a bounded queue to a fixed set of workers; each job runs
//! `Backend::infer` on the blocking pool and answers on a oneshot channel.
//! Dropping the reply future cancels the job if no worker has picked it up yet.
//! Must be constructed inside a tokio runtime.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::backend::{Backend, BackendError};

struct InferenceJob {
    model: String,
    backend: Arc<Backend>,
    input: Arc<[f32]>,
    resp: oneshot::Sender<Result<Vec<f32>, BackendError>>,
}

pub struct InferencePool {
    tx: Mutex<Option<mpsc::Sender<InferenceJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl InferencePool {
    pub fn new(workers: usize, queue_depth: usize) -> Self {
        let size = workers.max(1);
        let (tx, rx) = mpsc::channel::<InferenceJob>(queue_depth.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let handles = (0..size).map(|id| tokio::spawn(worker_loop(id, rx.clone()))).collect();
        Self { tx: Mutex::new(Some(tx)), workers: Mutex::new(handles), size }
    }

    pub fn size(&self) -> usize { self.size }

    pub fn is_closed(&self) -> bool { self.tx.lock().is_none() }

    /// Queue one inference and wait for its result.
    pub async fn submit(&self, model: &str, backend: Arc<Backend>, input: Arc<[f32]>) -> Result<Vec<f32>, BackendError> {
        let tx = self.tx.lock().clone().ok_or_else(|| BackendError::Runtime("inference pool closed".into()))?;
        let (resp_tx, resp_rx) = oneshot::channel();
        let job = InferenceJob { model: model.to_string(), backend, input, resp: resp_tx };
        tx.send(job).await.map_err(|_| BackendError::Runtime("inference pool closed".into()))?;
        resp_rx.await.map_err(|_| BackendError::Runtime("inference worker dropped the job".into()))?
    }

    /// Stop accepting jobs. Queued jobs still run; workers exit once drained.
    pub fn close(&self) { self.tx.lock().take(); }

    /// Close and wait for every worker to finish.
    pub async fn join(&self) {
        self.close();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for h in handles {
            let _ = h.await;
        }
    }
}

async fn worker_loop(id: usize, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<InferenceJob>>>) {
    loop {
        let job = { rx.lock().await.recv().await };
        let Some(job) = job else { break };
        if job.resp.is_closed() {
            trace!(worker = id, model = %job.model, "skipping cancelled job");
            continue;
        }
        let InferenceJob { model, backend, input, resp } = job;
        let result = tokio::task::spawn_blocking(move || backend.infer(&input))
            .await
            .unwrap_or_else(|e| Err(BackendError::Runtime(format!("inference task failed: {e}"))));
        if resp.send(result).is_err() {
            trace!(worker = id, %model, "result discarded, caller gone");
        }
    }
    debug!(worker = id, "inference worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LinearBackend;

    #[tokio::test]
    async fn runs_jobs() {
        let pool = InferencePool::new(2, 8);
        let backend = Arc::new(Backend::Linear(LinearBackend::offset(1.0)));
        let out = pool.submit("plus_one", backend, Arc::from(vec![1.0, 2.0, 3.0])).await.unwrap();
        assert_eq!(out, vec![2.0, 3.0, 4.0]);
        assert_eq!(pool.size(), 2);
    }

    #[tokio::test]
    async fn backend_errors_come_back() {
        let pool = InferencePool::new(1, 1);
        let backend = Arc::new(Backend::Linear(LinearBackend::dense(vec![vec![1.0, 1.0]], vec![]).unwrap()));
        let err = pool.submit("dense", backend, Arc::from(vec![1.0])).await.unwrap_err();
        assert!(matches!(err, BackendError::Shape { expected: 2, actual: 1 }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn many_concurrent_jobs_complete() {
        let pool = Arc::new(InferencePool::new(3, 2));
        let backend = Arc::new(Backend::Linear(LinearBackend::identity()));
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..20 {
            let pool = pool.clone();
            let backend = backend.clone();
            tasks.spawn(async move { pool.submit("echo", backend, Arc::from(vec![i as f32])).await });
        }
        let mut seen = 0;
        while let Some(res) = tasks.join_next().await {
            assert_eq!(res.unwrap().unwrap().len(), 1);
            seen += 1;
        }
        assert_eq!(seen, 20);
    }

    #[tokio::test]
    async fn closed_pool_rejects() {
        let pool = InferencePool::new(1, 4);
        pool.join().await;
        assert!(pool.is_closed());
        let backend = Arc::new(Backend::Linear(LinearBackend::identity()));
        assert!(matches!(pool.submit("echo", backend, Arc::from(vec![1.0])).await, Err(BackendError::Runtime(_))));
    }
}
