//! Backend adapters.
//!
//! Every backend kind exposes the same capability, `infer(&[f32]) -> Vec<f32>`.
//! The set of variants is closed: a new runtime is a new `Backend` variant and a
//! new `BackendKind`, chosen at registration time.
//!
//! Loading goes through the [`BackendLoader`] trait so the manager never needs
//! to know how an artifact is turned into a runnable model.

mod linear;
mod tract;

use std::path::Path;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::registry::{BackendKind, ModelDescriptor};

pub use linear::LinearBackend;
pub use tract::TractBackend;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid model artifact: {0}")]
    Format(String),

    #[error("artifact digest mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("unsupported backend: {0}")]
    Unsupported(String),

    #[error("input length {actual} does not match expected {expected}")]
    Shape { expected: usize, actual: usize },

    #[error("runtime error: {0}")]
    Runtime(String),
}

#[derive(Debug)]
pub enum Backend {
    Graph(TractBackend),
    Interchange(TractBackend),
    Linear(LinearBackend),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Graph(_) => BackendKind::GraphRuntime,
            Self::Interchange(_) => BackendKind::InterchangeRuntime,
            Self::Linear(_) => BackendKind::Linear,
        }
    }

    /// Run the model on one input vector. CPU bound; callers on an async
    /// runtime should go through the inference pool.
    pub fn infer(&self, input: &[f32]) -> Result<Vec<f32>, BackendError> {
        match self {
            Self::Graph(m) | Self::Interchange(m) => m.infer(input),
            Self::Linear(m) => m.infer(input),
        }
    }

    pub fn input_len(&self) -> Option<usize> {
        match self {
            Self::Graph(m) | Self::Interchange(m) => m.input_len(),
            Self::Linear(m) => m.input_len(),
        }
    }
}

/// Turns a descriptor into a ready backend.
#[async_trait]
pub trait BackendLoader: Send + Sync + 'static {
    async fn load(&self, descriptor: &ModelDescriptor) -> Result<Backend, BackendError>;
}

/// Production loader: reads the artifact from the local filesystem, checks its
/// digest when one is declared, and deserializes on the blocking pool.
#[derive(Debug, Clone, Default)]
pub struct ArtifactLoader;

#[async_trait]
impl BackendLoader for ArtifactLoader {
    async fn load(&self, descriptor: &ModelDescriptor) -> Result<Backend, BackendError> {
        let descriptor = descriptor.clone();
        tokio::task::spawn_blocking(move || load_artifact(&descriptor))
            .await
            .map_err(|e| BackendError::Runtime(format!("loader task failed: {e}")))?
    }
}

/// Accepts plain paths and `file://` URIs.
pub fn artifact_path(artifact: &str) -> &Path {
    Path::new(artifact.strip_prefix("file://").unwrap_or(artifact))
}

fn load_artifact(descriptor: &ModelDescriptor) -> Result<Backend, BackendError> {
    let path = artifact_path(&descriptor.artifact);
    if let Some(expected) = descriptor.sha256.as_deref().filter(|d| !d.is_empty()) {
        verify_digest(path, expected)?;
    }
    let shape = descriptor.input_shape.as_deref();
    match descriptor.backend {
        BackendKind::Linear => LinearBackend::from_path(path).map(Backend::Linear),
        BackendKind::InterchangeRuntime => tract::load_onnx(path, shape).map(Backend::Interchange),
        BackendKind::GraphRuntime => tract::load_graph(path, shape).map(Backend::Graph),
    }
}

fn verify_digest(path: &Path, expected: &str) -> Result<(), BackendError> {
    let bytes = std::fs::read(path)?;
    let actual = hex::encode(Sha256::digest(&bytes));
    if !expected.eq_ignore_ascii_case(&actual) {
        return Err(BackendError::Integrity { expected: expected.to_string(), actual });
    }
    Ok(())
}
