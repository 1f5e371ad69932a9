//! Model registry: static catalog of model descriptors keyed by unique name.
//!
//! Insertion-once semantics; descriptors are immutable after registration and
//! shared out as `Arc<ModelDescriptor>`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{EnsembleError, Result};

/// Closed set of supported inference runtimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// Frozen TensorFlow graph executed by tract
    #[serde(rename = "graph", alias = "tensorflow")]
    GraphRuntime,
    /// ONNX interchange model executed by tract
    #[serde(rename = "onnx", alias = "interchange")]
    InterchangeRuntime,
    /// Built-in dense affine model stored as JSON
    #[serde(rename = "linear")]
    Linear,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GraphRuntime => write!(f, "graph"),
            Self::InterchangeRuntime => write!(f, "onnx"),
            Self::Linear => write!(f, "linear"),
        }
    }
}

fn default_weight() -> f32 { 1.0 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub backend: BackendKind,
    /// Location of the model artifact. Interpreted by the backend loader.
    pub artifact: String,
    #[serde(default)]
    pub input_shape: Option<Vec<usize>>,
    /// Optional hex SHA-256 of the artifact, verified before deserialization.
    #[serde(default)]
    pub sha256: Option<String>,
    /// Relative weight under weighted-mean aggregation.
    #[serde(default = "default_weight")]
    pub weight: f32,
}

impl ModelDescriptor {
    pub fn new(name: impl Into<String>, backend: BackendKind, artifact: impl Into<String>) -> Self {
        Self { name: name.into(), backend, artifact: artifact.into(), input_shape: None, sha256: None, weight: default_weight() }
    }

    pub fn with_input_shape(mut self, shape: Vec<usize>) -> Self { self.input_shape = Some(shape); self }
    pub fn with_sha256(mut self, digest: impl Into<String>) -> Self { self.sha256 = Some(digest.into()); self }
    pub fn with_weight(mut self, weight: f32) -> Self { self.weight = weight; self }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EnsembleError::Config("model name must not be empty".into()));
        }
        if !self.weight.is_finite() || self.weight <= 0.0 {
            return Err(EnsembleError::Config(format!("model '{}' has invalid weight {}", self.name, self.weight)));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct ModelRegistry {
    models: RwLock<HashMap<String, Arc<ModelDescriptor>>>,
}

impl ModelRegistry {
    pub fn new() -> Self { Self::default() }

    /// Store a descriptor. Fails if the name is already taken.
    pub fn register(&self, descriptor: ModelDescriptor) -> Result<()> {
        descriptor.validate()?;
        let mut models = self.models.write();
        if models.contains_key(&descriptor.name) {
            return Err(EnsembleError::DuplicateModel(descriptor.name));
        }
        info!(model = %descriptor.name, backend = %descriptor.backend, artifact = %descriptor.artifact, "model registered");
        models.insert(descriptor.name.clone(), Arc::new(descriptor));
        Ok(())
    }

    pub fn get_descriptor(&self, name: &str) -> Result<Arc<ModelDescriptor>> {
        self.models.read().get(name).cloned().ok_or_else(|| EnsembleError::UnknownModel(name.to_string()))
    }

    /// Names registered at the time of the call. The returned iterator can be
    /// cloned to restart it; order is unspecified.
    pub fn list_names(&self) -> impl Iterator<Item = String> + Clone {
        let names: Vec<String> = self.models.read().keys().cloned().collect();
        names.into_iter()
    }

    pub fn contains(&self, name: &str) -> bool { self.models.read().contains_key(name) }
    pub fn len(&self) -> usize { self.models.read().len() }
    pub fn is_empty(&self) -> bool { self.models.read().is_empty() }
}
