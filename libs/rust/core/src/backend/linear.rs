//! Dense affine model stored as a JSON artifact: `y = W·x + bias + offset`.
//!
//! `weights` absent means identity. Useful for deterministic baselines such as
//! calibration offsets, and as a lightweight stand-in for heavier runtimes.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::BackendError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinearBackend {
    #[serde(default)]
    weights: Option<Vec<Vec<f32>>>,
    #[serde(default)]
    bias: Vec<f32>,
    #[serde(default)]
    offset: f32,
}

impl LinearBackend {
    /// Returns its input unchanged.
    pub fn identity() -> Self { Self::default() }

    /// Adds `offset` to every element.
    pub fn offset(offset: f32) -> Self { Self { offset, ..Self::default() } }

    pub fn dense(weights: Vec<Vec<f32>>, bias: Vec<f32>) -> Result<Self, BackendError> {
        let this = Self { weights: Some(weights), bias, offset: 0.0 };
        this.validate()?;
        Ok(this)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, BackendError> {
        let this: Self = serde_json::from_slice(bytes).map_err(|e| BackendError::Format(e.to_string()))?;
        this.validate()?;
        Ok(this)
    }

    pub fn from_path(path: &Path) -> Result<Self, BackendError> {
        let bytes = std::fs::read(path)?;
        Self::from_json(&bytes)
    }

    /// Expected input length, if fixed by a weight matrix.
    pub fn input_len(&self) -> Option<usize> {
        self.weights.as_ref().and_then(|w| w.first()).map(|row| row.len())
    }

    fn validate(&self) -> Result<(), BackendError> {
        if let Some(w) = &self.weights {
            let cols = w.first().map(|r| r.len()).unwrap_or(0);
            if w.is_empty() || cols == 0 {
                return Err(BackendError::Format("weight matrix must be non-empty".into()));
            }
            if w.iter().any(|r| r.len() != cols) {
                return Err(BackendError::Format("weight matrix rows differ in length".into()));
            }
            if !self.bias.is_empty() && self.bias.len() != w.len() {
                return Err(BackendError::Format(format!("bias has {} entries for {} rows", self.bias.len(), w.len())));
            }
        }
        if !self.offset.is_finite() {
            return Err(BackendError::Format("offset must be finite".into()));
        }
        Ok(())
    }

    pub fn infer(&self, input: &[f32]) -> Result<Vec<f32>, BackendError> {
        let mut out = match &self.weights {
            Some(w) => {
                let cols = w[0].len();
                if input.len() != cols {
                    return Err(BackendError::Shape { expected: cols, actual: input.len() });
                }
                w.iter().map(|row| row.iter().zip(input).map(|(a, x)| a * x).sum()).collect::<Vec<f32>>()
            }
            None => input.to_vec(),
        };
        if !self.bias.is_empty() {
            if self.bias.len() != out.len() {
                return Err(BackendError::Shape { expected: self.bias.len(), actual: out.len() });
            }
            for (y, b) in out.iter_mut().zip(&self.bias) { *y += b; }
        }
        if self.offset != 0.0 {
            for y in out.iter_mut() { *y += self.offset; }
        }
        Ok(out)
    }
}
