//! tract-backed runtimes: ONNX (`onnx` feature) and frozen TensorFlow graphs
//! (`tensorflow` feature). Without the matching feature, loading reports
//! `BackendError::Unsupported`.

use std::path::Path;

#[cfg(any(feature = "onnx", feature = "tensorflow"))]
use tract_core::prelude::*;

use super::BackendError;

pub struct TractBackend {
    #[cfg(any(feature = "onnx", feature = "tensorflow"))]
    plan: TypedRunnableModel<TypedModel>,
    /// Concrete input shape, declared or read from the model. `None` feeds `[1, len]`.
    input_shape: Option<Vec<usize>>,
}

impl std::fmt::Debug for TractBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TractBackend").field("input_shape", &self.input_shape).finish_non_exhaustive()
    }
}

#[cfg(any(feature = "onnx", feature = "tensorflow"))]
fn runtime_err(e: impl std::fmt::Display) -> BackendError { BackendError::Runtime(e.to_string()) }

#[cfg(any(feature = "onnx", feature = "tensorflow"))]
fn format_err(e: impl std::fmt::Display) -> BackendError { BackendError::Format(e.to_string()) }

impl TractBackend {
    #[cfg(any(feature = "onnx", feature = "tensorflow"))]
    fn from_plan(plan: TypedRunnableModel<TypedModel>, declared: Option<&[usize]>) -> Result<Self, BackendError> {
        let concrete = plan
            .model()
            .input_fact(0)
            .ok()
            .and_then(|f| f.shape.as_concrete().map(|s| s.to_vec()));
        let this = Self { plan, input_shape: declared.map(|s| s.to_vec()).or(concrete) };
        this.warmup()?;
        Ok(this)
    }

    #[cfg(any(feature = "onnx", feature = "tensorflow"))]
    fn warmup(&self) -> Result<(), BackendError> {
        if let Some(len) = self.input_len() {
            self.infer(&vec![0.0; len])?;
        }
        Ok(())
    }

    pub fn input_len(&self) -> Option<usize> {
        self.input_shape.as_ref().map(|s| s.iter().product())
    }

    #[cfg(any(feature = "onnx", feature = "tensorflow"))]
    pub fn infer(&self, input: &[f32]) -> Result<Vec<f32>, BackendError> {
        let shape = self.input_shape.clone().unwrap_or_else(|| vec![1, input.len()]);
        let expected: usize = shape.iter().product();
        if expected != input.len() {
            return Err(BackendError::Shape { expected, actual: input.len() });
        }
        let tensor = Tensor::from_shape(&shape, input).map_err(runtime_err)?;
        let outputs = self.plan.run(tvec!(tensor.into())).map_err(runtime_err)?;
        let first = outputs.first().ok_or_else(|| BackendError::Runtime("model produced no outputs".into()))?;
        let view = first.to_array_view::<f32>().map_err(runtime_err)?;
        Ok(view.iter().copied().collect())
    }

    #[cfg(not(any(feature = "onnx", feature = "tensorflow")))]
    pub fn infer(&self, _input: &[f32]) -> Result<Vec<f32>, BackendError> {
        Err(BackendError::Unsupported("no tract runtime compiled in".into()))
    }
}

#[cfg(feature = "onnx")]
pub fn load_onnx(path: &Path, input_shape: Option<&[usize]>) -> Result<TractBackend, BackendError> {
    use tract_onnx::prelude::*;
    let mut model = tract_onnx::onnx().model_for_path(path).map_err(format_err)?;
    if let Some(shape) = input_shape {
        model = model.with_input_fact(0, f32::fact(shape.to_vec()).into()).map_err(format_err)?;
    }
    let plan = model.into_optimized().map_err(format_err)?.into_runnable().map_err(format_err)?;
    TractBackend::from_plan(plan, input_shape)
}

#[cfg(not(feature = "onnx"))]
pub fn load_onnx(path: &Path, _input_shape: Option<&[usize]>) -> Result<TractBackend, BackendError> {
    Err(BackendError::Unsupported(format!("onnx support not compiled in (artifact {})", path.display())))
}

#[cfg(feature = "tensorflow")]
pub fn load_graph(path: &Path, input_shape: Option<&[usize]>) -> Result<TractBackend, BackendError> {
    use tract_tensorflow::prelude::*;
    let mut model = tract_tensorflow::tensorflow().model_for_path(path).map_err(format_err)?;
    if let Some(shape) = input_shape {
        model = model.with_input_fact(0, f32::fact(shape.to_vec()).into()).map_err(format_err)?;
    }
    let plan = model.into_optimized().map_err(format_err)?.into_runnable().map_err(format_err)?;
    TractBackend::from_plan(plan, input_shape)
}

#[cfg(not(feature = "tensorflow"))]
pub fn load_graph(path: &Path, _input_shape: Option<&[usize]>) -> Result<TractBackend, BackendError> {
    Err(BackendError::Unsupported(format!("tensorflow graph support not compiled in (artifact {})", path.display())))
}
