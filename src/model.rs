//! Segmentation model boundary.
//!
//! The core consumes the pretrained trap model through exactly one
//! capability: `predict(batch) -> class probabilities`. Architecture,
//! training and loss functions stay opaque — the serialized model references
//! two custom loss functions by name, and the caller supplies those names at
//! load time via [`CustomObjects`]; the core never defines or reimplements
//! the loss math.
//!
//! The production backend is `tract-onnx` (pure Rust, no runtime downloads).
//! Tests substitute their own [`SegmentationModel`] implementations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, info};
use ndarray::{Array4, ArrayView4};
use tract_onnx::prelude::*;

use crate::error::{CompileError, Result};

/// Number of output classes: trap, central trough, background.
pub const CLASSES: usize = 3;

/// Injected inference capability.
///
/// `batch` is `(n, side, side, 1)` with intensities scaled to `[0, 1]`; the
/// result is `(n, side, side, 3)` per-pixel class probabilities in the order
/// trap / trough / background.
pub trait SegmentationModel {
    fn predict(&self, batch: ArrayView4<f32>) -> Result<Array4<f32>>;
}

/// Named custom objects a serialized model requires at load time.
#[derive(Clone, Debug)]
pub struct CustomObjects {
    pub losses: Vec<String>,
}

impl CustomObjects {
    /// The two loss functions trap models are trained with.
    pub fn trap_losses() -> Self {
        Self {
            losses: vec!["tversky_loss".to_string(), "cce_tversky_loss".to_string()],
        }
    }
}

/// Tract-backed trap segmentation model.
///
/// Execution plans are specialized per batch size on first use and cached,
/// so repeated calls with the pipeline's configured batch size compile the
/// graph once.
#[derive(Debug)]
pub struct TractModel {
    path: PathBuf,
    graph: InferenceModel,
    plans: Mutex<HashMap<usize, TypedSimplePlan<TypedModel>>>,
}

/// Load a serialized trap model.
///
/// `custom` must name every loss the checkpoint references; an empty set is
/// rejected before touching the file so the precondition surfaces clearly.
pub fn load_model(path: &Path, custom: &CustomObjects) -> Result<TractModel> {
    if custom.losses.is_empty() {
        return Err(CompileError::ModelLoad {
            path: path.to_path_buf(),
            message: "no custom loss objects supplied".to_string(),
        });
    }
    let graph = tract_onnx::onnx()
        .model_for_path(path)
        .map_err(|e| CompileError::ModelLoad {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    info!(
        "loaded segmentation model {} (custom objects: {})",
        path.display(),
        custom.losses.join(", ")
    );
    Ok(TractModel {
        path: path.to_path_buf(),
        graph,
        plans: Mutex::new(HashMap::new()),
    })
}

impl TractModel {
    fn run_plan(&self, batch: ArrayView4<f32>) -> Result<Array4<f32>> {
        let (n, rows, cols, _) = batch.dim();
        let mut plans = self
            .plans
            .lock()
            .map_err(|_| CompileError::model("model plan cache poisoned"))?;
        if !plans.contains_key(&n) {
            debug!(
                "compiling inference plan for batch size {n} ({})",
                self.path.display()
            );
            let plan = self
                .graph
                .clone()
                .with_input_fact(0, f32::fact([n, rows, cols, 1]).into())
                .and_then(|m| m.into_optimized())
                .and_then(|m| m.into_runnable())
                .map_err(CompileError::model)?;
            plans.insert(n, plan);
        }
        let plan = &plans[&n];

        let contiguous = batch.as_standard_layout();
        let data = contiguous
            .as_slice()
            .ok_or_else(|| CompileError::model("non-contiguous input batch"))?;
        let input = Tensor::from_shape(&[n, rows, cols, 1], data).map_err(CompileError::model)?;
        let outputs = plan
            .run(tvec!(input.into_tvalue()))
            .map_err(CompileError::model)?;
        let view = outputs[0]
            .to_array_view::<f32>()
            .map_err(CompileError::model)?;
        let shape = view.shape().to_vec();
        if shape != [n, rows, cols, CLASSES] {
            return Err(CompileError::model(format!(
                "model returned shape {shape:?}, expected [{n}, {rows}, {cols}, {CLASSES}]"
            )));
        }
        let flat: Vec<f32> = view.iter().copied().collect();
        Array4::from_shape_vec((n, rows, cols, CLASSES), flat)
            .map_err(CompileError::model)
    }
}

impl SegmentationModel for TractModel {
    fn predict(&self, batch: ArrayView4<f32>) -> Result<Array4<f32>> {
        self.run_plan(batch)
    }
}

/// Run a batch through the model in `batch_size` chunks and reassemble.
///
/// The chunk size bounds peak memory only; results are identical for any
/// positive value.
pub fn predict_chunked(
    model: &dyn SegmentationModel,
    batch: ArrayView4<f32>,
    batch_size: usize,
) -> Result<Array4<f32>> {
    let (n, rows, cols, _) = batch.dim();
    let chunk = batch_size.max(1);
    let mut out = Array4::<f32>::zeros((n, rows, cols, CLASSES));
    let mut start = 0usize;
    while start < n {
        let end = (start + chunk).min(n);
        let part = batch.slice(ndarray::s![start..end, .., .., ..]);
        let probs = model.predict(part)?;
        out.slice_mut(ndarray::s![start..end, .., .., ..])
            .assign(&probs);
        start = end;
    }
    Ok(out)
}
