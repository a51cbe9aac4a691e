//! Per-task training losses.

use candle_core::{DType, Tensor, D};

use crate::config::TaskKind;
use crate::dataset::Batch;
use crate::error::{Result, ZooError};

/// Loss function, resolved once from the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossKind {
    /// Cross-entropy over class logits.
    CrossEntropy,
    /// Smooth-L1 over box coordinates.
    SmoothL1,
    /// Cross-entropy per output pixel.
    PixelCrossEntropy,
    /// Mean squared error.
    Mse,
    /// Visibility-weighted heatmap MSE.
    JointsMse,
}

impl From<TaskKind> for LossKind {
    fn from(task: TaskKind) -> Self {
        match task {
            TaskKind::Classification => LossKind::CrossEntropy,
            TaskKind::Bbox => LossKind::SmoothL1,
            TaskKind::Segmentation => LossKind::PixelCrossEntropy,
            TaskKind::Generation => LossKind::Mse,
            TaskKind::Pose => LossKind::JointsMse,
        }
    }
}

impl LossKind {
    /// Scalar loss of `output` (the flat model output, `(B, D)`) against the
    /// batch targets.
    ///
    /// # Errors
    ///
    /// Returns an error if the shapes do not fit the loss.
    pub fn compute(self, output: &Tensor, batch: &Batch) -> Result<Tensor> {
        let loss = match self {
            LossKind::CrossEntropy => {
                let targets = batch.targets.flatten_all()?.to_dtype(DType::U32)?;
                candle_nn::loss::cross_entropy(output, &targets)?
            }
            LossKind::SmoothL1 => {
                let targets = batch.targets.reshape(output.shape())?.to_dtype(output.dtype())?;
                smooth_l1(output, &targets)?
            }
            LossKind::PixelCrossEntropy => {
                let (b, pixels) = batch.targets.dims2()?;
                let (_, features) = output.dims2()?;
                if pixels == 0 || features % pixels != 0 {
                    return Err(ZooError::Training(format!(
                        "segmentation output of {features} features does not tile {pixels} pixels"
                    )));
                }
                let classes = features / pixels;
                let logits = output
                    .reshape((b, classes, pixels))?
                    .transpose(1, 2)?
                    .contiguous()?
                    .reshape((b * pixels, classes))?;
                let targets = batch.targets.flatten_all()?.to_dtype(DType::U32)?;
                candle_nn::loss::cross_entropy(&logits, &targets)?
            }
            LossKind::Mse => {
                let targets = batch.targets.reshape(output.shape())?.to_dtype(output.dtype())?;
                candle_nn::loss::mse(output, &targets)?
            }
            LossKind::JointsMse => {
                let keypoints = batch.keypoints.as_ref().ok_or_else(|| {
                    ZooError::Training("pose loss needs keypoint targets".into())
                })?;
                let (b, k, h, w) = batch.targets.dims4()?;
                let pred = output.reshape((b, k, h * w))?;
                let target = batch.targets.reshape((b, k, h * w))?.to_dtype(pred.dtype())?;
                let weight = keypoints.visibility.to_dtype(pred.dtype())?.unsqueeze(D::Minus1)?;
                let diff = (pred - target)?.broadcast_mul(&weight)?;
                (diff.sqr()?.mean_all()? * 0.5)?
            }
        };
        Ok(loss)
    }
}

/// Mean smooth-L1 (Huber with `beta = 1`).
fn smooth_l1(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    let d = (pred - target)?.abs()?;
    let quad = d.clamp(0f32, 1f32)?;
    let linear = (&d - &quad)?;
    Ok(((quad.sqr()? * 0.5)? + linear)?.mean_all()?)
}
