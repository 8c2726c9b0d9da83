use burn::{ prelude::Backend, tensor::Tensor };

use crate::error::{ SegError, SegResult };

pub const DEFAULT_DICE_EPSILON: f64 = 1024.0;

/// Soft dice loss, one value per sample.
///
/// `epsilon` is added to both sides of the overlap ratio. The default of 1024
/// is much larger than a usual smoothing term: for small to moderate overlaps
/// the loss stays close to zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiceLoss {
    epsilon: f64,
}

impl Default for DiceLoss {
    fn default() -> Self {
        Self::new(DEFAULT_DICE_EPSILON)
    }
}

impl DiceLoss {
    pub fn new(epsilon: f64) -> Self {
        Self { epsilon }
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// `1 - (2 * overlap + eps) / (predicted + labelled + eps)` per sample.
    ///
    /// Both tensors must share the same shape `[N, ...]`; every dimension after
    /// the first is summed.
    pub fn forward<B: Backend, const D: usize>(
        &self,
        label: Tensor<B, D>,
        prediction: Tensor<B, D>
    ) -> SegResult<Tensor<B, 1>> {
        let label_dims = label.dims();
        let prediction_dims = prediction.dims();
        if label_dims != prediction_dims {
            return Err(SegError::ShapeMismatch {
                what: "dice loss",
                expected: label_dims.to_vec(),
                actual: prediction_dims.to_vec(),
            });
        }

        let dice_label = sum_per_sample(label.clone());
        let dice_prediction = sum_per_sample(prediction.clone());
        let dice_correct = sum_per_sample(prediction * label);

        let numerator = dice_correct.mul_scalar(2.0).add_scalar(self.epsilon);
        let denominator = (dice_prediction + dice_label).add_scalar(self.epsilon);

        Ok(numerator.div(denominator).neg().add_scalar(1.0))
    }
}

/// Sums everything but the batch dimension, `[N, ...] -> [N]`.
pub fn sum_per_sample<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Tensor<B, 1> {
    let n = tensor.dims()[0];
    let per_sample = tensor.shape().num_elements() / n.max(1);

    tensor.reshape([n, per_sample]).sum_dim(1).reshape([n])
}
