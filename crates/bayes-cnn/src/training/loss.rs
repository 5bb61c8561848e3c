//! Classification losses: categorical cross-entropy and focal loss.
//!
//! Both take raw logits and reduce to a scalar mean over the batch.

use burn::nn::loss::CrossEntropyLossConfig;
use burn::prelude::*;
use burn::tensor::activation::softmax;

/// Categorical cross-entropy from logits.
///
/// # Arguments
/// - `logits`: shape `(batch, num_classes)`
/// - `targets`: class indices, shape `(batch,)`
///
/// # Returns
/// Scalar loss tensor of shape `(1,)`.
pub fn cross_entropy_loss<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
) -> Tensor<B, 1> {
    let device = logits.device();
    CrossEntropyLossConfig::new().init(&device).forward(logits, targets)
}

/// Multi-class focal loss (Lin et al., 2017).
///
/// Per example: `sum_c alpha * (1 - p_c)^gamma * (-y_c * ln p_c)` with
/// `p = softmax(logits) + 1e-9`. Returns the batch mean as a `(1,)` tensor.
///
/// # Arguments
/// - `logits`: shape `(batch, num_classes)`
/// - `one_hot`: shape `(batch, num_classes)`
pub fn focal_loss<B: Backend>(
    logits: Tensor<B, 2>,
    one_hot: Tensor<B, 2>,
    gamma: f64,
    alpha: f64,
) -> Tensor<B, 1> {
    let probs = softmax(logits, 1).add_scalar(1e-9);
    let ce = one_hot * probs.clone().log().neg();
    let weight = probs.neg().add_scalar(1.0).powf_scalar(gamma);
    let per_example = (weight * ce).mul_scalar(alpha).sum_dim(1);
    per_example.mean()
}
