//! Camera-model classifiers: constrained (prediction-error) convolution,
//! Flipout variational layers, the vanilla and Bayesian CNNs, and the tensor
//! bridge from `patches` batches to burn tensors.

pub mod bayesian;
pub mod bridge;
pub mod constrained_conv;
pub mod flipout;
pub mod vanilla;

use burn::prelude::*;

pub use bayesian::{BayesianCnn, BayesianCnnConfig};
pub use constrained_conv::{ConstrainedConv2d, ConstrainedConv2dConfig};
pub use flipout::{FlipoutConv2d, FlipoutLinear, LayerWeightStats};
pub use vanilla::{VanillaCnn, VanillaCnnConfig};

/// A network mapping grayscale patches to per-class logits.
pub trait Classifier<B: Backend> {
    /// `(batch, 1, size, size)` to logits `(batch, num_classes)`.
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;

    /// Regularization from variational layers, already scaled per example.
    fn kl_loss(&self) -> Option<Tensor<B, 1>> {
        None
    }

    /// The leading prediction-error convolution.
    fn constrained_conv(&self) -> &ConstrainedConv2d<B>;
}
