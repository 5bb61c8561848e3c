use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig};
use burn::nn::{Linear, LinearConfig, PaddingConfig2d, Relu};
use burn::prelude::*;

use crate::model::constrained_conv::{ConstrainedConv2d, ConstrainedConv2dConfig};
use crate::model::Classifier;

/// Configuration for the deterministic baseline CNN.
///
/// ```text
/// (batch, 1, s, s)
///   → ConstrainedConv2d(1→3, 5x5)
///   → Conv2d(3→c1, 3x3) → ReLU → MaxPool(2)
///   → Conv2d(c1→c2, 3x3) → ReLU → MaxPool(2)
///   → AdaptiveAvgPool(1x1) → flatten
///   → Linear(c2→num_classes)
///   → logits: (batch, num_classes)
/// ```
#[derive(Config, Debug)]
pub struct VanillaCnnConfig {
    /// Number of camera models.
    pub num_classes: usize,
    #[config(default = 3)]
    pub constrained_channels: usize,
    #[config(default = 32)]
    pub conv1_channels: usize,
    #[config(default = 64)]
    pub conv2_channels: usize,
}

/// Deterministic camera-model classifier.
#[derive(Module, Debug)]
pub struct VanillaCnn<B: Backend> {
    constrained_conv: ConstrainedConv2d<B>,
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    pool: MaxPool2d,
    global_pool: AdaptiveAvgPool2d,
    classifier: Linear<B>,
    activation: Relu,
}

impl VanillaCnnConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> VanillaCnn<B> {
        let conv = |c_in: usize, c_out: usize| {
            Conv2dConfig::new([c_in, c_out], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };
        VanillaCnn {
            constrained_conv: ConstrainedConv2dConfig::new()
                .with_channels_out(self.constrained_channels)
                .init(device),
            conv1: conv(self.constrained_channels, self.conv1_channels),
            conv2: conv(self.conv1_channels, self.conv2_channels),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            classifier: LinearConfig::new(self.conv2_channels, self.num_classes).init(device),
            activation: Relu::new(),
        }
    }
}

impl<B: Backend> Classifier<B> for VanillaCnn<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.constrained_conv.forward(images);
        let x = self.pool.forward(self.activation.forward(self.conv1.forward(x)));
        let x = self.pool.forward(self.activation.forward(self.conv2.forward(x)));
        let x: Tensor<B, 2> = self.global_pool.forward(x).flatten(1, 3);
        self.classifier.forward(x)
    }

    fn constrained_conv(&self) -> &ConstrainedConv2d<B> {
        &self.constrained_conv
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn tiny(num_classes: usize) -> VanillaCnnConfig {
        VanillaCnnConfig::new(num_classes)
            .with_conv1_channels(4)
            .with_conv2_channels(8)
    }

    #[test]
    fn test_forward_shape() {
        let device = Default::default();
        let model = tiny(5).init::<TestBackend>(&device);
        let images =
            Tensor::<TestBackend, 4>::random([3, 1, 16, 16], Distribution::Uniform(0.0, 1.0), &device);
        assert_eq!(model.forward(images).dims(), [3, 5]);
    }

    #[test]
    fn test_forward_is_deterministic() {
        let device = Default::default();
        let model = tiny(2).init::<TestBackend>(&device);
        let images =
            Tensor::<TestBackend, 4>::random([2, 1, 16, 16], Distribution::Uniform(0.0, 1.0), &device);

        let a = model.forward(images.clone());
        let b = model.forward(images);
        let diff: f32 = (a - b).abs().max().into_scalar().elem();
        assert!(diff < 1e-6);
        assert!(model.kl_loss().is_none());
    }
}
