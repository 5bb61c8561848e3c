use burn::module::Param;
use burn::prelude::*;
use burn::tensor::module::conv2d;
use burn::tensor::ops::ConvOptions;
use burn::tensor::{Distribution, TensorData};

/// Configuration for a constrained (prediction-error) convolution.
#[derive(Config, Debug)]
pub struct ConstrainedConv2dConfig {
    /// Input channels (1 for grayscale patches).
    #[config(default = 1)]
    pub channels_in: usize,
    /// Number of prediction-error filters.
    #[config(default = 3)]
    pub channels_out: usize,
    /// Square kernel side. Must be odd.
    #[config(default = 5)]
    pub kernel_size: usize,
}

/// Convolution whose kernels are forced to be prediction-error filters.
///
/// At every forward pass each `(out, in)` kernel is renormalized so its
/// center tap is `-1` and the remaining taps sum to `1`. The layer therefore
/// suppresses scene content and keeps the sensor-noise residual that
/// identifies a camera model.
#[derive(Module, Debug)]
pub struct ConstrainedConv2d<B: Backend> {
    /// Raw weight, shape `(channels_out, channels_in, k, k)`.
    pub(crate) weight: Param<Tensor<B, 4>>,
    kernel_size: usize,
}

impl ConstrainedConv2dConfig {
    /// Raw weights start uniform in `[0, 1)` so the off-center sum is positive.
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConstrainedConv2d<B> {
        let k = self.kernel_size;
        let weight = Tensor::random(
            [self.channels_out, self.channels_in, k, k],
            Distribution::Uniform(0.0, 1.0),
            device,
        );
        ConstrainedConv2d {
            weight: Param::from_tensor(weight),
            kernel_size: k,
        }
    }
}

impl<B: Backend> ConstrainedConv2d<B> {
    /// Weight after the prediction-error constraint is applied.
    pub fn constrained_weight(&self) -> Tensor<B, 4> {
        let weight = self.weight.val();
        let device = weight.device();
        let k = self.kernel_size;

        let mut center = vec![0.0_f32; k * k];
        center[(k / 2) * k + k / 2] = 1.0;
        let center = Tensor::<B, 4>::from_data(TensorData::new(center, [1, 1, k, k]), &device);

        let off_center = weight * center.clone().neg().add_scalar(1.0);
        let off_sum = off_center.clone().sum_dim(3).sum_dim(2);
        off_center / off_sum - center
    }

    /// `(batch, c_in, h, w)` to `(batch, c_out, h, w)`, same padding.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let pad = self.kernel_size / 2;
        conv2d(
            input,
            self.constrained_weight(),
            None,
            ConvOptions::new([1, 1], [pad, pad], [1, 1], 1),
        )
    }
}
