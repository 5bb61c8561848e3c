use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig};
use burn::nn::Relu;
use burn::prelude::*;

use crate::model::constrained_conv::{ConstrainedConv2d, ConstrainedConv2dConfig};
use crate::model::flipout::{
    FlipoutConv2d, FlipoutConv2dConfig, FlipoutLinear, FlipoutLinearConfig, LayerWeightStats,
};
use crate::model::Classifier;

/// Configuration for the Bayesian CNN.
///
/// Same topology as [`crate::model::VanillaCnn`] with every layer after the
/// constrained convolution replaced by a Flipout layer. Each Flipout KL term
/// is scaled by `1 / train_size`.
#[derive(Config, Debug)]
pub struct BayesianCnnConfig {
    pub num_classes: usize,
    /// Number of training examples, used to scale the KL terms.
    pub train_size: usize,
    #[config(default = 3)]
    pub constrained_channels: usize,
    #[config(default = 32)]
    pub conv1_channels: usize,
    #[config(default = 64)]
    pub conv2_channels: usize,
    #[config(default = -3.0)]
    pub rho_init: f64,
}

/// Camera-model classifier with variational weights.
#[derive(Module, Debug)]
pub struct BayesianCnn<B: Backend> {
    constrained_conv: ConstrainedConv2d<B>,
    flipout_conv1: FlipoutConv2d<B>,
    flipout_conv2: FlipoutConv2d<B>,
    pool: MaxPool2d,
    global_pool: AdaptiveAvgPool2d,
    flipout_dense: FlipoutLinear<B>,
    activation: Relu,
}

impl BayesianCnnConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> BayesianCnn<B> {
        let kl_scale = 1.0 / self.train_size.max(1) as f64;
        let conv = |c_in: usize, c_out: usize| {
            FlipoutConv2dConfig::new([c_in, c_out], 3)
                .with_rho_init(self.rho_init)
                .with_kl_scale(kl_scale)
                .init(device)
        };
        BayesianCnn {
            constrained_conv: ConstrainedConv2dConfig::new()
                .with_channels_out(self.constrained_channels)
                .init(device),
            flipout_conv1: conv(self.constrained_channels, self.conv1_channels),
            flipout_conv2: conv(self.conv1_channels, self.conv2_channels),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            flipout_dense: FlipoutLinearConfig::new(self.conv2_channels, self.num_classes)
                .with_rho_init(self.rho_init)
                .with_kl_scale(kl_scale)
                .init(device),
            activation: Relu::new(),
        }
    }
}

impl<B: Backend> BayesianCnn<B> {
    /// Kernel prior and posterior summaries, one entry per Flipout layer.
    pub fn flipout_stats(&self) -> Vec<LayerWeightStats> {
        vec![
            self.flipout_conv1.weight_stats("flipout_conv1"),
            self.flipout_conv2.weight_stats("flipout_conv2"),
            self.flipout_dense.weight_stats("flipout_dense"),
        ]
    }
}

impl<B: Backend> Classifier<B> for BayesianCnn<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.constrained_conv.forward(images);
        let x = self.pool.forward(self.activation.forward(self.flipout_conv1.forward(x)));
        let x = self.pool.forward(self.activation.forward(self.flipout_conv2.forward(x)));
        let x: Tensor<B, 2> = self.global_pool.forward(x).flatten(1, 3);
        self.flipout_dense.forward(x)
    }

    fn kl_loss(&self) -> Option<Tensor<B, 1>> {
        Some(
            self.flipout_conv1.kl_divergence()
                + self.flipout_conv2.kl_divergence()
                + self.flipout_dense.kl_divergence(),
        )
    }

    fn constrained_conv(&self) -> &ConstrainedConv2d<B> {
        &self.constrained_conv
    }
}
