//! Variational layers with Flipout weight perturbations.
//!
//! Each kernel has a factorized Gaussian posterior `N(mu, softplus(rho))`
//! and a fixed standard normal prior. A forward pass draws one weight
//! perturbation shared by the batch and decorrelates it across examples with
//! random sign flips on the input and output channels (Wen et al., 2018).
//! Biases are deterministic.

use burn::module::Param;
use burn::prelude::*;
use burn::tensor::module::conv2d;
use burn::tensor::ops::ConvOptions;
use burn::tensor::Distribution;

use crate::model::bridge::tensor_to_vec;

/// Per-layer kernel distribution summary used for posterior plots.
#[derive(Debug, Clone)]
pub struct LayerWeightStats {
    pub name: String,
    pub prior_mean: Vec<f32>,
    pub prior_std: Vec<f32>,
    pub posterior_mean: Vec<f32>,
    pub posterior_std: Vec<f32>,
}

/// `softplus(rho)`, the posterior standard deviation.
fn softplus<B: Backend, const D: usize>(rho: Tensor<B, D>) -> Tensor<B, D> {
    rho.exp().log1p()
}

/// `KL(N(mu, sigma) || N(0, 1))` summed over every element.
pub fn kl_to_standard_normal<B: Backend, const D: usize>(
    mu: Tensor<B, D>,
    sigma: Tensor<B, D>,
) -> Tensor<B, 1> {
    let log_ratio = sigma.clone().log().neg();
    let spread = (sigma.powf_scalar(2.0) + mu.powf_scalar(2.0)).mul_scalar(0.5);
    (log_ratio + spread).sub_scalar(0.5).sum()
}

/// Random `+1` / `-1` signs.
fn rademacher<B: Backend, const D: usize>(shape: [usize; D], device: &B::Device) -> Tensor<B, D> {
    Tensor::random(shape, Distribution::Bernoulli(0.5), device)
        .mul_scalar(2.0)
        .sub_scalar(1.0)
}

fn layer_stats<B: Backend, const D: usize>(
    name: &str,
    mu: Tensor<B, D>,
    sigma: Tensor<B, D>,
) -> LayerWeightStats {
    let posterior_mean = tensor_to_vec(mu);
    let posterior_std = tensor_to_vec(sigma);
    let n = posterior_mean.len();
    LayerWeightStats {
        name: name.to_string(),
        prior_mean: vec![0.0; n],
        prior_std: vec![1.0; n],
        posterior_mean,
        posterior_std,
    }
}

/// Configuration for a Flipout 2D convolution.
#[derive(Config, Debug)]
pub struct FlipoutConv2dConfig {
    /// `[channels_in, channels_out]`.
    pub channels: [usize; 2],
    /// Square kernel side.
    pub kernel_size: usize,
    #[config(default = 1)]
    pub stride: usize,
    #[config(default = 1)]
    pub padding: usize,
    /// Std of the normal initializer for posterior means.
    #[config(default = 0.1)]
    pub mu_init_std: f64,
    /// Mean of the normal initializer for the untransformed posterior scale.
    #[config(default = -3.0)]
    pub rho_init: f64,
    /// Multiplier applied to the KL term, usually `1 / train_size`.
    #[config(default = 1.0)]
    pub kl_scale: f64,
}

/// 2D convolution with a Gaussian posterior over its kernel.
#[derive(Module, Debug)]
pub struct FlipoutConv2d<B: Backend> {
    /// Posterior mean, shape `(c_out, c_in, k, k)`.
    pub(crate) kernel_mu: Param<Tensor<B, 4>>,
    /// Untransformed posterior scale, same shape as `kernel_mu`.
    pub(crate) kernel_rho: Param<Tensor<B, 4>>,
    bias: Param<Tensor<B, 1>>,
    stride: usize,
    padding: usize,
    kl_scale: f64,
}

impl FlipoutConv2dConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> FlipoutConv2d<B> {
        let [c_in, c_out] = self.channels;
        let shape = [c_out, c_in, self.kernel_size, self.kernel_size];
        FlipoutConv2d {
            kernel_mu: Param::from_tensor(Tensor::random(
                shape,
                Distribution::Normal(0.0, self.mu_init_std),
                device,
            )),
            kernel_rho: Param::from_tensor(Tensor::random(
                shape,
                Distribution::Normal(self.rho_init, 0.1),
                device,
            )),
            bias: Param::from_tensor(Tensor::zeros([c_out], device)),
            stride: self.stride,
            padding: self.padding,
            kl_scale: self.kl_scale,
        }
    }
}

impl<B: Backend> FlipoutConv2d<B> {
    fn options(&self) -> ConvOptions<2> {
        ConvOptions::new(
            [self.stride, self.stride],
            [self.padding, self.padding],
            [1, 1],
            1,
        )
    }

    pub fn posterior_std(&self) -> Tensor<B, 4> {
        softplus(self.kernel_rho.val())
    }

    /// Stochastic forward pass: `(batch, c_in, h, w)` to `(batch, c_out, h', w')`.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let device = input.device();
        let [batch, c_in, _, _] = input.dims();
        let mu = self.kernel_mu.val();
        let c_out = mu.dims()[0];

        let mean = conv2d(input.clone(), mu.clone(), Some(self.bias.val()), self.options());

        let eps = Tensor::random(mu.dims(), Distribution::Normal(0.0, 1.0), &device);
        let delta = self.posterior_std() * eps;
        let sign_in = rademacher::<B, 4>([batch, c_in, 1, 1], &device);
        let sign_out = rademacher::<B, 4>([batch, c_out, 1, 1], &device);
        let perturbation = conv2d(input * sign_in, delta, None, self.options()) * sign_out;

        mean + perturbation
    }

    /// Scaled KL divergence of the kernel posterior from the prior.
    pub fn kl_divergence(&self) -> Tensor<B, 1> {
        kl_to_standard_normal(self.kernel_mu.val(), self.posterior_std()).mul_scalar(self.kl_scale)
    }

    pub fn weight_stats(&self, name: &str) -> LayerWeightStats {
        layer_stats(name, self.kernel_mu.val(), self.posterior_std())
    }
}

/// Configuration for a Flipout dense layer.
#[derive(Config, Debug)]
pub struct FlipoutLinearConfig {
    pub d_input: usize,
    pub d_output: usize,
    #[config(default = 0.1)]
    pub mu_init_std: f64,
    #[config(default = -3.0)]
    pub rho_init: f64,
    #[config(default = 1.0)]
    pub kl_scale: f64,
}

/// Dense layer with a Gaussian posterior over its kernel.
#[derive(Module, Debug)]
pub struct FlipoutLinear<B: Backend> {
    /// Posterior mean, shape `(d_input, d_output)`.
    pub(crate) kernel_mu: Param<Tensor<B, 2>>,
    pub(crate) kernel_rho: Param<Tensor<B, 2>>,
    bias: Param<Tensor<B, 1>>,
    kl_scale: f64,
}

impl FlipoutLinearConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> FlipoutLinear<B> {
        let shape = [self.d_input, self.d_output];
        FlipoutLinear {
            kernel_mu: Param::from_tensor(Tensor::random(
                shape,
                Distribution::Normal(0.0, self.mu_init_std),
                device,
            )),
            kernel_rho: Param::from_tensor(Tensor::random(
                shape,
                Distribution::Normal(self.rho_init, 0.1),
                device,
            )),
            bias: Param::from_tensor(Tensor::zeros([self.d_output], device)),
            kl_scale: self.kl_scale,
        }
    }
}

impl<B: Backend> FlipoutLinear<B> {
    pub fn posterior_std(&self) -> Tensor<B, 2> {
        softplus(self.kernel_rho.val())
    }

    /// Stochastic forward pass: `(batch, d_input)` to `(batch, d_output)`.
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let device = input.device();
        let [batch, d_input] = input.dims();
        let mu = self.kernel_mu.val();
        let d_output = mu.dims()[1];

        let mean = input.clone().matmul(mu.clone()) + self.bias.val().unsqueeze_dim::<2>(0);

        let eps = Tensor::random(mu.dims(), Distribution::Normal(0.0, 1.0), &device);
        let delta = self.posterior_std() * eps;
        let sign_in = rademacher::<B, 2>([batch, d_input], &device);
        let sign_out = rademacher::<B, 2>([batch, d_output], &device);
        let perturbation = (input * sign_in).matmul(delta) * sign_out;

        mean + perturbation
    }

    pub fn kl_divergence(&self) -> Tensor<B, 1> {
        kl_to_standard_normal(self.kernel_mu.val(), self.posterior_std()).mul_scalar(self.kl_scale)
    }

    pub fn weight_stats(&self, name: &str) -> LayerWeightStats {
        layer_stats(name, self.kernel_mu.val(), self.posterior_std())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::backend::Autodiff;
    use burn::optim::GradientsParams;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    /// `rho` such that `softplus(rho) == 1`.
    const UNIT_RHO: f64 = 0.541_324_854_612_918;

    #[test]
    fn test_kl_zero_when_posterior_equals_prior() {
        let device = Default::default();
        let mut layer = FlipoutConv2dConfig::new([2, 3], 3).init::<TestBackend>(&device);
        layer.kernel_mu = Param::from_tensor(Tensor::zeros([3, 2, 3, 3], &device));
        layer.kernel_rho =
            Param::from_tensor(Tensor::ones([3, 2, 3, 3], &device).mul_scalar(UNIT_RHO));

        let kl: f32 = layer.kl_divergence().into_scalar().elem();
        assert!(kl.abs() < 1e-4, "KL should vanish, got {kl}");
    }

    #[test]
    fn test_kl_matches_closed_form() {
        let device = Default::default();
        let mut layer = FlipoutLinearConfig::new(1, 1)
            .with_kl_scale(0.5)
            .init::<TestBackend>(&device);
        layer.kernel_mu = Param::from_tensor(Tensor::ones([1, 1], &device));
        layer.kernel_rho =
            Param::from_tensor(Tensor::ones([1, 1], &device).mul_scalar(UNIT_RHO));

        // KL(N(1, 1) || N(0, 1)) = 1/2, scaled by 0.5
        let kl: f32 = layer.kl_divergence().into_scalar().elem();
        assert!((kl - 0.25).abs() < 1e-4, "got {kl}");
    }

    #[test]
    fn test_conv_forward_shape_and_stochasticity() {
        let device = Default::default();
        let layer = FlipoutConv2dConfig::new([1, 4], 3)
            .with_rho_init(0.0)
            .init::<TestBackend>(&device);
        let input =
            Tensor::<TestBackend, 4>::random([2, 1, 6, 6], Distribution::Normal(0.0, 1.0), &device);

        let a = layer.forward(input.clone());
        let b = layer.forward(input);
        assert_eq!(a.dims(), [2, 4, 6, 6]);

        let diff: f32 = (a - b).abs().max().into_scalar().elem();
        assert!(diff > 1e-4, "two samples should differ");
    }

    #[test]
    fn test_linear_forward_near_mean_with_tiny_scale() {
        let device = Default::default();
        let layer = FlipoutLinearConfig::new(4, 2)
            .with_rho_init(-30.0)
            .init::<TestBackend>(&device);
        let input = Tensor::<TestBackend, 2>::ones([3, 4], &device);

        let sampled = layer.forward(input.clone());
        let mean = input.matmul(layer.kernel_mu.val());
        let diff: f32 = (sampled - mean).abs().max().into_scalar().elem();
        assert!(diff < 1e-5, "got {diff}");
    }

    #[test]
    fn test_weight_stats_sizes() {
        let device = Default::default();
        let layer = FlipoutConv2dConfig::new([2, 3], 3).init::<TestBackend>(&device);
        let stats = layer.weight_stats("flipout_conv1");
        assert_eq!(stats.name, "flipout_conv1");
        assert_eq!(stats.posterior_mean.len(), 54);
        assert_eq!(stats.prior_std, vec![1.0; 54]);
        assert!(stats.posterior_std.iter().all(|&s| s > 0.0));
    }

    #[test]
    fn test_gradients_reach_mu_and_rho() {
        let device = Default::default();
        let layer = FlipoutLinearConfig::new(3, 2).init::<TestAutodiffBackend>(&device);
        let input =
            Tensor::<TestAutodiffBackend, 2>::random([4, 3], Distribution::Normal(0.0, 1.0), &device);
        let loss = layer.forward(input).sum() + layer.kl_divergence();

        let grads = GradientsParams::from_grads(loss.backward(), &layer);
        for id in [layer.kernel_mu.id, layer.kernel_rho.id] {
            let grad = grads
                .get::<NdArray<f32>, 2>(id)
                .expect("kernel parameter should have gradient");
            let total: f32 = grad.abs().sum().into_scalar().elem();
            assert!(total > 0.0);
        }
    }
}
