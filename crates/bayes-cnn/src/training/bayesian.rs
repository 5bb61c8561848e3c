//! Trainer for the Bayesian CNN: focal loss plus scaled KL, a looser
//! acceptance rule, and weight-distribution plots.

use std::path::{Path, PathBuf};

use burn::module::AutodiffModule;
use burn::optim::AdamConfig;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use patches::{Batch, BatchSource};

use crate::model::bridge::batch_to_images;
use crate::model::{BayesianCnn, Classifier};
use crate::report::plots::{plot_held_out, plot_weight_posteriors};
use crate::training::base::{
    BaseTrainer, EarlyStopping, EvalReport, FitSummary, Objective, RunPaths, TrainerConfig,
};
use crate::uncertainty::{mc_softmax, McSamples};

/// Weight-distribution figures written around checkpoint restore.
#[derive(Debug, Clone)]
pub struct WeightPlotPaths {
    pub initialized_prior: PathBuf,
    pub initialized_posterior: PathBuf,
    pub trained_prior: PathBuf,
    pub trained_posterior: PathBuf,
}

impl WeightPlotPaths {
    /// `{prefix}_{initialized,trained}_{prior,posterior}.png`
    pub fn with_prefix(prefix: &str) -> Self {
        let path = |stage: &str, dist: &str| PathBuf::from(format!("{prefix}_{stage}_{dist}.png"));
        Self {
            initialized_prior: path("initialized", "prior"),
            initialized_posterior: path("initialized", "posterior"),
            trained_prior: path("trained", "prior"),
            trained_posterior: path("trained", "posterior"),
        }
    }
}

pub struct BayesianTrainer {
    pub base: BaseTrainer,
}

impl BayesianTrainer {
    pub fn new(
        config: TrainerConfig,
        paths: RunPaths,
        class_names: Vec<String>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            base: BaseTrainer::new(config, paths, class_names)?,
        })
    }

    pub fn objective(&self) -> Objective {
        Objective::FocalWithKl {
            gamma: self.base.config.focal_gamma,
            alpha: self.base.config.focal_alpha,
        }
    }

    pub fn policy(&self) -> EarlyStopping {
        EarlyStopping::AccuracyTolerance {
            tolerance: self.base.config.acc_tolerance,
        }
    }

    pub fn train<B, S>(
        &mut self,
        model: BayesianCnn<B>,
        train: &mut S,
        val: &mut S,
        device: &B::Device,
    ) -> anyhow::Result<(BayesianCnn<B>, FitSummary)>
    where
        B: AutodiffBackend,
        S: BatchSource + ?Sized,
    {
        let num_train_steps = self.base.compute_steps("train", self.base.config.batch_size)?;
        let num_val_steps = self.base.compute_steps("val", self.base.config.batch_size)?;
        tracing::info!(num_train_steps, num_val_steps, "Bayesian training");

        let optimizer = AdamConfig::new().init::<B, BayesianCnn<B>>();
        self.base
            .log
            .write("... Training bayesian convolutional neural network\n")?;
        let (objective, policy) = (self.objective(), self.policy());
        self.base.fit(
            model,
            optimizer,
            objective,
            policy,
            train,
            val,
            num_train_steps,
            num_val_steps,
            device,
        )
    }

    /// Plot the kernel prior and posterior of every Flipout layer.
    pub fn plot_weights<B: Backend>(
        &self,
        model: &BayesianCnn<B>,
        prior_png: &Path,
        posterior_png: &Path,
    ) -> anyhow::Result<()> {
        let stats = model.flipout_stats();
        let names: Vec<String> = stats.iter().map(|s| s.name.clone()).collect();
        let prior_means: Vec<Vec<f32>> = stats.iter().map(|s| s.prior_mean.clone()).collect();
        let prior_stds: Vec<Vec<f32>> = stats.iter().map(|s| s.prior_std.clone()).collect();
        let post_means: Vec<Vec<f32>> = stats.iter().map(|s| s.posterior_mean.clone()).collect();
        let post_stds: Vec<Vec<f32>> = stats.iter().map(|s| s.posterior_std.clone()).collect();

        plot_weight_posteriors(prior_png, &names, &prior_means, &prior_stds)?;
        plot_weight_posteriors(posterior_png, &names, &post_means, &post_stds)?;
        Ok(())
    }

    /// Plot weights before and after restoring the latest checkpoint, then
    /// evaluate on `test`.
    pub fn evaluate<B, S>(
        &mut self,
        model: BayesianCnn<B>,
        plots: &WeightPlotPaths,
        test: &mut S,
        device: &B::Device,
    ) -> anyhow::Result<EvalReport>
    where
        B: Backend,
        S: BatchSource + ?Sized,
    {
        let num_test_steps = self
            .base
            .compute_steps("test", self.base.config.eval_batch_size)?;
        self.plot_weights(&model, &plots.initialized_prior, &plots.initialized_posterior)?;
        let model = self.base.restore_model(model, device)?;
        self.plot_weights(&model, &plots.trained_prior, &plots.trained_posterior)?;
        let objective = self.objective();
        self.base
            .evaluate_loaded(&model, objective, test, num_test_steps, device)
    }
}

/// Sample `num_samples` forward passes over `batch` and plot per-example
/// class probabilities next to each input patch. Batch labels index
/// `true_names`.
pub fn held_out_samples<B, M>(
    model: &M,
    batch: &Batch,
    num_samples: usize,
    class_names: &[String],
    true_names: &[String],
    png: &Path,
    device: &B::Device,
) -> anyhow::Result<McSamples>
where
    B: Backend,
    M: Classifier<B>,
{
    let samples = mc_softmax(model, batch_to_images::<B>(batch, device), num_samples);
    plot_held_out(png, &samples, batch, class_names, true_names, batch.len())?;
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BayesianCnnConfig;
    use burn::backend::ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn trainer(tmp: &TempDir) -> BayesianTrainer {
        let paths = RunPaths {
            patch_dir: tmp.path().join("patches"),
            ckpt_dir: tmp.path().join("ckpts"),
            log_file: tmp.path().join("bnn.log"),
            summary_dir: tmp.path().join("summaries"),
            run_name: "bnn".to_string(),
        };
        BayesianTrainer::new(
            TrainerConfig::new(),
            paths,
            vec!["a".to_string(), "b".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn test_defaults_use_focal_and_tolerance() {
        let tmp = TempDir::new().unwrap();
        let t = trainer(&tmp);
        assert_eq!(
            t.objective(),
            Objective::FocalWithKl {
                gamma: 2.0,
                alpha: 4.0
            }
        );
        assert_eq!(t.policy(), EarlyStopping::AccuracyTolerance { tolerance: 0.02 });
    }

    #[test]
    fn test_plot_paths_from_prefix() {
        let plots = WeightPlotPaths::with_prefix("results/dresden/bnn");
        assert_eq!(
            plots.initialized_prior,
            PathBuf::from("results/dresden/bnn_initialized_prior.png")
        );
        assert_eq!(
            plots.trained_posterior,
            PathBuf::from("results/dresden/bnn_trained_posterior.png")
        );
    }

    #[test]
    fn test_plot_weights_writes_both_figures() {
        let tmp = TempDir::new().unwrap();
        let t = trainer(&tmp);
        let device = Default::default();
        let model = BayesianCnnConfig::new(2, 10)
            .with_conv1_channels(2)
            .with_conv2_channels(2)
            .init::<TestBackend>(&device);
        let prior = tmp.path().join("prior.png");
        let posterior = tmp.path().join("posterior.png");
        t.plot_weights(&model, &prior, &posterior).unwrap();
        assert!(prior.exists());
        assert!(posterior.exists());
    }

    #[test]
    fn test_held_out_samples_vary_without_a_trainer() {
        let tmp = TempDir::new().unwrap();
        let device = Default::default();
        let model = BayesianCnnConfig::new(2, 10)
            .with_conv1_channels(2)
            .with_conv2_channels(2)
            .with_rho_init(0.0)
            .init::<TestBackend>(&device);
        let batch = Batch {
            pixels: (0..2 * 64).map(|i| (i % 7) as f32 / 7.0).collect(),
            labels: vec![0, 1],
            image_size: 8,
        };
        let classes = vec!["a".to_string(), "b".to_string()];
        let png = tmp.path().join("held_out.png");
        let samples = held_out_samples(&model, &batch, 6, &classes, &classes, &png, &device).unwrap();
        assert_eq!(samples.num_samples, 6);
        assert!(png.exists());
        let spread = crate::uncertainty::epistemic_uncertainty(&samples);
        assert!(spread.iter().any(|&e| e > 0.0));
        // only the figure is written, no run log or checkpoint index
        let written: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(written.len(), 1);
    }
}
