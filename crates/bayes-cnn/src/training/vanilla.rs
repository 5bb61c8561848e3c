//! Trainer for the deterministic baseline CNN.

use burn::module::AutodiffModule;
use burn::optim::AdamConfig;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use patches::BatchSource;

use crate::model::Classifier;
use crate::training::base::{
    BaseTrainer, EarlyStopping, EvalReport, FitSummary, Objective, RunPaths, TrainerConfig,
};

/// Cross-entropy training with plain loss-improvement early stopping.
pub struct VanillaTrainer {
    pub base: BaseTrainer,
}

impl VanillaTrainer {
    pub fn new(
        config: TrainerConfig,
        paths: RunPaths,
        class_names: Vec<String>,
    ) -> anyhow::Result<Self> {
        let mut base = BaseTrainer::new(config, paths, class_names)?;
        base.summarize_constrained_conv = true;
        Ok(Self { base })
    }

    /// Train `model` on the `train` split, validating on `val` every epoch.
    pub fn train<B, M, S>(
        &mut self,
        model: M,
        train: &mut S,
        val: &mut S,
        device: &B::Device,
    ) -> anyhow::Result<(M, FitSummary)>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B> + Classifier<B>,
        M::InnerModule: Classifier<B::InnerBackend>,
        S: BatchSource + ?Sized,
    {
        let num_train_steps = self.base.compute_steps("train", self.base.config.batch_size)?;
        let num_val_steps = self.base.compute_steps("val", self.base.config.batch_size)?;
        tracing::info!(num_train_steps, num_val_steps, "Vanilla training");

        let optimizer = AdamConfig::new().init::<B, M>();
        self.base
            .log
            .write("... Training convolutional neural network\n")?;
        self.base.fit(
            model,
            optimizer,
            Objective::CrossEntropy,
            EarlyStopping::LossImprovement,
            train,
            val,
            num_train_steps,
            num_val_steps,
            device,
        )
    }

    /// Restore the latest checkpoint into `model` and evaluate on `test`.
    pub fn evaluate<B, M, S>(
        &mut self,
        model: M,
        test: &mut S,
        device: &B::Device,
    ) -> anyhow::Result<EvalReport>
    where
        B: Backend,
        M: Module<B> + Classifier<B>,
        S: BatchSource + ?Sized,
    {
        let num_test_steps = self
            .base
            .compute_steps("test", self.base.config.eval_batch_size)?;
        self.base
            .evaluate(model, Objective::CrossEntropy, test, num_test_steps, device)
    }
}
