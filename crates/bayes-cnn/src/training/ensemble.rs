//! Independently initialized vanilla models, one checkpoint directory each.

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use patches::BatchSource;

use crate::model::VanillaCnnConfig;
use crate::training::base::{EvalReport, FitSummary, RunPaths, TrainerConfig};
use crate::training::vanilla::VanillaTrainer;

/// Trains `num_ensemble` vanilla CNNs, member `i` under `{ckpt_dir}/{i}`.
///
/// Members are independent; predictions are not aggregated here.
pub struct EnsembleTrainer {
    pub config: TrainerConfig,
    pub paths: RunPaths,
    pub class_names: Vec<String>,
    pub model_config: VanillaCnnConfig,
    pub num_ensemble: usize,
}

impl EnsembleTrainer {
    pub fn new(
        config: TrainerConfig,
        paths: RunPaths,
        class_names: Vec<String>,
        model_config: VanillaCnnConfig,
        num_ensemble: usize,
    ) -> Self {
        Self {
            config,
            paths,
            class_names,
            model_config,
            num_ensemble,
        }
    }

    /// Paths for one member: the checkpoint directory gains an index suffix.
    pub fn member_paths(&self, index: usize) -> RunPaths {
        let mut paths = self.paths.clone();
        paths.ckpt_dir = self.paths.ckpt_dir.join(index.to_string());
        paths
    }

    fn member(&self, index: usize) -> anyhow::Result<VanillaTrainer> {
        let paths = self.member_paths(index);
        tracing::info!(member = index, ckpt_dir = %paths.ckpt_dir.display(), "Ensemble member");
        VanillaTrainer::new(self.config.clone(), paths, self.class_names.clone())
    }

    /// Train every member from a freshly initialized model.
    pub fn train<B, S>(
        &self,
        train: &mut S,
        val: &mut S,
        device: &B::Device,
    ) -> anyhow::Result<Vec<FitSummary>>
    where
        B: AutodiffBackend,
        S: BatchSource + ?Sized,
    {
        let mut summaries = Vec::with_capacity(self.num_ensemble);
        for index in 0..self.num_ensemble {
            let mut trainer = self.member(index)?;
            let model = self.model_config.init::<B>(device);
            let (_, summary) = trainer.train(model, train, val, device)?;
            summaries.push(summary);
        }
        Ok(summaries)
    }

    /// Evaluate every member's latest checkpoint.
    pub fn evaluate<B, S>(&self, test: &mut S, device: &B::Device) -> anyhow::Result<Vec<EvalReport>>
    where
        B: Backend,
        S: BatchSource + ?Sized,
    {
        let mut reports = Vec::with_capacity(self.num_ensemble);
        for index in 0..self.num_ensemble {
            let mut trainer = self.member(index)?;
            let model = self.model_config.init::<B>(device);
            reports.push(trainer.evaluate(model, test, device)?);
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_member_paths_are_indexed() {
        let paths = RunPaths {
            patch_dir: PathBuf::from("data/patches"),
            ckpt_dir: PathBuf::from("ckpts/dresden/ensemble"),
            log_file: PathBuf::from("results/ensemble.log"),
            summary_dir: PathBuf::from("summaries"),
            run_name: "ensemble".to_string(),
        };
        let ensemble = EnsembleTrainer::new(
            TrainerConfig::new(),
            paths,
            vec!["a".to_string()],
            VanillaCnnConfig::new(1),
            3,
        );
        assert_eq!(
            ensemble.member_paths(2).ckpt_dir,
            PathBuf::from("ckpts/dresden/ensemble/2")
        );
        assert_eq!(ensemble.member_paths(0).log_file, PathBuf::from("results/ensemble.log"));
    }
}
