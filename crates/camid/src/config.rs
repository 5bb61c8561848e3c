//! TOML parameter loading for the camid CLI.
//!
//! Deserializes `configs/params.toml`, which has `[run]`, `[dataloader]`,
//! `[trainer]`, `[evaluate]`, `[log]` and `[mc]` sections, then merges CLI
//! overrides. Every field has a default, so an empty file is valid.

use std::fmt;
use std::path::{Path, PathBuf};

use bayes_cnn::training::{RunPaths, TrainerConfig, WeightPlotPaths};
use patches::{discover_classes, DataConfig};
use serde::Deserialize;

/// Which network family a run trains or evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    /// Deterministic CNN.
    Cnn,
    /// Independently trained deterministic CNNs.
    Ensemble,
    /// Bayesian CNN with Flipout layers.
    Bnn,
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cnn => "cnn",
            Self::Ensemble => "ensemble",
            Self::Bnn => "bnn",
        })
    }
}

/// Top-level structure matching `configs/params.toml`.
#[derive(Debug, Default, Deserialize)]
pub struct Params {
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub dataloader: DataConfig,
    #[serde(default)]
    pub trainer: TrainerSection,
    #[serde(default)]
    pub evaluate: EvaluateSection,
    #[serde(default)]
    pub log: LogSection,
    #[serde(default)]
    pub mc: McSection,
}

#[derive(Debug, Deserialize)]
pub struct RunSection {
    /// Run name for scalar summaries. Defaults to the model type.
    #[serde(default)]
    pub name: Option<String>,
    /// Dataset name, used in checkpoint and result paths.
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_model_type")]
    pub model_type: ModelType,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            name: None,
            database: default_database(),
            model_type: default_model_type(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TrainerSection {
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_patience")]
    pub patience: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_num_ensemble")]
    pub num_ensemble: usize,
    #[serde(default = "default_max_to_keep")]
    pub max_to_keep: usize,
    #[serde(default = "default_focal_gamma")]
    pub focal_gamma: f64,
    #[serde(default = "default_focal_alpha")]
    pub focal_alpha: f64,
    #[serde(default = "default_acc_tolerance")]
    pub acc_tolerance: f64,
    /// Checkpoint root override. Defaults to `ckpts/{database}/{model_type}`.
    #[serde(default)]
    pub ckpt_dir: Option<PathBuf>,
}

impl Default for TrainerSection {
    fn default() -> Self {
        Self {
            lr: default_lr(),
            epochs: default_epochs(),
            patience: default_patience(),
            batch_size: default_batch_size(),
            num_ensemble: default_num_ensemble(),
            max_to_keep: default_max_to_keep(),
            focal_gamma: default_focal_gamma(),
            focal_alpha: default_focal_alpha(),
            acc_tolerance: default_acc_tolerance(),
            ckpt_dir: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct EvaluateSection {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for EvaluateSection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_log_step")]
    pub log_step: usize,
    #[serde(default = "default_summary_step")]
    pub summary_step: usize,
    #[serde(default = "default_summary_dir")]
    pub summary_dir: PathBuf,
    #[serde(default = "default_ckpt_root")]
    pub ckpt_root: PathBuf,
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            log_step: default_log_step(),
            summary_step: default_summary_step(),
            summary_dir: default_summary_dir(),
            ckpt_root: default_ckpt_root(),
            results_dir: default_results_dir(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct McSection {
    /// Monte-Carlo sample counts, one ROC curve per entry.
    #[serde(default = "default_num_monte_carlo")]
    pub num_monte_carlo: Vec<usize>,
    /// Treat lower uncertainty as out-of-distribution.
    #[serde(default)]
    pub inverse: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Examples shown in the held-out probability plot; 0 disables it.
    #[serde(default = "default_held_out_examples")]
    pub held_out_examples: usize,
}

impl Default for McSection {
    fn default() -> Self {
        Self {
            num_monte_carlo: default_num_monte_carlo(),
            inverse: false,
            batch_size: default_batch_size(),
            held_out_examples: default_held_out_examples(),
        }
    }
}

fn default_database() -> String {
    "dresden".to_string()
}
fn default_model_type() -> ModelType {
    ModelType::Bnn
}
fn default_lr() -> f64 {
    1e-4
}
fn default_epochs() -> usize {
    100
}
fn default_patience() -> usize {
    5
}
fn default_batch_size() -> usize {
    64
}
fn default_num_ensemble() -> usize {
    5
}
fn default_max_to_keep() -> usize {
    3
}
fn default_focal_gamma() -> f64 {
    2.0
}
fn default_focal_alpha() -> f64 {
    4.0
}
fn default_acc_tolerance() -> f64 {
    0.02
}
fn default_log_step() -> usize {
    100
}
fn default_summary_step() -> usize {
    150
}
fn default_summary_dir() -> PathBuf {
    PathBuf::from("summaries")
}
fn default_ckpt_root() -> PathBuf {
    PathBuf::from("ckpts")
}
fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}
fn default_num_monte_carlo() -> Vec<usize> {
    vec![5, 10, 20, 30, 40, 50]
}
fn default_held_out_examples() -> usize {
    8
}

/// Load and deserialize `Params` from a TOML file.
pub fn load_params(path: &Path) -> anyhow::Result<Params> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", path.display()))?;
    let params: Params = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("Failed to parse {}: {e}", path.display()))?;
    tracing::info!(path = %path.display(), "Loaded parameters");
    Ok(params)
}

impl Params {
    /// Apply CLI overrides. CLI values take priority over the TOML file.
    pub fn apply_overrides(
        &mut self,
        model_type: Option<ModelType>,
        epochs: Option<usize>,
        num_ensemble: Option<usize>,
    ) {
        if let Some(m) = model_type {
            self.run.model_type = m;
        }
        if let Some(e) = epochs {
            self.trainer.epochs = e;
        }
        if let Some(n) = num_ensemble {
            self.trainer.num_ensemble = n;
        }
    }

    /// Known camera models, discovered from the `train` split when unset.
    pub fn brand_models(&self) -> anyhow::Result<Vec<String>> {
        classes_or_discover(&self.dataloader.brand_models, &self.dataloader.patch_dir, "train")
    }

    pub fn unseen_models(&self) -> anyhow::Result<Vec<String>> {
        classes_or_discover(
            &self.dataloader.unseen_brand_models,
            &self.dataloader.unseen_dir,
            "test",
        )
    }

    pub fn kaggle_models(&self) -> anyhow::Result<Vec<String>> {
        classes_or_discover(&self.dataloader.kaggle_models, &self.dataloader.kaggle_dir, "test")
    }

    /// `{results_dir}/{database}/{model_type}`, the prefix of every result file.
    pub fn results_prefix(&self) -> PathBuf {
        self.log
            .results_dir
            .join(&self.run.database)
            .join(self.run.model_type.to_string())
    }

    /// `{results_prefix}{suffix}`, e.g. `results/dresden/bnn_mc_stats.png`.
    pub fn result_file(&self, suffix: &str) -> PathBuf {
        let mut name = self.results_prefix().into_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    pub fn ckpt_dir(&self) -> PathBuf {
        self.trainer.ckpt_dir.clone().unwrap_or_else(|| {
            self.log
                .ckpt_root
                .join(&self.run.database)
                .join(self.run.model_type.to_string())
        })
    }

    pub fn run_name(&self) -> String {
        self.run
            .name
            .clone()
            .unwrap_or_else(|| self.run.model_type.to_string())
    }

    /// Paths for a trainer; the log file is `{results_prefix}.log`.
    pub fn run_paths(&self) -> RunPaths {
        RunPaths {
            patch_dir: self.dataloader.patch_dir.clone(),
            ckpt_dir: self.ckpt_dir(),
            log_file: self.result_file(".log"),
            summary_dir: self.log.summary_dir.clone(),
            run_name: self.run_name(),
        }
    }

    pub fn weight_plots(&self) -> WeightPlotPaths {
        WeightPlotPaths::with_prefix(&self.results_prefix().to_string_lossy())
    }

    pub fn trainer_config(&self) -> TrainerConfig {
        TrainerConfig::new()
            .with_lr(self.trainer.lr)
            .with_epochs(self.trainer.epochs)
            .with_patience(self.trainer.patience)
            .with_batch_size(self.trainer.batch_size)
            .with_eval_batch_size(self.evaluate.batch_size)
            .with_log_step(self.log.log_step)
            .with_max_to_keep(self.trainer.max_to_keep)
            .with_summary_step(self.log.summary_step)
            .with_focal_gamma(self.trainer.focal_gamma)
            .with_focal_alpha(self.trainer.focal_alpha)
            .with_acc_tolerance(self.trainer.acc_tolerance)
    }
}

fn classes_or_discover(
    configured: &[String],
    root: &Path,
    split: &str,
) -> anyhow::Result<Vec<String>> {
    if !configured.is_empty() {
        return Ok(configured.to_vec());
    }
    let classes = discover_classes(root, split)?;
    anyhow::ensure!(
        !classes.is_empty(),
        "no class directories under {}",
        root.join(split).display()
    );
    Ok(classes)
}
