//! Training pipeline: losses, metrics, run logging, checkpoint rotation,
//! the shared train/validate loop, and the vanilla, ensemble, and Bayesian
//! trainers built on it.

pub mod base;
pub mod bayesian;
pub mod checkpoint;
pub mod ensemble;
pub mod log;
pub mod loss;
pub mod metrics;
pub mod vanilla;

pub use base::{
    BaseTrainer, EarlyStopping, EpochDecision, EvalReport, FitSummary, LossParts, Objective,
    RunPaths, TrainerConfig, INITIAL_BEST_LOSS,
};
pub use bayesian::{held_out_samples, BayesianTrainer, WeightPlotPaths};
pub use checkpoint::{CheckpointManager, CheckpointMeta};
pub use ensemble::EnsembleTrainer;
pub use log::{progress_bar, RunLog, ScalarWriter, SummaryWriters};
pub use loss::{cross_entropy_loss, focal_loss};
pub use metrics::{percent, CategoricalAccuracy, ClassCounts, Mean};
pub use vanilla::VanillaTrainer;
