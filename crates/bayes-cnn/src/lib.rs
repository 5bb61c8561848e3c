//! Camera-model identification with vanilla and Bayesian CNNs.
//!
//! - [`model`]: constrained convolution, Flipout layers, and the two
//!   classifiers behind the [`model::Classifier`] trait.
//! - [`training`]: vanilla, ensemble, and Bayesian trainers sharing one
//!   early-stopping loop with rotated checkpoints.
//! - [`uncertainty`]: Monte-Carlo predictive entropy and epistemic
//!   uncertainty per dataset slice.
//! - [`report`]: ROC/PR curves for in- vs out-of-distribution scores and
//!   PNG figures.

pub mod model;
pub mod report;
pub mod training;
pub mod uncertainty;

pub use model::{BayesianCnn, BayesianCnnConfig, Classifier, VanillaCnn, VanillaCnnConfig};
pub use report::{roc_pr_curves, RocResult};
pub use training::{
    BayesianTrainer, EnsembleTrainer, RunPaths, TrainerConfig, VanillaTrainer, WeightPlotPaths,
};
pub use uncertainty::{
    epistemic_uncertainty, log_mc_in_out, mc_in_stats, mc_out_stats, predictive_entropy, McStats,
};
