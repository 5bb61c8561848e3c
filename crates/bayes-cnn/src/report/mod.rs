//! ROC/PR computation and PNG figures.

pub mod plots;
pub mod roc;

pub use plots::{plot_held_out, plot_weight_posteriors, roc_grid, RocPanel};
pub use roc::{detection_accuracy, roc_pr_curves, RocResult};
