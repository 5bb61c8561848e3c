//! Run summaries written as JSON next to the run log.

use std::path::Path;

use bayes_cnn::report::RocResult;
use bayes_cnn::training::{EvalReport, FitSummary};
use serde::{Deserialize, Serialize};

/// Everything one CLI invocation produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// `train`, `evaluate` or `mc-stats`.
    pub command: String,
    pub database: String,
    pub model_type: String,
    /// RFC 3339 time the summary was written.
    pub timestamp: String,
    #[serde(default)]
    pub train: Vec<TrainResult>,
    #[serde(default)]
    pub eval: Vec<EvalResult>,
    #[serde(default)]
    pub mc: Vec<McResult>,
}

/// Outcome of training one model (one ensemble member).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainResult {
    pub member: Option<usize>,
    pub epochs_run: usize,
    pub best_loss: f64,
    pub best_acc: f64,
    pub checkpoints_saved: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassAccuracy {
    pub name: String,
    pub correct: usize,
    pub total: usize,
    /// `None` when the class never appeared.
    pub accuracy: Option<f64>,
}

/// Test-set result of one model (one ensemble member).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalResult {
    pub member: Option<usize>,
    pub loss: f64,
    pub accuracy: f64,
    pub per_class: Vec<ClassAccuracy>,
}

/// Optimal operating point of one in- vs out-of-distribution comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McResult {
    /// e.g. `entropy, unseen`.
    pub comparison: String,
    pub num_samples: usize,
    pub fpr: f64,
    pub tpr: f64,
    /// `None` when the optimal point is the `+inf` threshold.
    pub threshold: Option<f64>,
    pub acc: f64,
    pub auroc: f64,
    pub aupr: f64,
}

impl RunSummary {
    pub fn new(command: &str, database: &str, model_type: &str) -> Self {
        Self {
            command: command.to_string(),
            database: database.to_string(),
            model_type: model_type.to_string(),
            timestamp: chrono::Local::now().to_rfc3339(),
            train: Vec::new(),
            eval: Vec::new(),
            mc: Vec::new(),
        }
    }

    pub fn push_train(&mut self, member: Option<usize>, summary: &FitSummary) {
        self.train.push(TrainResult {
            member,
            epochs_run: summary.epochs_run,
            best_loss: summary.best_loss,
            best_acc: summary.best_acc,
            checkpoints_saved: summary.checkpoints_saved,
        });
    }

    pub fn push_eval(&mut self, member: Option<usize>, report: &EvalReport, class_names: &[String]) {
        let per_class = class_names
            .iter()
            .enumerate()
            .map(|(i, name)| ClassAccuracy {
                name: name.clone(),
                correct: report.counts.correct.get(i).copied().unwrap_or(0),
                total: report.counts.total.get(i).copied().unwrap_or(0),
                accuracy: report.counts.accuracy(i),
            })
            .collect();
        self.eval.push(EvalResult {
            member,
            loss: report.loss,
            accuracy: report.accuracy,
            per_class,
        });
    }

    pub fn push_mc(&mut self, comparison: &str, num_samples: usize, roc: &RocResult, acc: f64) {
        let (fpr, tpr, threshold) = roc.optimal;
        self.mc.push(McResult {
            comparison: comparison.to_string(),
            num_samples,
            fpr,
            tpr,
            threshold: threshold.is_finite().then_some(threshold),
            acc,
            auroc: roc.auroc,
            aupr: roc.aupr,
        });
    }

    /// Write pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)
            .map_err(|e| anyhow::anyhow!("Failed to create {}: {e}", path.display()))?;
        serde_json::to_writer_pretty(file, self)?;
        tracing::info!(path = %path.display(), "Wrote run summary");
        Ok(())
    }
}
