//! Shared trainer state and the train / validate / early-stop loop.
//!
//! Vanilla and Bayesian trainers differ only in their [`Objective`] and
//! [`EarlyStopping`] policy; both drive [`BaseTrainer::fit`].

use std::path::PathBuf;

use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use patches::{Batch, BatchSource};

use crate::model::bridge::{
    argmax_rows, batch_to_images, batch_to_targets, tensor_to_f64, tensor_to_vec, Targets,
};
use crate::model::Classifier;
use crate::training::checkpoint::{CheckpointManager, CheckpointMeta};
use crate::training::log::{progress_bar, RunLog, SummaryWriters};
use crate::training::loss::{cross_entropy_loss, focal_loss};
use crate::training::metrics::{percent, CategoricalAccuracy, ClassCounts, Mean};

/// Initial best loss before any validation pass.
pub const INITIAL_BEST_LOSS: f64 = 10_000.0;

/// Configuration for the training loop.
#[derive(Config, Debug)]
pub struct TrainerConfig {
    /// Adam learning rate.
    #[config(default = 1e-4)]
    pub lr: f64,
    /// Maximum number of epochs.
    #[config(default = 100)]
    pub epochs: usize,
    /// Consecutive rejected epochs before stopping.
    #[config(default = 5)]
    pub patience: usize,
    /// Batch size for train and validation.
    #[config(default = 64)]
    pub batch_size: usize,
    /// Batch size for test evaluation.
    #[config(default = 64)]
    pub eval_batch_size: usize,
    /// Steps between progress log lines.
    #[config(default = 100)]
    pub log_step: usize,
    /// Checkpoints retained on disk.
    #[config(default = 3)]
    pub max_to_keep: usize,
    /// Steps between constrained-convolution weight/gradient summaries.
    #[config(default = 150)]
    pub summary_step: usize,
    /// Focal loss focusing parameter.
    #[config(default = 2.0)]
    pub focal_gamma: f64,
    /// Focal loss scale.
    #[config(default = 4.0)]
    pub focal_alpha: f64,
    /// Accuracy regression tolerated by the Bayesian acceptance rule.
    #[config(default = 0.02)]
    pub acc_tolerance: f64,
}

/// Filesystem locations for one training run.
#[derive(Debug, Clone)]
pub struct RunPaths {
    /// Root holding `{train,val,test}/{class}/*` patches.
    pub patch_dir: PathBuf,
    pub ckpt_dir: PathBuf,
    pub log_file: PathBuf,
    /// Root for scalar summaries (`{summary_dir}/{run_name}/{timestamp}/{train,val}`).
    pub summary_dir: PathBuf,
    pub run_name: String,
}

/// Training objective.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Objective {
    /// Categorical cross-entropy from logits.
    CrossEntropy,
    /// Focal loss plus the model's KL regularization.
    FocalWithKl { gamma: f64, alpha: f64 },
}

/// Loss tensor plus its logged components.
pub struct LossParts<B: Backend> {
    pub total: Tensor<B, 1>,
    pub nll: f64,
    pub kl: f64,
}

impl Objective {
    pub fn compute<B: Backend, M: Classifier<B>>(
        &self,
        model: &M,
        logits: Tensor<B, 2>,
        targets: Targets<B>,
    ) -> LossParts<B> {
        match *self {
            Objective::CrossEntropy => {
                let total = cross_entropy_loss(logits, targets.indices);
                let nll = tensor_to_f64(total.clone());
                LossParts { total, nll, kl: 0.0 }
            }
            Objective::FocalWithKl { gamma, alpha } => {
                let nll_loss = focal_loss(logits, targets.one_hot, gamma, alpha);
                let nll = tensor_to_f64(nll_loss.clone());
                match model.kl_loss() {
                    Some(kl_loss) => {
                        let kl = tensor_to_f64(kl_loss.clone());
                        LossParts {
                            total: nll_loss + kl_loss,
                            nll,
                            kl,
                        }
                    }
                    None => LossParts {
                        total: nll_loss,
                        nll,
                        kl: 0.0,
                    },
                }
            }
        }
    }
}

/// Rule deciding whether a validation result replaces the best checkpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EarlyStopping {
    /// Accept iff the validation loss is strictly lower than the best.
    LossImprovement,
    /// Accept iff accuracy dropped by at most `tolerance` and the loss did
    /// not increase.
    AccuracyTolerance { tolerance: f64 },
}

impl EarlyStopping {
    pub fn accepts(&self, best_loss: f64, best_acc: f64, eval_loss: f64, eval_acc: f64) -> bool {
        match *self {
            EarlyStopping::LossImprovement => eval_loss < best_loss,
            EarlyStopping::AccuracyTolerance { tolerance } => {
                best_acc - eval_acc <= tolerance && eval_loss <= best_loss
            }
        }
    }
}

/// Outcome of the early-stopping check after one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochDecision {
    /// New best; save a checkpoint.
    Improved,
    /// Rejected, keep training.
    Rejected,
    /// Rejected `patience` times in a row.
    Stop,
}

/// Result of a completed `fit`.
#[derive(Debug, Clone, PartialEq)]
pub struct FitSummary {
    pub epochs_run: usize,
    pub best_loss: f64,
    pub best_acc: f64,
    pub checkpoints_saved: usize,
}

/// Result of an evaluation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalReport {
    pub loss: f64,
    pub accuracy: f64,
    pub counts: ClassCounts,
}

/// State shared by every trainer: metrics, best-model tracking, step
/// counters, summaries, run log, and the checkpoint manager.
pub struct BaseTrainer {
    pub config: TrainerConfig,
    pub paths: RunPaths,
    pub class_names: Vec<String>,
    pub train_loss: Mean,
    pub train_acc: CategoricalAccuracy,
    pub eval_loss: Mean,
    pub eval_acc: CategoricalAccuracy,
    pub kl_loss: Mean,
    pub nll_loss: Mean,
    pub best_loss: f64,
    pub best_acc: f64,
    /// Global train step, `epoch * steps_per_epoch + step`.
    pub step_idx: usize,
    /// Epoch-level checkpoint counter, restored from the latest checkpoint.
    pub ckpt_step: usize,
    pub stop_count: usize,
    /// Write constrained-convolution summaries every `summary_step` steps.
    pub summarize_constrained_conv: bool,
    pub log: RunLog,
    pub checkpoints: CheckpointManager,
    summaries: Option<SummaryWriters>,
}

impl BaseTrainer {
    pub fn new(config: TrainerConfig, paths: RunPaths, class_names: Vec<String>) -> anyhow::Result<Self> {
        anyhow::ensure!(!class_names.is_empty(), "at least one class is required");
        let log = RunLog::open(&paths.log_file)?;
        let checkpoints = CheckpointManager::new(&paths.ckpt_dir, config.max_to_keep)?;
        let best_acc = 1.0 / class_names.len() as f64;
        Ok(Self {
            config,
            paths,
            class_names,
            train_loss: Mean::default(),
            train_acc: CategoricalAccuracy::default(),
            eval_loss: Mean::default(),
            eval_acc: CategoricalAccuracy::default(),
            kl_loss: Mean::default(),
            nll_loss: Mean::default(),
            best_loss: INITIAL_BEST_LOSS,
            best_acc,
            step_idx: 0,
            ckpt_step: 1,
            stop_count: 0,
            summarize_constrained_conv: false,
            log,
            checkpoints,
            summaries: None,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// Batches needed to iterate `split` once.
    pub fn compute_steps(&self, split: &str, batch_size: usize) -> anyhow::Result<usize> {
        Ok(patches::compute_steps(
            &self.paths.patch_dir,
            split,
            &self.class_names,
            batch_size,
        )?)
    }

    /// Reset best-model tracking to random guessing and open the summary
    /// writers, recording the initial best values at step 0.
    pub fn init_summaries(&mut self) -> anyhow::Result<()> {
        self.best_acc = 1.0 / self.num_classes() as f64;
        self.best_loss = INITIAL_BEST_LOSS;
        self.step_idx = 0;
        self.stop_count = 0;

        let mut writers = SummaryWriters::create(&self.paths.summary_dir, &self.paths.run_name)?;
        writers.val.scalar("loss", self.best_loss, self.step_idx)?;
        writers.val.scalar("accuracy", self.best_acc, self.step_idx)?;
        writers.val.flush()?;
        self.summaries = Some(writers);
        Ok(())
    }

    fn log_restore(&mut self, restored: Option<&CheckpointMeta>) -> anyhow::Result<()> {
        let msg = match (restored, self.checkpoints.latest_checkpoint()) {
            (Some(_), Some(path)) => format!("\nRestored from {}\n", path.display()),
            _ => "\nInitializing from scratch.\n".to_string(),
        };
        self.log.write(&msg)
    }

    /// Restore model and optimizer from the latest checkpoint, or keep the
    /// fresh ones when there is none.
    pub fn restore_or_init<B, M, O>(
        &mut self,
        model: M,
        optimizer: O,
        device: &B::Device,
    ) -> anyhow::Result<(M, O)>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let (model, optimizer, meta) = self.checkpoints.restore(model, optimizer, device)?;
        self.ckpt_step = meta.as_ref().map_or(1, |m| m.step);
        self.log_restore(meta.as_ref())?;
        Ok((model, optimizer))
    }

    /// Restore only the model weights, for evaluation.
    pub fn restore_model<B: Backend, M: Module<B>>(
        &mut self,
        model: M,
        device: &B::Device,
    ) -> anyhow::Result<M> {
        let (model, meta) = self.checkpoints.restore_model(model, device)?;
        if let Some(meta) = meta.as_ref() {
            self.ckpt_step = meta.step;
        }
        self.log_restore(meta.as_ref())?;
        Ok(model)
    }

    pub fn reset_metrics(&mut self) {
        self.train_loss.reset();
        self.train_acc.reset();
        self.eval_loss.reset();
        self.eval_acc.reset();
        self.kl_loss.reset();
        self.nll_loss.reset();
    }

    /// Apply the early-stopping policy to this epoch's validation result.
    ///
    /// On acceptance the best values are updated and the stop counter reset.
    pub fn early_stopping(
        &mut self,
        policy: EarlyStopping,
        eval_loss: f64,
        eval_acc: f64,
    ) -> EpochDecision {
        if policy.accepts(self.best_loss, self.best_acc, eval_loss, eval_acc) {
            self.best_acc = eval_acc;
            self.best_loss = eval_loss;
            self.stop_count = 0;
            EpochDecision::Improved
        } else {
            self.stop_count += 1;
            if self.stop_count >= self.config.patience {
                EpochDecision::Stop
            } else {
                EpochDecision::Rejected
            }
        }
    }

    /// One optimization step on `batch`.
    pub fn train_step<B, M, O>(
        &mut self,
        model: M,
        optimizer: &mut O,
        objective: Objective,
        batch: &Batch,
        device: &B::Device,
    ) -> anyhow::Result<M>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B> + Classifier<B>,
        O: Optimizer<M, B>,
    {
        let images = batch_to_images::<B>(batch, device);
        let targets = batch_to_targets::<B>(&batch.labels, self.num_classes(), device);

        let logits = model.forward(images);
        let predictions = argmax_rows(logits.clone());
        let parts = objective.compute(&model, logits, targets);
        let loss = tensor_to_f64(parts.total.clone());

        let grads = GradientsParams::from_grads(parts.total.backward(), &model);

        let due = self.config.summary_step > 0 && self.step_idx % self.config.summary_step == 0;
        if self.summarize_constrained_conv && due {
            let conv = model.constrained_conv();
            let weight = tensor_to_vec(conv.constrained_weight());
            let grad = grads
                .get::<B::InnerBackend, 4>(conv.weight.id.clone())
                .map(tensor_to_vec)
                .unwrap_or_default();
            if let Some(writers) = self.summaries.as_mut() {
                writers.train.summary("constrained_conv_grad", &grad, self.step_idx)?;
                writers.train.summary("constrained_conv_weights", &weight, self.step_idx)?;
            }
        }

        let model = optimizer.step(self.config.lr, model, grads);

        self.train_loss.update(loss);
        self.train_acc.update(&predictions, &batch.labels);
        self.kl_loss.update(parts.kl);
        self.nll_loss.update(parts.nll);
        Ok(model)
    }

    /// Forward one batch without gradients, update eval metrics, and return
    /// per-class correct and total counts.
    pub fn eval_step<B: Backend, M: Classifier<B>>(
        &mut self,
        model: &M,
        objective: Objective,
        batch: &Batch,
        device: &B::Device,
    ) -> ClassCounts {
        let images = batch_to_images::<B>(batch, device);
        let targets = batch_to_targets::<B>(&batch.labels, self.num_classes(), device);
        let logits = model.forward(images);
        let predictions = argmax_rows(logits.clone());
        let parts = objective.compute(model, logits, targets);

        self.eval_loss.update(tensor_to_f64(parts.total));
        self.eval_acc.update(&predictions, &batch.labels);

        let mut counts = ClassCounts::new(self.num_classes());
        counts.update(&predictions, &batch.labels);
        counts
    }

    /// Run `num_steps` eval steps and sum the per-class counts.
    pub fn run_eval<B, M, S>(
        &mut self,
        model: &M,
        objective: Objective,
        source: &mut S,
        num_steps: usize,
        device: &B::Device,
    ) -> anyhow::Result<ClassCounts>
    where
        B: Backend,
        M: Classifier<B>,
        S: BatchSource + ?Sized,
    {
        let mut counts = ClassCounts::new(self.num_classes());
        let pb = progress_bar(num_steps, "eval");
        for _ in 0..num_steps {
            let batch = source.next_batch()?;
            counts.merge(&self.eval_step(model, objective, &batch, device));
            pb.inc(1);
        }
        pb.finish_and_clear();
        Ok(counts)
    }

    /// Write `{class} accuracy: {pct}` for every class.
    pub fn log_class_accuracy(&mut self, counts: &ClassCounts) -> anyhow::Result<()> {
        let lines: Vec<String> = self
            .class_names
            .iter()
            .enumerate()
            .map(|(i, name)| match counts.accuracy(i) {
                Some(acc) => format!("{name} accuracy: {}", percent(acc)),
                None => format!("{name} accuracy: n/a"),
            })
            .collect();
        for line in lines {
            self.log.write(&line)?;
        }
        Ok(())
    }

    fn write_train_scalars(&mut self, objective: Objective) -> anyhow::Result<()> {
        let step = self.step_idx;
        let (loss, acc, kl, nll) = (
            self.train_loss.result(),
            self.train_acc.result(),
            self.kl_loss.result(),
            self.nll_loss.result(),
        );
        if let Some(writers) = self.summaries.as_mut() {
            writers.train.scalar("loss", loss, step)?;
            writers.train.scalar("accuracy", acc, step)?;
            if matches!(objective, Objective::FocalWithKl { .. }) {
                writers.train.scalar("kl_loss", kl, step)?;
                writers.train.scalar("nll_loss", nll, step)?;
            }
        }
        Ok(())
    }

    fn progress_line(&self, objective: Objective, epoch: usize) -> String {
        match objective {
            Objective::CrossEntropy => format!(
                "Epoch: {epoch}, Step: {}, train loss: {:.3}, train accuracy: {}",
                self.step_idx,
                self.train_loss.result(),
                percent(self.train_acc.result()),
            ),
            Objective::FocalWithKl { .. } => format!(
                "Epoch: {epoch}, Step: {}, train loss: {:.3}, train accuracy: {}, kl loss: {:.3}, nll loss: {:.3}",
                self.step_idx + 1,
                self.train_loss.result(),
                percent(self.train_acc.result()),
                self.kl_loss.result(),
                self.nll_loss.result(),
            ),
        }
    }

    /// Train with early stopping and checkpoint the best epochs.
    ///
    /// Each epoch runs `num_train_steps` optimization steps and
    /// `num_val_steps` validation steps. Training stops after `epochs` or
    /// once `policy` rejects `patience` consecutive epochs.
    #[allow(clippy::too_many_arguments)]
    pub fn fit<B, M, O, S>(
        &mut self,
        model: M,
        optimizer: O,
        objective: Objective,
        policy: EarlyStopping,
        train: &mut S,
        val: &mut S,
        num_train_steps: usize,
        num_val_steps: usize,
        device: &B::Device,
    ) -> anyhow::Result<(M, FitSummary)>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B> + Classifier<B>,
        M::InnerModule: Classifier<B::InnerBackend>,
        O: Optimizer<M, B>,
        S: BatchSource + ?Sized,
    {
        self.log
            .write(&format!("Model parameters: {}", model.num_params()))?;
        self.init_summaries()?;
        let (mut model, mut optimizer) = self.restore_or_init(model, optimizer, device)?;

        let mut epochs_run = 0;
        let mut checkpoints_saved = 0;

        for epoch in 0..self.config.epochs {
            epochs_run += 1;
            let offset = epoch * num_train_steps;
            self.reset_metrics();

            let pb = progress_bar(num_train_steps, &format!("epoch {epoch}"));
            for step in 0..num_train_steps {
                self.step_idx = offset + step;
                let batch = train.next_batch()?;
                model = self.train_step(model, &mut optimizer, objective, &batch, device)?;
                self.write_train_scalars(objective)?;

                if self.config.log_step > 0 && (step + 1) % self.config.log_step == 0 {
                    let line = self.progress_line(objective, epoch);
                    self.log.write(&line)?;
                }
                pb.inc(1);
            }
            pb.finish_and_clear();

            let valid_model = model.valid();
            let counts = self.run_eval(&valid_model, objective, val, num_val_steps, device)?;
            let (eval_loss, eval_acc) = (self.eval_loss.result(), self.eval_acc.result());

            if let Some(writers) = self.summaries.as_mut() {
                writers.val.scalar("loss", eval_loss, self.step_idx)?;
                writers.val.scalar("accuracy", eval_acc, self.step_idx)?;
                writers.val.flush()?;
                writers.train.flush()?;
            }

            self.log.write(&format!(
                "val loss: {eval_loss:.3}, validation accuracy: {}",
                percent(eval_acc)
            ))?;
            self.log_class_accuracy(&counts)?;
            self.log.write("")?;

            self.ckpt_step += 1;
            match self.early_stopping(policy, eval_loss, eval_acc) {
                EpochDecision::Improved => {
                    let meta = CheckpointMeta::new(self.ckpt_step, self.best_loss, self.best_acc);
                    let path = self.checkpoints.save(&model, &optimizer, &meta)?;
                    checkpoints_saved += 1;
                    self.log.write(&format!(
                        "Saved checkpoint for epoch {epoch}: {}\n",
                        path.display()
                    ))?;
                }
                EpochDecision::Rejected => {}
                EpochDecision::Stop => {
                    tracing::info!(epoch, patience = self.config.patience, "Early stopping");
                    break;
                }
            }
        }

        self.log.write("\n... Finished training")?;
        Ok((
            model,
            FitSummary {
                epochs_run,
                best_loss: self.best_loss,
                best_acc: self.best_acc,
                checkpoints_saved,
            },
        ))
    }

    /// Evaluate an already-restored model over `num_steps` test batches.
    pub fn evaluate_loaded<B, M, S>(
        &mut self,
        model: &M,
        objective: Objective,
        test: &mut S,
        num_steps: usize,
        device: &B::Device,
    ) -> anyhow::Result<EvalReport>
    where
        B: Backend,
        M: Classifier<B>,
        S: BatchSource + ?Sized,
    {
        self.eval_loss.reset();
        self.eval_acc.reset();
        let counts = self.run_eval(model, objective, test, num_steps, device)?;
        let (loss, accuracy) = (self.eval_loss.result(), self.eval_acc.result());

        self.log.write(&format!(
            "\n\ntest loss: {loss:.3}, test accuracy: {}",
            percent(accuracy)
        ))?;
        self.log_class_accuracy(&counts)?;
        Ok(EvalReport {
            loss,
            accuracy,
            counts,
        })
    }

    /// Restore the latest checkpoint and evaluate it.
    pub fn evaluate<B, M, S>(
        &mut self,
        model: M,
        objective: Objective,
        test: &mut S,
        num_steps: usize,
        device: &B::Device,
    ) -> anyhow::Result<EvalReport>
    where
        B: Backend,
        M: Module<B> + Classifier<B>,
        S: BatchSource + ?Sized,
    {
        let model = self.restore_model(model, device)?;
        self.evaluate_loaded(&model, objective, test, num_steps, device)
    }
}
