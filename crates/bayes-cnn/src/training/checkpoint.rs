//! Checkpoint directory management with rotation.
//!
//! Layout under the checkpoint directory:
//!
//! ```text
//! {dir}/checkpoint          JSON index of retained steps, oldest first
//! {dir}/ckpt-{step}/model.mpk
//! {dir}/ckpt-{step}/optimizer.mpk
//! {dir}/ckpt-{step}/meta.json
//! ```

use std::path::{Path, PathBuf};

use burn::module::{AutodiffModule, Module};
use burn::optim::Optimizer;
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};

const INDEX_FILE: &str = "checkpoint";

/// Metadata saved alongside each checkpoint for restoring training state.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CheckpointMeta {
    /// Epoch-level step counter; starts at 1 and grows by one per epoch.
    pub step: usize,
    pub best_loss: f64,
    pub best_acc: f64,
    /// RFC 3339 time of the save.
    pub timestamp: String,
}

impl CheckpointMeta {
    pub fn new(step: usize, best_loss: f64, best_acc: f64) -> Self {
        Self {
            step,
            best_loss,
            best_acc,
            timestamp: chrono::Local::now().to_rfc3339(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct CheckpointIndex {
    retained: Vec<usize>,
}

/// Saves, restores, and rotates checkpoints in one directory.
#[derive(Debug)]
pub struct CheckpointManager {
    dir: PathBuf,
    max_to_keep: usize,
    retained: Vec<usize>,
}

impl CheckpointManager {
    /// Open a checkpoint directory, reading its index if one exists.
    ///
    /// The directory is not created until the first save.
    pub fn new(dir: impl Into<PathBuf>, max_to_keep: usize) -> anyhow::Result<Self> {
        let dir = dir.into();
        let index_path = dir.join(INDEX_FILE);
        let index: CheckpointIndex = if index_path.exists() {
            let file = std::fs::File::open(&index_path).map_err(|e| {
                anyhow::anyhow!("Failed to open {}: {e}", index_path.display())
            })?;
            serde_json::from_reader(file).map_err(|e| {
                anyhow::anyhow!("Failed to parse {}: {e}", index_path.display())
            })?
        } else {
            CheckpointIndex::default()
        };

        // ignore index entries whose directory was removed by hand
        let retained = index
            .retained
            .into_iter()
            .filter(|&step| Self::step_dir_in(&dir, step).is_dir())
            .collect();

        Ok(Self {
            dir,
            max_to_keep: max_to_keep.max(1),
            retained,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Retained checkpoint steps, oldest first.
    pub fn retained(&self) -> &[usize] {
        &self.retained
    }

    fn step_dir_in(dir: &Path, step: usize) -> PathBuf {
        dir.join(format!("ckpt-{step}"))
    }

    pub fn step_dir(&self, step: usize) -> PathBuf {
        Self::step_dir_in(&self.dir, step)
    }

    /// Directory of the most recent checkpoint, if any.
    pub fn latest_checkpoint(&self) -> Option<PathBuf> {
        self.retained.last().map(|&step| self.step_dir(step))
    }

    fn read_meta(step_dir: &Path) -> anyhow::Result<CheckpointMeta> {
        let meta_path = step_dir.join("meta.json");
        serde_json::from_reader(
            std::fs::File::open(&meta_path)
                .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", meta_path.display()))?,
        )
        .map_err(|e| anyhow::anyhow!("Failed to parse {}: {e}", meta_path.display()))
    }

    fn write_index(&self) -> anyhow::Result<()> {
        let index = CheckpointIndex {
            retained: self.retained.clone(),
        };
        serde_json::to_writer_pretty(std::fs::File::create(self.dir.join(INDEX_FILE))?, &index)?;
        Ok(())
    }

    /// Save model, optimizer, and metadata as `ckpt-{meta.step}`, then drop
    /// the oldest checkpoints beyond `max_to_keep`.
    pub fn save<B, M, O>(
        &mut self,
        model: &M,
        optimizer: &O,
        meta: &CheckpointMeta,
    ) -> anyhow::Result<PathBuf>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let step = meta.step;
        let step_dir = self.step_dir(step);
        std::fs::create_dir_all(&step_dir)?;
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();

        model
            .clone()
            .save_file(step_dir.join("model"), &recorder)
            .map_err(|e| anyhow::anyhow!("Failed to save model at step {step}: {e}"))?;

        Recorder::<B>::record(&recorder, optimizer.to_record(), step_dir.join("optimizer"))
            .map_err(|e| anyhow::anyhow!("Failed to save optimizer at step {step}: {e}"))?;

        serde_json::to_writer_pretty(std::fs::File::create(step_dir.join("meta.json"))?, meta)?;

        self.retained.retain(|&s| s != step);
        self.retained.push(step);
        while self.retained.len() > self.max_to_keep {
            let oldest = self.retained.remove(0);
            let old_dir = self.step_dir(oldest);
            if old_dir.exists() {
                std::fs::remove_dir_all(&old_dir).map_err(|e| {
                    anyhow::anyhow!("Failed to remove {}: {e}", old_dir.display())
                })?;
            }
            tracing::debug!(step = oldest, "Rotated out old checkpoint");
        }
        self.write_index()?;

        tracing::info!(step, dir = %step_dir.display(), "Checkpoint saved (model + optimizer + meta)");
        Ok(step_dir)
    }

    /// Restore model, optimizer, and metadata from the latest checkpoint.
    ///
    /// When the directory holds no checkpoint the inputs come back unchanged
    /// with `None` metadata.
    pub fn restore<B, M, O>(
        &self,
        model: M,
        optimizer: O,
        device: &B::Device,
    ) -> anyhow::Result<(M, O, Option<CheckpointMeta>)>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let Some(step_dir) = self.latest_checkpoint() else {
            return Ok((model, optimizer, None));
        };
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();

        let model = model
            .load_file(step_dir.join("model"), &recorder, device)
            .map_err(|e| anyhow::anyhow!("Failed to load model from {}: {e}", step_dir.display()))?;
        let optim_record =
            Recorder::<B>::load::<O::Record>(&recorder, step_dir.join("optimizer"), device)
                .map_err(|e| {
                    anyhow::anyhow!("Failed to load optimizer from {}: {e}", step_dir.display())
                })?;
        let optimizer = optimizer.load_record(optim_record);
        let meta = Self::read_meta(&step_dir)?;

        Ok((model, optimizer, Some(meta)))
    }

    /// Restore only the model weights from the latest checkpoint.
    pub fn restore_model<B, M>(
        &self,
        model: M,
        device: &B::Device,
    ) -> anyhow::Result<(M, Option<CheckpointMeta>)>
    where
        B: Backend,
        M: Module<B>,
    {
        let Some(step_dir) = self.latest_checkpoint() else {
            return Ok((model, None));
        };
        let model = model
            .load_file(
                step_dir.join("model"),
                &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
                device,
            )
            .map_err(|e| anyhow::anyhow!("Failed to load model from {}: {e}", step_dir.display()))?;
        let meta = Self::read_meta(&step_dir)?;
        Ok((model, Some(meta)))
    }
}
