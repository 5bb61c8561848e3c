//! Run log file and scalar summary writers.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};

/// Line-oriented run log. Every message is appended, flushed, and echoed
/// through `tracing`.
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    file: File,
}

impl RunLog {
    /// Open `path` for appending, creating parent directories as needed.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| anyhow::anyhow!("Failed to open log file {}: {e}", path.display()))?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line.
    pub fn write(&mut self, msg: &str) -> anyhow::Result<()> {
        let trimmed = msg.trim();
        if !trimmed.is_empty() {
            tracing::info!("{trimmed}");
        }
        writeln!(self.file, "{msg}")?;
        self.file.flush()?;
        Ok(())
    }
}

/// Append-only `step,tag,value` CSV of scalar summaries.
pub struct ScalarWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl ScalarWriter {
    /// Create `{dir}/scalars.csv` with its header.
    pub fn create(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("scalars.csv");
        let mut out = BufWriter::new(File::create(&path)?);
        writeln!(out, "step,tag,value")?;
        Ok(Self { path, out })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn scalar(&mut self, tag: &str, value: f64, step: usize) -> anyhow::Result<()> {
        writeln!(self.out, "{step},{tag},{value}")?;
        Ok(())
    }

    /// Write mean, std, min, and max of `values` under `{tag}/...`.
    pub fn summary(&mut self, tag: &str, values: &[f32], step: usize) -> anyhow::Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let n = values.len() as f64;
        let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
        let var = values.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
        let min = values.iter().cloned().fold(f32::INFINITY, f32::min) as f64;
        let max = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max) as f64;

        self.scalar(&format!("{tag}/mean"), mean, step)?;
        self.scalar(&format!("{tag}/std"), var.sqrt(), step)?;
        self.scalar(&format!("{tag}/min"), min, step)?;
        self.scalar(&format!("{tag}/max"), max, step)?;
        Ok(())
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// Train and validation writers under `{root}/{run_name}/{timestamp}/`.
pub struct SummaryWriters {
    pub train: ScalarWriter,
    pub val: ScalarWriter,
}

impl SummaryWriters {
    pub fn create(root: &Path, run_name: &str) -> anyhow::Result<Self> {
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S").to_string();
        let base = root.join(run_name).join(stamp);
        Ok(Self {
            train: ScalarWriter::create(&base.join("train"))?,
            val: ScalarWriter::create(&base.join("val"))?,
        })
    }
}

/// Progress bar over `len` steps.
pub fn progress_bar(len: usize, msg: &str) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    pb.set_style(style);
    pb.set_message(msg.to_string());
    pb
}
