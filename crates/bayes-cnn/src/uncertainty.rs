//! Monte-Carlo uncertainty from repeated stochastic forward passes.
//!
//! A Bayesian model draws fresh Flipout perturbations on every forward call,
//! so `T` passes over the same batch give `T` softmax samples per example.
//! From those samples we compute:
//!
//! - predictive entropy `H = -sum_c pbar_c ln(pbar_c + 1e-12)`
//! - epistemic uncertainty `E = (1/T) sum_t sum_c (p_tc - pbar_c)^2`
//!
//! where `pbar` is the mean softmax across samples.

use burn::prelude::*;
use burn::tensor::activation::softmax;
use patches::BatchSource;

use crate::model::bridge::{batch_to_images, tensor_to_vec};
use crate::model::Classifier;
use crate::training::log::{progress_bar, RunLog};

const ENTROPY_EPS: f64 = 1e-12;

/// Softmax samples laid out `[sample][example][class]`.
#[derive(Debug, Clone, PartialEq)]
pub struct McSamples {
    pub num_samples: usize,
    pub batch_size: usize,
    pub num_classes: usize,
    probs: Vec<f32>,
}

impl McSamples {
    /// Wrap a flat buffer. Returns `None` if its length does not match.
    pub fn from_flat(
        num_samples: usize,
        batch_size: usize,
        num_classes: usize,
        probs: Vec<f32>,
    ) -> Option<Self> {
        (probs.len() == num_samples * batch_size * num_classes).then_some(Self {
            num_samples,
            batch_size,
            num_classes,
            probs,
        })
    }

    /// Probability of `class` for `example` in sample `t`.
    pub fn prob(&self, t: usize, example: usize, class: usize) -> f64 {
        self.probs[(t * self.batch_size + example) * self.num_classes + class] as f64
    }

    /// Softmax vector of `example` in sample `t`.
    pub fn sample(&self, t: usize, example: usize) -> &[f32] {
        let start = (t * self.batch_size + example) * self.num_classes;
        &self.probs[start..start + self.num_classes]
    }

    /// Mean softmax over samples, one row per example.
    pub fn mean_probs(&self) -> Vec<Vec<f64>> {
        let t = self.num_samples.max(1) as f64;
        (0..self.batch_size)
            .map(|b| {
                (0..self.num_classes)
                    .map(|c| (0..self.num_samples).map(|s| self.prob(s, b, c)).sum::<f64>() / t)
                    .collect()
            })
            .collect()
    }

    /// Argmax of the mean softmax per example.
    pub fn predicted_labels(&self) -> Vec<usize> {
        self.mean_probs()
            .iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f64::NEG_INFINITY), |best, (i, &p)| {
                        if p > best.1 {
                            (i, p)
                        } else {
                            best
                        }
                    })
                    .0
            })
            .collect()
    }
}

/// Draw `num_samples` stochastic forward passes over `images`.
pub fn mc_softmax<B: Backend, M: Classifier<B>>(
    model: &M,
    images: Tensor<B, 4>,
    num_samples: usize,
) -> McSamples {
    let [batch_size, ..] = images.dims();
    let mut probs = Vec::new();
    let mut num_classes = 0;
    for _ in 0..num_samples {
        let p = softmax(model.forward(images.clone()), 1);
        num_classes = p.dims()[1];
        probs.extend(tensor_to_vec(p));
    }
    McSamples {
        num_samples,
        batch_size,
        num_classes,
        probs,
    }
}

/// Predictive entropy of every example.
pub fn predictive_entropy(samples: &McSamples) -> Vec<f64> {
    samples
        .mean_probs()
        .iter()
        .map(|pbar| -pbar.iter().map(|&p| p * (p + ENTROPY_EPS).ln()).sum::<f64>())
        .collect()
}

/// Epistemic uncertainty of every example: the trace of the sample
/// covariance of the softmax output.
pub fn epistemic_uncertainty(samples: &McSamples) -> Vec<f64> {
    let t = samples.num_samples.max(1) as f64;
    samples
        .mean_probs()
        .iter()
        .enumerate()
        .map(|(b, pbar)| {
            let spread: f64 = (0..samples.num_samples)
                .map(|s| {
                    pbar.iter()
                        .enumerate()
                        .map(|(c, &m)| (samples.prob(s, b, c) - m).powi(2))
                        .sum::<f64>()
                })
                .sum();
            spread / t
        })
        .collect()
}

/// Uncertainty scores of one dataset slice.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct McStats {
    pub entropy: Vec<f64>,
    pub epistemic: Vec<f64>,
    /// Examples predicted as each class.
    pub class_count: Vec<usize>,
}

impl McStats {
    pub fn len(&self) -> usize {
        self.entropy.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entropy.is_empty()
    }

    fn extend(&mut self, samples: &McSamples) {
        if self.class_count.len() < samples.num_classes {
            self.class_count.resize(samples.num_classes, 0);
        }
        self.entropy.extend(predictive_entropy(samples));
        self.epistemic.extend(epistemic_uncertainty(samples));
        for label in samples.predicted_labels() {
            self.class_count[label] += 1;
        }
    }
}

fn collect_stats<B, M, S>(
    model: &M,
    source: &mut S,
    num_batches: usize,
    num_samples: usize,
    msg: &str,
    device: &B::Device,
) -> anyhow::Result<McStats>
where
    B: Backend,
    M: Classifier<B>,
    S: BatchSource + ?Sized,
{
    anyhow::ensure!(num_samples > 0, "number of Monte-Carlo samples must be positive");
    let mut stats = McStats::default();
    let pb = progress_bar(num_batches, msg);
    for _ in 0..num_batches {
        let batch = source.next_batch()?;
        let samples = mc_softmax(model, batch_to_images::<B>(&batch, device), num_samples);
        stats.extend(&samples);
        pb.inc(1);
    }
    pb.finish_and_clear();
    tracing::debug!(examples = stats.len(), num_samples, "{msg}");
    Ok(stats)
}

/// Entropy and epistemic scores over `num_batches` in-distribution batches.
pub fn mc_in_stats<B, M, S>(
    model: &M,
    source: &mut S,
    num_batches: usize,
    num_samples: usize,
    device: &B::Device,
) -> anyhow::Result<McStats>
where
    B: Backend,
    M: Classifier<B>,
    S: BatchSource + ?Sized,
{
    collect_stats(model, source, num_batches, num_samples, "mc in", device)
}

/// Scores plus per-class prediction counts over an out-of-distribution slice.
pub fn mc_out_stats<B, M, S>(
    model: &M,
    source: &mut S,
    num_batches: usize,
    num_samples: usize,
    device: &B::Device,
) -> anyhow::Result<McStats>
where
    B: Backend,
    M: Classifier<B>,
    S: BatchSource + ?Sized,
{
    collect_stats(model, source, num_batches, num_samples, "mc out", device)
}

/// Population mean and standard deviation, `(0, 0)` when empty.
pub fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Append in- vs out-of-distribution summaries for one slice to the log.
pub fn log_mc_in_out(
    log: &mut RunLog,
    slice_name: &str,
    num_samples: usize,
    in_stats: &McStats,
    out_stats: &McStats,
    class_names: &[String],
) -> anyhow::Result<()> {
    let (in_h, in_h_std) = mean_std(&in_stats.entropy);
    let (out_h, out_h_std) = mean_std(&out_stats.entropy);
    let (in_e, in_e_std) = mean_std(&in_stats.epistemic);
    let (out_e, out_e_std) = mean_std(&out_stats.epistemic);

    log.write(&format!("{slice_name} with {num_samples} Monte-Carlo samples"))?;
    log.write(&format!(
        "In-distribution entropy: mean {in_h:.4}, std {in_h_std:.4}; out-of-distribution entropy: mean {out_h:.4}, std {out_h_std:.4}"
    ))?;
    log.write(&format!(
        "In-distribution epistemic: mean {in_e:.6}, std {in_e_std:.6}; out-of-distribution epistemic: mean {out_e:.6}, std {out_e_std:.6}"
    ))?;
    for (i, count) in out_stats.class_count.iter().enumerate() {
        let name = class_names
            .get(i)
            .cloned()
            .unwrap_or_else(|| format!("class {i}"));
        log.write(&format!("predicted as {name}: {count}"))?;
    }
    log.write("")
}
