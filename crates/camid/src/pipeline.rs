//! Train, evaluate, and Monte-Carlo statistics pipelines.

use std::path::PathBuf;
use std::time::Instant;

use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use burn::prelude::*;

use bayes_cnn::model::{BayesianCnnConfig, Classifier, VanillaCnnConfig};
use bayes_cnn::report::{detection_accuracy, roc_grid, roc_pr_curves, RocPanel};
use bayes_cnn::training::{
    held_out_samples, percent, BayesianTrainer, CheckpointManager, EnsembleTrainer, RunLog,
    VanillaTrainer,
};
use bayes_cnn::uncertainty::{log_mc_in_out, mc_in_stats, mc_out_stats, McStats};
use patches::{list_class_files, BatchSource, DatasetSlice, PatchLoader, SliceBatches, SliceKind};

use crate::config::{load_params, ModelType, Params};
use crate::results::RunSummary;

type TrainBackend = Autodiff<NdArray<f32>>;
type EvalBackend = NdArray<f32>;

/// Out-of-distribution slices compared against the test slice, in plot order.
static OOD_SLICES: [(SliceKind, &str); 5] = [
    (SliceKind::Unseen, "unseen"),
    (SliceKind::Kaggle, "kaggle"),
    (SliceKind::Jpeg, "jpeg"),
    (SliceKind::Blur, "blur"),
    (SliceKind::Noise, "noise"),
];

/// Arguments for the `train` subcommand.
#[derive(Debug)]
pub struct TrainArgs {
    pub config: PathBuf,
    pub model_type: Option<ModelType>,
    pub epochs: Option<usize>,
    pub num_ensemble: Option<usize>,
}

/// Arguments for the `evaluate` subcommand.
#[derive(Debug)]
pub struct EvaluateArgs {
    pub config: PathBuf,
    pub model_type: Option<ModelType>,
    pub num_ensemble: Option<usize>,
}

/// Arguments for the `mc-stats` subcommand.
#[derive(Debug)]
pub struct McStatsArgs {
    pub config: PathBuf,
    pub model_type: Option<ModelType>,
}

fn slice_batches(
    params: &Params,
    kind: SliceKind,
    classes: &[String],
    batch_size: usize,
    shuffle: bool,
) -> anyhow::Result<SliceBatches> {
    let slice = DatasetSlice::from_class_dirs(kind, &params.dataloader.patch_dir, classes)?;
    Ok(SliceBatches::new(
        slice,
        PatchLoader::new(params.dataloader.image_size),
        batch_size,
        shuffle,
        params.dataloader.seed,
    )?)
}

/// Number of training patches, used to scale the Bayesian KL term.
fn train_size(params: &Params, classes: &[String]) -> anyhow::Result<usize> {
    let mut size = 0;
    for class in classes {
        size += list_class_files(&params.dataloader.patch_dir, "train", class)?.len();
    }
    Ok(size)
}

/// Train the configured model type and write `{prefix}_train.json`.
pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let start = Instant::now();
    let mut params = load_params(&args.config)?;
    params.apply_overrides(args.model_type, args.epochs, args.num_ensemble);
    let classes = params.brand_models()?;
    let device = Default::default();
    let batch_size = params.trainer.batch_size;

    let mut train = slice_batches(&params, SliceKind::Train, &classes, batch_size, true)?;
    let mut val = slice_batches(&params, SliceKind::Val, &classes, batch_size, false)?;
    tracing::info!(
        model_type = %params.run.model_type,
        classes = classes.len(),
        train = train.slice().len(),
        val = val.slice().len(),
        "Starting training"
    );

    let mut summary = RunSummary::new(
        "train",
        &params.run.database,
        &params.run.model_type.to_string(),
    );
    match params.run.model_type {
        ModelType::Cnn => {
            let mut trainer =
                VanillaTrainer::new(params.trainer_config(), params.run_paths(), classes.clone())?;
            let model = VanillaCnnConfig::new(classes.len()).init::<TrainBackend>(&device);
            let (_, fit) = trainer.train(model, &mut train, &mut val, &device)?;
            summary.push_train(None, &fit);
        }
        ModelType::Ensemble => {
            let ensemble = EnsembleTrainer::new(
                params.trainer_config(),
                params.run_paths(),
                classes.clone(),
                VanillaCnnConfig::new(classes.len()),
                params.trainer.num_ensemble,
            );
            let fits = ensemble.train::<TrainBackend, _>(&mut train, &mut val, &device)?;
            for (i, fit) in fits.iter().enumerate() {
                summary.push_train(Some(i), fit);
            }
        }
        ModelType::Bnn => {
            let mut trainer =
                BayesianTrainer::new(params.trainer_config(), params.run_paths(), classes.clone())?;
            let model = BayesianCnnConfig::new(classes.len(), train_size(&params, &classes)?)
                .init::<TrainBackend>(&device);
            let (_, fit) = trainer.train(model, &mut train, &mut val, &device)?;
            summary.push_train(None, &fit);
        }
    }

    summary.save(&params.result_file("_train.json"))?;
    tracing::info!(elapsed_secs = start.elapsed().as_secs_f64(), "Training finished");
    Ok(())
}

/// Evaluate the latest checkpoint(s) on the test split and write
/// `{prefix}_evaluate.json`.
pub fn run_evaluate(args: EvaluateArgs) -> anyhow::Result<()> {
    let mut params = load_params(&args.config)?;
    params.apply_overrides(args.model_type, None, args.num_ensemble);
    let classes = params.brand_models()?;
    let device = Default::default();
    let mut test = slice_batches(
        &params,
        SliceKind::Test,
        &classes,
        params.evaluate.batch_size,
        false,
    )?;

    let mut summary = RunSummary::new(
        "evaluate",
        &params.run.database,
        &params.run.model_type.to_string(),
    );
    match params.run.model_type {
        ModelType::Cnn => {
            let mut trainer =
                VanillaTrainer::new(params.trainer_config(), params.run_paths(), classes.clone())?;
            let model = VanillaCnnConfig::new(classes.len()).init::<EvalBackend>(&device);
            let report = trainer.evaluate(model, &mut test, &device)?;
            summary.push_eval(None, &report, &classes);
        }
        ModelType::Ensemble => {
            let ensemble = EnsembleTrainer::new(
                params.trainer_config(),
                params.run_paths(),
                classes.clone(),
                VanillaCnnConfig::new(classes.len()),
                params.trainer.num_ensemble,
            );
            let reports = ensemble.evaluate::<EvalBackend, _>(&mut test, &device)?;
            for (i, report) in reports.iter().enumerate() {
                summary.push_eval(Some(i), report, &classes);
            }
        }
        ModelType::Bnn => {
            let mut trainer =
                BayesianTrainer::new(params.trainer_config(), params.run_paths(), classes.clone())?;
            let model = BayesianCnnConfig::new(classes.len(), train_size(&params, &classes)?)
                .init::<EvalBackend>(&device);
            let report = trainer.evaluate(model, &params.weight_plots(), &mut test, &device)?;
            summary.push_eval(None, &report, &classes);
        }
    }

    summary.save(&params.result_file("_evaluate.json"))
}

/// One out-of-distribution slice ready for sampling.
struct OodSource {
    name: &'static str,
    batches: SliceBatches,
}

/// Build the five out-of-distribution slices, each aligned to `num_batches`.
fn ood_sources(
    params: &Params,
    test_slice: &DatasetSlice,
    num_batches: usize,
    batch_size: usize,
) -> anyhow::Result<Vec<OodSource>> {
    let loader = PatchLoader::new(params.dataloader.image_size);
    let mut sources = Vec::with_capacity(OOD_SLICES.len());
    for &(kind, name) in OOD_SLICES.iter() {
        let slice = match kind {
            SliceKind::Unseen => DatasetSlice::from_class_dirs(
                kind,
                &params.dataloader.unseen_dir,
                &params.unseen_models()?,
            )?,
            SliceKind::Kaggle => DatasetSlice::from_class_dirs(
                kind,
                &params.dataloader.kaggle_dir,
                &params.kaggle_models()?,
            )?,
            _ => {
                let distortion = params
                    .dataloader
                    .distortion_for(kind)
                    .ok_or_else(|| anyhow::anyhow!("no distortion configured for {kind}"))?;
                test_slice.with_distortion(kind, distortion)
            }
        };
        let slice = slice.aligned(num_batches, batch_size);
        tracing::info!(slice = name, examples = slice.len(), "Out-of-distribution slice");
        sources.push(OodSource {
            name,
            batches: SliceBatches::new(slice, loader, batch_size, false, params.dataloader.seed)?,
        });
    }
    Ok(sources)
}

/// Restore the latest checkpoint into `model`, warning when there is none.
fn restore_for_stats<M: Module<EvalBackend>>(
    params: &Params,
    model: M,
    device: &<EvalBackend as Backend>::Device,
) -> anyhow::Result<M> {
    let manager = CheckpointManager::new(params.ckpt_dir(), params.trainer.max_to_keep)?;
    let (model, meta) = manager.restore_model::<EvalBackend, M>(model, device)?;
    match meta {
        Some(meta) => tracing::info!(step = meta.step, dir = %manager.dir().display(), "Restored checkpoint"),
        None => tracing::warn!(dir = %manager.dir().display(), "No checkpoint found, using fresh weights"),
    }
    Ok(model)
}

/// Monte-Carlo uncertainty over the test slice and every out-of-distribution
/// slice, for each configured sample count. Writes `{prefix}_mc_stats.log`,
/// `{prefix}_mc_stats.png` and `{prefix}_mc_stats.json`.
pub fn run_mc_stats(args: McStatsArgs) -> anyhow::Result<()> {
    let mut params = load_params(&args.config)?;
    params.apply_overrides(args.model_type, None, None);
    let classes = params.brand_models()?;
    let device = Default::default();

    match params.run.model_type {
        ModelType::Bnn => {
            let model = BayesianCnnConfig::new(classes.len(), train_size(&params, &classes)?)
                .init::<EvalBackend>(&device);
            let model = restore_for_stats(&params, model, &device)?;
            if params.mc.held_out_examples > 0 {
                held_out_plot(&params, &classes, &model, &device)?;
            }
            mc_stats(&params, &classes, &model, &device)
        }
        ModelType::Cnn => {
            let model = VanillaCnnConfig::new(classes.len()).init::<EvalBackend>(&device);
            let model = restore_for_stats(&params, model, &device)?;
            mc_stats(&params, &classes, &model, &device)
        }
        ModelType::Ensemble => anyhow::bail!(
            "mc-stats samples a single stochastic model; use --model-type bnn or cnn"
        ),
    }
}

/// Probability plot of the first unseen-model batch at the largest sample count.
fn held_out_plot<M: Classifier<EvalBackend>>(
    params: &Params,
    classes: &[String],
    model: &M,
    device: &<EvalBackend as Backend>::Device,
) -> anyhow::Result<()> {
    let num_samples = params.mc.num_monte_carlo.iter().copied().max().unwrap_or(50);
    let unseen = params.unseen_models()?;
    let slice =
        DatasetSlice::from_class_dirs(SliceKind::Unseen, &params.dataloader.unseen_dir, &unseen)?;
    let mut batches = SliceBatches::new(
        slice,
        PatchLoader::new(params.dataloader.image_size),
        params.mc.held_out_examples,
        true,
        params.dataloader.seed,
    )?;
    let batch = batches.next_batch()?;
    held_out_samples::<EvalBackend, _>(
        model,
        &batch,
        num_samples,
        classes,
        &unseen,
        &params.result_file("_held_out.png"),
        device,
    )?;
    Ok(())
}

fn mc_stats<M: Classifier<EvalBackend>>(
    params: &Params,
    classes: &[String],
    model: &M,
    device: &<EvalBackend as Backend>::Device,
) -> anyhow::Result<()> {
    let batch_size = params.mc.batch_size;
    let test_slice =
        DatasetSlice::from_class_dirs(SliceKind::Test, &params.dataloader.patch_dir, classes)?;
    let num_test_batches = test_slice.num_batches(batch_size);
    anyhow::ensure!(num_test_batches > 0, "test slice is empty");
    let mut sources = ood_sources(params, &test_slice, num_test_batches, batch_size)?;
    let mut test = SliceBatches::new(
        test_slice,
        PatchLoader::new(params.dataloader.image_size),
        batch_size,
        false,
        params.dataloader.seed,
    )?;

    let mut log = RunLog::open(params.result_file("_mc_stats.log"))?;
    log.write(&format!("number of test batches {num_test_batches}"))?;

    let mut panels: Vec<RocPanel> = ["entropy", "epistemic"]
        .iter()
        .flat_map(|score| {
            OOD_SLICES.iter().map(move |(_, name)| RocPanel {
                name: format!("{score}, {name}"),
                curves: Vec::new(),
            })
        })
        .collect();
    let mut summary = RunSummary::new(
        "mc-stats",
        &params.run.database,
        &params.run.model_type.to_string(),
    );

    for &num_samples in &params.mc.num_monte_carlo {
        log.write("... In-distribution MC Statistics")?;
        let in_stats =
            mc_in_stats::<EvalBackend, _, _>(model, &mut test, num_test_batches, num_samples, device)?;

        let mut out_stats: Vec<McStats> = Vec::with_capacity(sources.len());
        for source in sources.iter_mut() {
            log.write(&format!(
                "... {} out-of-distribution MC Statistics",
                source.name.to_uppercase()
            ))?;
            let stats = mc_out_stats::<EvalBackend, _, _>(
                model,
                &mut source.batches,
                num_test_batches,
                num_samples,
                device,
            )?;
            log_mc_in_out(
                &mut log,
                &source.name.to_uppercase(),
                num_samples,
                &in_stats,
                &stats,
                classes,
            )?;
            out_stats.push(stats);
        }

        let comparisons = out_stats
            .iter()
            .map(|out| (&in_stats.entropy, &out.entropy))
            .chain(out_stats.iter().map(|out| (&in_stats.epistemic, &out.epistemic)));
        for (panel, (safe, risky)) in panels.iter_mut().zip(comparisons) {
            let roc = roc_pr_curves(safe, risky, params.mc.inverse)?;
            let (fpr, tpr, threshold) = roc.optimal;
            let acc = detection_accuracy(risky, threshold);
            log.write(&format!(
                "{}\nfalse positive rate: {}, true positive rate: {}, threshold: {threshold}, acc: {}, auroc: {:.4}, aupr: {:.4}\n",
                panel.name,
                percent(fpr),
                percent(tpr),
                percent(acc),
                roc.auroc,
                roc.aupr,
            ))?;
            summary.push_mc(&panel.name, num_samples, &roc, acc);
            panel.curves.push((num_samples, roc));
        }
    }

    let png = params.result_file("_mc_stats.png");
    roc_grid(&png, &panels)?;
    for panel in &panels {
        let legend: Vec<String> = panel
            .curves
            .iter()
            .map(|(t, roc)| format!("{t} mc:{:.4}", roc.auroc))
            .collect();
        log.write(&format!("{}: {}", panel.name, legend.join(", ")))?;
    }
    log.write(&format!("saved {}", png.display()))?;

    summary.save(&params.result_file("_mc_stats.json"))
}
