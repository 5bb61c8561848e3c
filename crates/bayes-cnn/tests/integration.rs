//! Integration tests for the bayes-cnn crate.
//!
//! These run the trainers end to end on tiny synthetic PNG trees: early
//! stopping, checkpoint directories, weight plots, and the Monte-Carlo
//! statistics feeding the ROC grid. All use the NdArray backend.

use std::path::Path;

use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use image::{GrayImage, Luma};
use patches::{discover_classes, DatasetSlice, PatchLoader, SliceBatches, SliceKind};
use tempfile::TempDir;

use bayes_cnn::model::{BayesianCnnConfig, VanillaCnnConfig};
use bayes_cnn::report::{detection_accuracy, roc_grid, roc_pr_curves, RocPanel};
use bayes_cnn::training::{
    BayesianTrainer, EnsembleTrainer, RunLog, RunPaths, TrainerConfig, VanillaTrainer,
    WeightPlotPaths,
};
use bayes_cnn::uncertainty::{log_mc_in_out, mc_in_stats, mc_out_stats};

type TestBackend = NdArray<f32>;
type TestAutodiffBackend = Autodiff<NdArray<f32>>;

const SIZE: u32 = 16;

fn write_patches(root: &Path, split: &str, class: &str, n: usize, seed: u8) {
    let dir = root.join(split).join(class);
    std::fs::create_dir_all(&dir).unwrap();
    for i in 0..n {
        GrayImage::from_fn(SIZE, SIZE, |x, y| {
            let v = (x as u8).wrapping_mul(seed).wrapping_add((y as u8) * 3 + i as u8);
            Luma([v])
        })
        .save(dir.join(format!("{i:03}.png")))
        .unwrap();
    }
}

/// Two camera models with 4 patches per split, plus an unseen model.
fn patch_tree() -> TempDir {
    let tmp = TempDir::new().unwrap();
    let patches = tmp.path().join("patches");
    for split in ["train", "val", "test"] {
        write_patches(&patches, split, "Canon_Ixus70", 4, 7);
        write_patches(&patches, split, "Nikon_D200", 4, 31);
    }
    write_patches(&tmp.path().join("unseen"), "test", "Agfa_DC-504", 4, 97);
    tmp
}

fn run_paths(tmp: &TempDir, name: &str) -> RunPaths {
    RunPaths {
        patch_dir: tmp.path().join("patches"),
        ckpt_dir: tmp.path().join("ckpts").join(name),
        log_file: tmp.path().join("results").join(format!("{name}.log")),
        summary_dir: tmp.path().join("summaries"),
        run_name: name.to_string(),
    }
}

fn small_config() -> TrainerConfig {
    TrainerConfig::new()
        .with_batch_size(2)
        .with_eval_batch_size(2)
        .with_log_step(2)
        .with_summary_step(1)
}

fn batches(root: &Path, kind: SliceKind, classes: &[String], shuffle: bool) -> SliceBatches {
    let slice = DatasetSlice::from_class_dirs(kind, root, classes).unwrap();
    SliceBatches::new(slice, PatchLoader::new(SIZE as usize), 2, shuffle, 7).unwrap()
}

fn tiny_vanilla(num_classes: usize) -> VanillaCnnConfig {
    VanillaCnnConfig::new(num_classes)
        .with_conv1_channels(4)
        .with_conv2_channels(4)
}

fn tiny_bayesian(num_classes: usize, train_size: usize) -> BayesianCnnConfig {
    BayesianCnnConfig::new(num_classes, train_size)
        .with_conv1_channels(4)
        .with_conv2_channels(4)
}

#[test]
fn test_vanilla_stops_after_patience_and_restores() {
    let tmp = patch_tree();
    let root = tmp.path().join("patches");
    let classes = discover_classes(&root, "train").unwrap();
    let device = Default::default();

    // lr 0 freezes the model, so every epoch after the first ties the best loss
    let config = small_config().with_lr(0.0).with_epochs(10).with_patience(2);
    let mut trainer =
        VanillaTrainer::new(config, run_paths(&tmp, "vanilla"), classes.clone()).unwrap();
    let mut train = batches(&root, SliceKind::Train, &classes, true);
    let mut val = batches(&root, SliceKind::Val, &classes, false);

    let model = tiny_vanilla(classes.len()).init::<TestAutodiffBackend>(&device);
    let (_, summary) = trainer.train(model, &mut train, &mut val, &device).unwrap();
    assert_eq!(summary.epochs_run, 3);
    assert_eq!(summary.checkpoints_saved, 1);
    assert!(tmp.path().join("ckpts/vanilla/ckpt-2/model.mpk").exists());

    let log = std::fs::read_to_string(tmp.path().join("results/vanilla.log")).unwrap();
    assert!(log.contains("... Training convolutional neural network"));
    assert!(log.contains("Initializing from scratch."));
    assert!(log.contains("Saved checkpoint for epoch 0"));
    assert!(log.contains("Canon_Ixus70 accuracy: "));
    assert!(log.contains("... Finished training"));

    let summaries = std::fs::read_dir(tmp.path().join("summaries/vanilla")).unwrap().count();
    assert_eq!(summaries, 1);

    let mut evaluator = VanillaTrainer::new(
        small_config(),
        run_paths(&tmp, "vanilla"),
        classes.clone(),
    )
    .unwrap();
    let mut test = batches(&root, SliceKind::Test, &classes, false);
    let fresh = tiny_vanilla(classes.len()).init::<TestBackend>(&device);
    let report = evaluator.evaluate(fresh, &mut test, &device).unwrap();
    assert_eq!(report.counts.total.iter().sum::<usize>(), 8);
    assert!((report.loss - summary.best_loss).abs() < 1e-4);

    let log = std::fs::read_to_string(tmp.path().join("results/vanilla.log")).unwrap();
    assert!(log.contains("Restored from"));
    assert!(log.contains("test accuracy: "));
}

#[test]
fn test_ensemble_creates_one_dir_per_member() {
    let tmp = patch_tree();
    let root = tmp.path().join("patches");
    let classes = discover_classes(&root, "train").unwrap();
    let device = Default::default();

    let ensemble = EnsembleTrainer::new(
        small_config().with_epochs(1),
        run_paths(&tmp, "ensemble"),
        classes.clone(),
        tiny_vanilla(classes.len()),
        3,
    );
    let mut train = batches(&root, SliceKind::Train, &classes, true);
    let mut val = batches(&root, SliceKind::Val, &classes, false);
    let summaries = ensemble
        .train::<TestAutodiffBackend, _>(&mut train, &mut val, &device)
        .unwrap();
    assert_eq!(summaries.len(), 3);

    let mut members: Vec<String> = std::fs::read_dir(tmp.path().join("ckpts/ensemble"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    members.sort();
    assert_eq!(members, vec!["0", "1", "2"]);
    for member in &members {
        assert!(tmp
            .path()
            .join("ckpts/ensemble")
            .join(member)
            .join("checkpoint")
            .exists());
    }

    let mut test = batches(&root, SliceKind::Test, &classes, false);
    let reports = ensemble.evaluate::<TestBackend, _>(&mut test, &device).unwrap();
    assert_eq!(reports.len(), 3);
}

#[test]
fn test_bayesian_train_then_evaluate_plots_weights() {
    let tmp = patch_tree();
    let root = tmp.path().join("patches");
    let classes = discover_classes(&root, "train").unwrap();
    let device = Default::default();

    let mut trainer = BayesianTrainer::new(
        small_config().with_epochs(2).with_lr(1e-3),
        run_paths(&tmp, "bnn"),
        classes.clone(),
    )
    .unwrap();
    let mut train = batches(&root, SliceKind::Train, &classes, true);
    let mut val = batches(&root, SliceKind::Val, &classes, false);
    let model = tiny_bayesian(classes.len(), 8).init::<TestAutodiffBackend>(&device);
    let (_, summary) = trainer.train(model, &mut train, &mut val, &device).unwrap();
    // patience 5 cannot trigger within 2 epochs
    assert_eq!(summary.epochs_run, 2);
    assert!(summary.checkpoints_saved <= 2);

    let log = std::fs::read_to_string(tmp.path().join("results/bnn.log")).unwrap();
    assert!(log.contains("... Training bayesian convolutional neural network"));
    assert!(log.contains("kl loss: "));

    let plots = WeightPlotPaths::with_prefix(
        tmp.path().join("results").join("bnn").to_str().unwrap(),
    );
    let mut test = batches(&root, SliceKind::Test, &classes, false);
    let fresh = tiny_bayesian(classes.len(), 8).init::<TestBackend>(&device);
    let report = trainer.evaluate(fresh, &plots, &mut test, &device).unwrap();
    assert_eq!(report.counts.total.iter().sum::<usize>(), 8);
    for png in [
        &plots.initialized_prior,
        &plots.initialized_posterior,
        &plots.trained_prior,
        &plots.trained_posterior,
    ] {
        assert!(png.exists(), "missing {}", png.display());
    }
}

/// Bayesian model whose Flipout noise is far below f32 resolution, so with
/// lr 0 every validation pass returns the same loss.
fn frozen_bayesian(num_classes: usize) -> BayesianCnnConfig {
    tiny_bayesian(num_classes, 8).with_rho_init(-30.0)
}

#[test]
fn test_bayesian_accepts_equal_loss_every_epoch() {
    let tmp = patch_tree();
    let root = tmp.path().join("patches");
    let classes = discover_classes(&root, "train").unwrap();
    let device = Default::default();

    // any accuracy passes a tolerance of 1, leaving only `eval_loss <= best_loss`
    let config = small_config()
        .with_lr(0.0)
        .with_epochs(3)
        .with_patience(1)
        .with_acc_tolerance(1.0);
    let mut trainer = BayesianTrainer::new(config, run_paths(&tmp, "bnn"), classes.clone()).unwrap();
    let mut train = batches(&root, SliceKind::Train, &classes, true);
    let mut val = batches(&root, SliceKind::Val, &classes, false);
    let model = frozen_bayesian(classes.len()).init::<TestAutodiffBackend>(&device);
    let (_, summary) = trainer.train(model, &mut train, &mut val, &device).unwrap();

    assert_eq!(summary.epochs_run, 3);
    assert_eq!(summary.checkpoints_saved, 3);
    for step in 2..=4 {
        assert!(tmp
            .path()
            .join(format!("ckpts/bnn/ckpt-{step}/model.mpk"))
            .exists());
    }
    let log = std::fs::read_to_string(tmp.path().join("results/bnn.log")).unwrap();
    assert!(log.contains("Saved checkpoint for epoch 0"));
    assert!(log.contains("Saved checkpoint for epoch 2"));

    // the strict loss rule rejects the same ties and stops after patience
    let config = small_config().with_lr(0.0).with_epochs(10).with_patience(2);
    let mut vanilla =
        VanillaTrainer::new(config, run_paths(&tmp, "frozen_cnn"), classes.clone()).unwrap();
    let mut train = batches(&root, SliceKind::Train, &classes, true);
    let mut val = batches(&root, SliceKind::Val, &classes, false);
    let model = tiny_vanilla(classes.len()).init::<TestAutodiffBackend>(&device);
    let (_, summary) = vanilla.train(model, &mut train, &mut val, &device).unwrap();
    assert_eq!(summary.epochs_run, 3);
    assert_eq!(summary.checkpoints_saved, 1);
}

#[test]
fn test_bayesian_rejects_accuracy_drop_until_patience() {
    let tmp = patch_tree();
    let root = tmp.path().join("patches");
    let classes = discover_classes(&root, "train").unwrap();
    let device = Default::default();

    // a negative tolerance rejects every epoch, even the first
    let config = small_config()
        .with_lr(0.0)
        .with_epochs(5)
        .with_patience(2)
        .with_acc_tolerance(-1.0);
    let mut trainer = BayesianTrainer::new(config, run_paths(&tmp, "bnn"), classes.clone()).unwrap();
    let mut train = batches(&root, SliceKind::Train, &classes, true);
    let mut val = batches(&root, SliceKind::Val, &classes, false);
    let model = frozen_bayesian(classes.len()).init::<TestAutodiffBackend>(&device);
    let (_, summary) = trainer.train(model, &mut train, &mut val, &device).unwrap();

    assert_eq!(summary.epochs_run, 2);
    assert_eq!(summary.checkpoints_saved, 0);
    let log = std::fs::read_to_string(tmp.path().join("results/bnn.log")).unwrap();
    assert!(!log.contains("Saved checkpoint"));
}

#[test]
fn test_mc_stats_feed_roc_grid() {
    let tmp = patch_tree();
    let root = tmp.path().join("patches");
    let unseen_root = tmp.path().join("unseen");
    let classes = discover_classes(&root, "train").unwrap();
    let unseen_classes = discover_classes(&unseen_root, "test").unwrap();
    let device = Default::default();

    let model = tiny_bayesian(classes.len(), 8)
        .with_rho_init(0.0)
        .init::<TestBackend>(&device);

    let test_slice = DatasetSlice::from_class_dirs(SliceKind::Test, &root, &classes).unwrap();
    let num_batches = test_slice.num_batches(2);
    let unseen_slice = DatasetSlice::from_class_dirs(SliceKind::Unseen, &unseen_root, &unseen_classes)
        .unwrap()
        .aligned(num_batches, 2);
    let loader = PatchLoader::new(SIZE as usize);
    let mut test = SliceBatches::new(test_slice, loader, 2, false, 0).unwrap();
    let mut unseen = SliceBatches::new(unseen_slice, loader, 2, false, 0).unwrap();

    let mut log = RunLog::open(tmp.path().join("results/bnn_mc_stats.log")).unwrap();
    let mut panels = vec![
        RocPanel {
            name: "entropy, unseen".to_string(),
            curves: Vec::new(),
        },
        RocPanel {
            name: "epistemic, unseen".to_string(),
            curves: Vec::new(),
        },
    ];
    for num_samples in [2, 4] {
        let in_stats = mc_in_stats(&model, &mut test, num_batches, num_samples, &device).unwrap();
        let out_stats =
            mc_out_stats(&model, &mut unseen, num_batches, num_samples, &device).unwrap();
        assert_eq!(in_stats.len(), 8);
        assert_eq!(out_stats.len(), 8);
        assert_eq!(out_stats.class_count.iter().sum::<usize>(), 8);
        log_mc_in_out(&mut log, "UNSEEN", num_samples, &in_stats, &out_stats, &classes).unwrap();

        let entropy = roc_pr_curves(&in_stats.entropy, &out_stats.entropy, false).unwrap();
        let epistemic = roc_pr_curves(&in_stats.epistemic, &out_stats.epistemic, false).unwrap();
        assert!((0.0..=1.0).contains(&entropy.auroc));
        let acc = detection_accuracy(&out_stats.entropy, entropy.optimal.2);
        assert!((0.0..=1.0).contains(&acc));
        panels[0].curves.push((num_samples, entropy));
        panels[1].curves.push((num_samples, epistemic));
    }

    let png = tmp.path().join("results/bnn_mc_stats.png");
    roc_grid(&png, &panels).unwrap();
    assert!(png.exists());
    let text = std::fs::read_to_string(log.path()).unwrap();
    assert!(text.contains("UNSEEN with 4 Monte-Carlo samples"));
}
