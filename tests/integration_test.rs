//! Integration tests for Gerbilizer
//!
//! Tests the pipeline from HDF5 datasets through training, prediction and
//! assessment, plus the submission front end.

use anyhow::Result;
use candle_core::Device;
use hdf5::File;
use ndarray::Array2;
use std::path::Path;
use std::process::Command;

use gerbilizer::assess::assess_model;
use gerbilizer::data::{
    build_dataloaders, DatasetOptions, InMemoryVocalizations, VocalizationDataset,
    VocalizationFile, VocalizationSource, TEST_FILE, TRAIN_FILE, VAL_FILE,
};
use gerbilizer::inference::{write_predictions, Predictor, PREDICTIONS_KEY};
use gerbilizer::training::{Trainer, BEST_WEIGHTS_FILE, CONFIG_FILE, FINAL_WEIGHTS_FILE};
use gerbilizer::GerbilizerConfig;

const SMALL_CONFIG: &str = r#"{
    "ARCHITECTURE": "GerbilizerSimpleNetwork",
    "DATA": {
        "NUM_MICROPHONES": 4,
        "ARENA_DIMS": [600.0, 400.0],
        "SAMPLE_LEN": 64,
        "AUGMENT_LABELS": true,
        "AUGMENT_FLIP_VERT": true,
        "AUGMENT_FLIP_HORIZ": true
    },
    "OPTIMIZATION": {
        "NUM_EPOCHS": 2,
        "TRAIN_BATCH_SIZE": 4,
        "VAL_BATCH_SIZE": 3,
        "LEARNING_RATE": 0.001,
        "SEED": 7
    },
    "MODEL_PARAMS": {
        "SHOULD_DOWNSAMPLE": [false, true],
        "CONV_FILTER_SIZES": [5, 3],
        "CONV_NUM_CHANNELS": [4, 8],
        "CONV_DILATIONS": [1, 1]
    }
}"#;

/// Events of varying length whose channel delays depend on the location
fn synthetic_events(n: usize, seed: usize) -> InMemoryVocalizations {
    let events: Vec<Array2<f32>> = (0..n)
        .map(|i| {
            let len = 90 + (i * 7 + seed) % 30;
            Array2::from_shape_fn((len, 4), |(t, c)| {
                let shift = ((i + seed) % 5) as f32 * c as f32;
                ((t as f32 + shift) * 0.3).sin() * (1.0 + 0.1 * c as f32)
            })
        })
        .collect();
    let locations = Array2::from_shape_fn((n, 2), |(i, j)| {
        let extent = if j == 0 { 250.0 } else { 150.0 };
        extent * (((i + seed) * (j + 3)) % 11) as f32 / 10.0 - extent / 2.0
    });
    InMemoryVocalizations::from_events(&events, Some(locations)).unwrap()
}

fn write_dataset_dir(dir: &Path) {
    VocalizationFile::create(dir.join(TRAIN_FILE), &synthetic_events(10, 0)).unwrap();
    VocalizationFile::create(dir.join(VAL_FILE), &synthetic_events(5, 3)).unwrap();
    VocalizationFile::create(dir.join(TEST_FILE), &synthetic_events(4, 9)).unwrap();
}

/// Train briefly, predict, and assess
#[test]
fn test_train_predict_assess() -> Result<()> {
    let data_dir = tempfile::tempdir()?;
    let run_dir = tempfile::tempdir()?;
    write_dataset_dir(data_dir.path());

    let config = GerbilizerConfig::from_json(SMALL_CONFIG)?;
    let mut loaders = build_dataloaders(data_dir.path(), &config)?;
    assert!(loaders.test.is_some());

    let mut trainer = Trainer::new(config, Device::Cpu, run_dir.path())?.with_progress(false);
    let summary = trainer.fit(&mut loaders.train, &mut loaders.val)?;
    assert_eq!(summary.history.len(), 2);
    assert!(summary.best_val_loss.is_finite());
    assert!(run_dir.path().join(BEST_WEIGHTS_FILE).is_file());
    assert!(run_dir.path().join(FINAL_WEIGHTS_FILE).is_file());

    // The saved config points at the best weights and carries resolved params
    let saved = GerbilizerConfig::load(&summary.config_path)?;
    assert_eq!(saved.weights_path.as_deref(), Some(summary.best_weights.as_path()));
    assert_eq!(saved.model_params.conv_num_channels, Some(vec![4, 8]));

    let predictor = Predictor::new(&saved, Device::Cpu, None)?.with_progress(false);
    let test_file = data_dir.path().join(TEST_FILE);
    let predictions = predictor.predict_file(&test_file)?;
    assert_eq!(predictions.len(), 4);
    assert!(predictions.predictions.iter().all(|p| p.cov.is_some()));

    let out = run_dir.path().join("predictions.h5");
    write_predictions(&out, predictions.kind, &predictions.predictions)?;
    let shape = File::open(&out)?.dataset(PREDICTIONS_KEY)?.shape();
    assert_eq!(shape, vec![4, 3, 2]);

    let dataset = VocalizationDataset::open(&test_file, DatasetOptions::from_config(&saved))?;
    let assessment = assess_model(&predictor, dataset, run_dir.path().join("assess.h5"))?;
    assert_eq!(assessment.n_events, 4);
    assert!(assessment.mean_error.is_finite());
    assert_eq!(assessment.calibration_curve.last().copied(), Some(1.0));
    Ok(())
}

/// Prediction is deterministic for a fixed seed
#[test]
fn test_prediction_is_reproducible() -> Result<()> {
    let data_dir = tempfile::tempdir()?;
    let run_dir = tempfile::tempdir()?;
    write_dataset_dir(data_dir.path());

    let mut config = GerbilizerConfig::from_json(SMALL_CONFIG)?;
    config.optimization.num_epochs = 1;
    config.model_params.output_cov = Some(false);
    let mut loaders = build_dataloaders(data_dir.path(), &config)?;
    let mut trainer = Trainer::new(config, Device::Cpu, run_dir.path())?.with_progress(false);
    let summary = trainer.fit(&mut loaders.train, &mut loaders.val)?;

    let saved = GerbilizerConfig::load(&summary.config_path)?;
    let predictor = Predictor::new(&saved, Device::Cpu, None)?.with_progress(false);
    let a = predictor.predict_file(data_dir.path().join(VAL_FILE))?;
    let b = predictor.predict_file(data_dir.path().join(VAL_FILE))?;
    assert_eq!(a.predictions, b.predictions);
    assert!(a.predictions.iter().all(|p| p.cov.is_none()));

    let out = run_dir.path().join("loc.h5");
    write_predictions(&out, a.kind, &a.predictions)?;
    assert_eq!(File::open(&out)?.dataset(PREDICTIONS_KEY)?.shape(), vec![5, 2]);
    Ok(())
}

/// Pretrained weights with a different architecture load partially
#[test]
fn test_pretrained_load_is_non_strict() -> Result<()> {
    let data_dir = tempfile::tempdir()?;
    let first_dir = tempfile::tempdir()?;
    let second_dir = tempfile::tempdir()?;
    write_dataset_dir(data_dir.path());

    let mut config = GerbilizerConfig::from_json(SMALL_CONFIG)?;
    config.optimization.num_epochs = 1;
    let mut loaders = build_dataloaders(data_dir.path(), &config)?;
    let mut first =
        Trainer::new(config.clone(), Device::Cpu, first_dir.path())?.with_progress(false);
    let summary = first.fit(&mut loaders.train, &mut loaders.val)?;

    // Wider second layer: its tensors no longer match
    config.model_params.conv_num_channels = Some(vec![4, 16]);
    let mut second = Trainer::new(config, Device::Cpu, second_dir.path())?.with_progress(false);
    let report = second.load_pretrained(&summary.best_weights)?;
    assert!(!report.loaded.is_empty());
    assert!(!report.shape_mismatched.is_empty());
    assert!(report.loaded.iter().any(|k| k.starts_with("conv_layers.0.")));
    Ok(())
}

/// Missing labels are rejected for training
#[test]
fn test_training_requires_labels() -> Result<()> {
    let data_dir = tempfile::tempdir()?;
    let events = vec![Array2::<f32>::zeros((100, 4)); 3];
    let unlabelled = InMemoryVocalizations::from_events(&events, None)?;
    VocalizationFile::create(data_dir.path().join(TRAIN_FILE), &unlabelled)?;
    VocalizationFile::create(data_dir.path().join(VAL_FILE), &unlabelled)?;

    let config = GerbilizerConfig::from_json(SMALL_CONFIG)?;
    assert!(build_dataloaders(data_dir.path(), &config).is_err());

    // Still readable for prediction
    let file = VocalizationFile::open(data_dir.path().join(TRAIN_FILE))?;
    assert_eq!(file.len(), 3);
    assert!(!file.has_locations());
    Ok(())
}

/// Submission with no arguments exits 1 naming the dataset
#[test]
fn test_submit_without_arguments() {
    let output = Command::new(env!("CARGO_BIN_EXE_gerbilizer"))
        .arg("submit")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("No dataset path provided"));
}

/// Submission with only a dataset exits 1 naming the config
#[test]
fn test_submit_without_config() {
    let output = Command::new(env!("CARGO_BIN_EXE_gerbilizer"))
        .args(["submit", "data/"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("No config file provided"));
}

/// A dry run prints the batch script with the forwarding command
#[test]
fn test_submit_dry_run() {
    let output = Command::new(env!("CARGO_BIN_EXE_gerbilizer"))
        .args(["submit", "data/", "default", "--dry-run"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let script = String::from_utf8_lossy(&output.stdout);
    assert!(script.contains("#SBATCH --gres=gpu:1"));
    assert!(script.contains("run --datafile data/ --config_fil default --pretrained"));
}

/// The command a submitted job runs is accepted by `run` and trains a model
#[test]
fn test_forwarded_run_command_trains() -> Result<()> {
    let data_dir = tempfile::tempdir()?;
    let run_dir = tempfile::tempdir()?;
    write_dataset_dir(data_dir.path());

    let mut config = GerbilizerConfig::from_json(SMALL_CONFIG)?;
    config.optimization.num_epochs = 1;
    let config_path = run_dir.path().join("small.json");
    config.save(&config_path)?;
    let save_path = run_dir.path().join("trained");

    let output = Command::new(env!("CARGO_BIN_EXE_gerbilizer"))
        .arg("run")
        .arg("--datafile")
        .arg(data_dir.path())
        .arg("--config_fil")
        .arg(&config_path)
        .arg("--pretrained")
        .arg("--save-path")
        .arg(&save_path)
        .arg("--cpu")
        .output()?;
    let log = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(output.status.success(), "{}", log);
    assert!(log.contains("training from scratch"), "{}", log);

    let saved = GerbilizerConfig::load(save_path.join(CONFIG_FILE))?;
    assert_eq!(saved.weights_path, Some(save_path.join(BEST_WEIGHTS_FILE)));
    assert!(save_path.join(BEST_WEIGHTS_FILE).is_file());
    Ok(())
}

/// Shipped configs parse and resolve
#[test]
fn test_shipped_configs_resolve() -> Result<()> {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("configs");
    for name in ["default", "log_xcorr"] {
        let path = GerbilizerConfig::locate(name, &dir)?;
        let config = GerbilizerConfig::load(&path)?;
        let params = config.resolved_model_params()?;
        assert!(params.output_cov, "{}", name);
    }
    let xcorr = GerbilizerConfig::load(dir.join("log_xcorr.json"))?;
    assert_eq!(xcorr.data.input_channels(), 10);
    Ok(())
}
