//! Running a trained model over a dataset

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use hdf5::File;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array2, Array3};
use std::path::{Path, PathBuf};

use super::scaling::{unscale_output, Prediction};
use crate::config::GerbilizerConfig;
use crate::data::{DataLoader, DatasetOptions, VocalizationDataset};
use crate::models::{build_model, GaussianOutput, GerbilizerNetwork, OutputKind};
use crate::training::load_weights;
use crate::utils::mat2::Mat2;
use crate::utils::tensor_utils::to_pairs;

/// Name of the dataset written by [`write_predictions`]
pub const PREDICTIONS_KEY: &str = "predictions";

/// Network output for one event on the scaled square
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaledOutput {
    pub mean: [f64; 2],
    /// Lower-triangular factor of the covariance
    pub cholesky: Option<Mat2>,
}

/// Predictions for every event of a dataset, in event order
#[derive(Debug, Clone)]
pub struct PredictionSet {
    pub kind: OutputKind,
    pub scaled: Vec<ScaledOutput>,
    pub predictions: Vec<Prediction>,
    /// Labels on the scaled square, when the dataset has them
    pub labels: Option<Vec<[f32; 2]>>,
}

impl PredictionSet {
    /// Number of events
    pub fn len(&self) -> usize {
        self.predictions.len()
    }

    /// Whether no events were predicted
    pub fn is_empty(&self) -> bool {
        self.predictions.is_empty()
    }
}

/// A trained network in eval mode plus the preprocessing it expects
pub struct Predictor {
    network: GerbilizerNetwork,
    _varmap: VarMap,
    device: Device,
    options: DatasetOptions,
    batch_size: usize,
    seed: u64,
    show_progress: bool,
}

impl Predictor {
    /// Build the model for `config` and load `weights`, falling back to
    /// `WEIGHTS_PATH` from the config
    pub fn new(config: &GerbilizerConfig, device: Device, weights: Option<&Path>) -> Result<Self> {
        let weights: PathBuf = weights
            .map(Path::to_path_buf)
            .or_else(|| config.weights_path.clone())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Cannot evaluate model as the config doesn't include a path to weights"
                )
            })?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let (network, _) = build_model(config, vb)?;
        load_weights(&varmap, &weights, &device)
            .with_context(|| format!("Failed to load model weights from {:?}", weights))?;
        tracing::info!("Loaded {} weights from {:?}", config.architecture, weights);

        Ok(Self {
            network,
            _varmap: varmap,
            device,
            options: DatasetOptions::from_config(config),
            batch_size: config.optimization.val_batch_size,
            seed: config.optimization.seed,
            show_progress: true,
        })
    }

    /// Enable or disable the progress bar
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Preprocessing applied to inputs
    pub fn options(&self) -> &DatasetOptions {
        &self.options
    }

    /// Raw network output for a `(batch, channels, samples)` input
    pub fn forward(&self, audio: &Tensor) -> Result<Tensor> {
        self.network.forward_t(audio, false)
    }

    /// Open an HDF5 dataset with this predictor's preprocessing and predict it
    pub fn predict_file<P: AsRef<Path>>(&self, path: P) -> Result<PredictionSet> {
        let dataset = VocalizationDataset::open(path, self.options.clone())?;
        self.predict(dataset)
    }

    /// Predict every event of `dataset`
    pub fn predict(&self, dataset: VocalizationDataset) -> Result<PredictionSet> {
        let n = dataset.len();
        let has_labels = dataset.has_locations();
        let kind = self.network.output_kind();
        let arena = self.options.arena_dims;

        let mut scaled: Vec<Option<ScaledOutput>> = vec![None; n];
        let mut labels: Vec<[f32; 2]> = vec![[0.0; 2]; n];

        let pb = if self.show_progress {
            let pb = ProgressBar::new(n as u64);
            let template = "predict [{bar:30.cyan/blue}] {pos}/{len}";
            if let Ok(style) = ProgressStyle::default_bar().template(template) {
                pb.set_style(style.progress_chars("=> "));
            }
            pb
        } else {
            ProgressBar::hidden()
        };

        let mut loader = DataLoader::new(dataset, self.batch_size, false, self.seed);
        for batch in loader.iter(&self.device) {
            let batch = batch?;
            let raw = self.forward(&batch.audio)?;
            let outputs = split_output(&raw, kind)?;
            let batch_labels = batch.locations.as_ref().map(to_pairs).transpose()?;

            for (row, &idx) in batch.indices.iter().enumerate() {
                scaled[idx] = Some(outputs[row]);
                if let Some(l) = &batch_labels {
                    labels[idx] = l[row];
                }
            }
            pb.inc(batch.len() as u64);
        }
        pb.finish_and_clear();

        let scaled = scaled
            .into_iter()
            .enumerate()
            .map(|(i, s)| s.ok_or_else(|| anyhow::anyhow!("Event {} was never predicted", i)))
            .collect::<Result<Vec<_>>>()?;
        let predictions = scaled
            .iter()
            .map(|s| unscale_output(s.mean, s.cholesky.as_ref(), arena))
            .collect();

        Ok(PredictionSet {
            kind,
            scaled,
            predictions,
            labels: has_labels.then_some(labels),
        })
    }
}

/// Split a raw output batch into per-event means and Cholesky factors
pub fn split_output(raw: &Tensor, kind: OutputKind) -> Result<Vec<ScaledOutput>> {
    match kind {
        OutputKind::Location => Ok(to_pairs(raw)?
            .into_iter()
            .map(|m| ScaledOutput {
                mean: [m[0] as f64, m[1] as f64],
                cholesky: None,
            })
            .collect()),
        OutputKind::LocationWithCovariance => Ok(GaussianOutput::from_raw(raw)?
            .to_host()?
            .into_iter()
            .map(|(mean, l)| ScaledOutput {
                mean,
                cholesky: Some(l),
            })
            .collect()),
    }
}

/// Write predictions to a new HDF5 file under `predictions`.
///
/// The shape is `(n, 2)` for location models and `(n, 3, 2)` for covariance
/// models, where row 0 is the mean and rows 1..3 the covariance. The shape
/// follows `kind`, so an empty set still has the model's layout.
pub fn write_predictions<P: AsRef<Path>>(
    path: P,
    kind: OutputKind,
    predictions: &[Prediction],
) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory: {:?}", parent))?;
    }
    let file =
        File::create(path).with_context(|| format!("Failed to create output file: {:?}", path))?;

    let n = predictions.len();
    match kind {
        OutputKind::LocationWithCovariance => {
            let mut data = Array3::<f64>::zeros((n, 3, 2));
            for (i, p) in predictions.iter().enumerate() {
                let cov = p.cov.ok_or_else(|| {
                    anyhow::anyhow!("Prediction {} of a covariance model has no covariance", i)
                })?;
                data[[i, 0, 0]] = p.mean[0];
                data[[i, 0, 1]] = p.mean[1];
                for r in 0..2 {
                    for c in 0..2 {
                        data[[i, 1 + r, c]] = cov[r][c];
                    }
                }
            }
            file.new_dataset_builder().with_data(&data).create(PREDICTIONS_KEY)?;
        }
        OutputKind::Location => {
            let data = Array2::from_shape_fn((n, 2), |(i, j)| predictions[i].mean[j]);
            file.new_dataset_builder().with_data(&data).create(PREDICTIONS_KEY)?;
        }
    }

    tracing::info!("Wrote {} predictions to {:?}", n, path);
    Ok(())
}
