//! Training loop
//!
//! AdamW over all parameters, optional gradient-norm clipping, one
//! validation pass per epoch. The lowest validation loss selects the weights
//! written to `best_weights.safetensors`.

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::checkpoint::{
    load_pretrained, save_weights, LoadReport, BEST_WEIGHTS_FILE, CONFIG_FILE, FINAL_WEIGHTS_FILE,
};
use crate::config::GerbilizerConfig;
use crate::data::DataLoader;
use crate::models::{build_model, GerbilizerNetwork, LocalizationLoss};

/// Global L2 norm gradients are clipped to
pub const MAX_GRAD_NORM: f64 = 1.0;

/// Losses recorded for one epoch
#[derive(Debug, Clone, Copy)]
pub struct EpochStats {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
}

/// Outcome of [`Trainer::fit`]
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub history: Vec<EpochStats>,
    pub best_epoch: usize,
    pub best_val_loss: f64,
    pub best_weights: PathBuf,
    pub final_weights: PathBuf,
    pub config_path: PathBuf,
}

/// Owns the model, its parameters and the optimizer
pub struct Trainer {
    config: GerbilizerConfig,
    device: Device,
    varmap: VarMap,
    network: GerbilizerNetwork,
    loss: LocalizationLoss,
    optimizer: AdamW,
    save_path: PathBuf,
    show_progress: bool,
}

impl Trainer {
    /// Build a freshly initialised model for `config`; outputs go to `save_path`
    pub fn new<P: AsRef<Path>>(
        config: GerbilizerConfig,
        device: Device,
        save_path: P,
    ) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let (network, loss) = build_model(&config, vb)?;

        let opt = &config.optimization;
        let params = ParamsAdamW {
            lr: opt.learning_rate,
            weight_decay: opt.weight_decay,
            ..Default::default()
        };
        let optimizer = AdamW::new(varmap.all_vars(), params)?;

        let save_path = save_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&save_path)
            .with_context(|| format!("Failed to create output directory: {:?}", save_path))?;

        Ok(Self {
            config,
            device,
            varmap,
            network,
            loss,
            optimizer,
            save_path,
            show_progress: true,
        })
    }

    /// Enable or disable progress bars
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Initialise from pretrained weights, copying what matches
    pub fn load_pretrained<P: AsRef<Path>>(&mut self, path: P) -> Result<LoadReport> {
        let report = load_pretrained(&self.varmap, path, &self.device)?;
        report.log_summary();
        if report.loaded.is_empty() {
            tracing::warn!("No pretrained tensors matched the model; training from scratch");
        }
        Ok(report)
    }

    /// Model parameters
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Model being trained
    pub fn network(&self) -> &GerbilizerNetwork {
        &self.network
    }

    /// Mean per-instance loss over one batch
    fn batch_loss(&self, audio: &Tensor, locations: &Tensor, train: bool) -> Result<Tensor> {
        let raw = self.network.forward_t(audio, train)?;
        Ok(self.loss.compute(&raw, locations)?.mean_all()?)
    }

    /// One optimisation pass over `loader`, returning the mean batch loss
    pub fn train_epoch(&mut self, loader: &mut DataLoader) -> Result<f64> {
        let pb = self.progress_bar(loader.num_batches() as u64, "train");
        let device = self.device.clone();
        let mut total = 0.0;
        let mut count = 0usize;

        for batch in loader.iter(&device) {
            let batch = batch?;
            let locations = batch
                .locations
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("Training batch has no locations"))?;
            let loss = self.batch_loss(&batch.audio, locations, true)?;
            let value = loss.to_scalar::<f32>()? as f64;
            if !value.is_finite() {
                anyhow::bail!("Training loss became non-finite ({})", value);
            }

            let mut grads = loss.backward()?;
            if self.config.optimization.clip_gradients {
                clip_grad_norm(&self.varmap, &mut grads, MAX_GRAD_NORM)?;
            }
            self.optimizer.step(&grads)?;

            total += value;
            count += 1;
            pb.set_message(format!("loss {:.4}", value));
            pb.inc(1);
        }
        pb.finish_and_clear();

        if count == 0 {
            anyhow::bail!("Training split is empty");
        }
        Ok(total / count as f64)
    }

    /// Mean per-instance loss over `loader` in eval mode; non-finite is an error
    pub fn evaluate(&self, loader: &mut DataLoader) -> Result<f64> {
        let mut total = 0.0;
        let mut count = 0usize;
        for batch in loader.iter(&self.device) {
            let batch = batch?;
            let locations = batch
                .locations
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("Validation batch has no locations"))?;
            let raw = self.network.forward_t(&batch.audio, false)?;
            let losses = self.loss.compute(&raw, locations)?;
            total += losses.sum_all()?.to_scalar::<f32>()? as f64;
            count += batch.len();
        }
        if count == 0 {
            anyhow::bail!("Validation split is empty");
        }
        let mean = total / count as f64;
        if !mean.is_finite() {
            anyhow::bail!("Validation loss is non-finite ({})", mean);
        }
        Ok(mean)
    }

    /// Train for `NUM_EPOCHS`, saving best and final weights plus the run config
    pub fn fit(&mut self, train: &mut DataLoader, val: &mut DataLoader) -> Result<TrainingSummary> {
        let num_epochs = self.config.optimization.num_epochs;
        let best_weights = self.save_path.join(BEST_WEIGHTS_FILE);
        let final_weights = self.save_path.join(FINAL_WEIGHTS_FILE);
        let config_path = self.save_path.join(CONFIG_FILE);

        tracing::info!(
            "Training {} for {} epochs ({} train / {} val batches)",
            self.config.architecture,
            num_epochs,
            train.num_batches(),
            val.num_batches()
        );

        let mut history = Vec::with_capacity(num_epochs);
        let mut best_val_loss = f64::INFINITY;
        let mut best_epoch = 0;

        for epoch in 1..=num_epochs {
            let start = Instant::now();
            let train_loss = self.train_epoch(train)?;
            let val_loss = self.evaluate(val)?;
            tracing::info!(
                "Epoch {}/{}: train loss {:.4}, val loss {:.4} ({:.1}s)",
                epoch,
                num_epochs,
                train_loss,
                val_loss,
                start.elapsed().as_secs_f32()
            );

            if val_loss < best_val_loss || epoch == 1 {
                best_val_loss = val_loss;
                best_epoch = epoch;
                save_weights(&self.varmap, &best_weights)?;
                tracing::debug!("New best weights at epoch {}", epoch);
            }
            history.push(EpochStats {
                epoch,
                train_loss,
                val_loss,
            });
        }

        save_weights(&self.varmap, &final_weights)?;
        if num_epochs == 0 {
            save_weights(&self.varmap, &best_weights)?;
        }

        let mut run_config = self.config.with_resolved_params()?;
        run_config.weights_path = Some(best_weights.clone());
        run_config.save(&config_path)?;
        tracing::info!(
            "Best val loss {:.4} at epoch {}; outputs in {:?}",
            best_val_loss,
            best_epoch,
            self.save_path
        );

        Ok(TrainingSummary {
            history,
            best_epoch,
            best_val_loss,
            best_weights,
            final_weights,
            config_path,
        })
    }

    fn progress_bar(&self, len: u64, prefix: &str) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len);
        let template = "{prefix} [{bar:30.cyan/blue}] {pos}/{len} {msg}";
        if let Ok(style) = ProgressStyle::default_bar().template(template) {
            pb.set_style(style.progress_chars("=> "));
        }
        pb.set_prefix(prefix.to_string());
        pb
    }
}

/// Scale gradients so that their global L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping; a non-finite norm is an error.
pub fn clip_grad_norm(varmap: &VarMap, grads: &mut GradStore, max_norm: f64) -> Result<f64> {
    let vars = varmap.all_vars();
    let mut sq_sum = 0.0f64;
    for var in &vars {
        if let Some(g) = grads.get(var) {
            sq_sum += g.sqr()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        }
    }
    let norm = sq_sum.sqrt();
    if !norm.is_finite() {
        anyhow::bail!("Gradient norm is non-finite ({})", norm);
    }

    let scale = max_norm / (norm + 1e-6);
    if scale < 1.0 {
        for var in &vars {
            if let Some(g) = grads.remove(var) {
                grads.insert(var, (g * scale)?);
            }
        }
    }
    Ok(norm)
}
