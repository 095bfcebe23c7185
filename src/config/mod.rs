//! Run configuration
//!
//! Configs are JSON objects with SCREAMING_SNAKE_CASE keys, split into
//! `DATA`, `OPTIMIZATION` and `MODEL_PARAMS` sections. Unknown keys are
//! ignored so that configs written for other tooling still load.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::models::Architecture;

/// Directory searched when a config is given by name instead of by path
pub const CONFIG_DIR: &str = "configs";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct GerbilizerConfig {
    /// Architecture name, e.g. `GerbilizerSimpleNetwork`
    pub architecture: String,
    pub data: DataConfig,
    #[serde(default)]
    pub optimization: OptimizationConfig,
    #[serde(default)]
    pub model_params: ModelParams,
    /// Weights used for `--pretrained` runs and for evaluation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights_path: Option<PathBuf>,
}

/// Dataset and augmentation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct DataConfig {
    #[serde(default = "default_num_microphones")]
    pub num_microphones: usize,
    #[serde(default)]
    pub compute_xcorrs: bool,
    /// Arena width and length in millimetres
    pub arena_dims: [f64; 2],
    #[serde(default = "default_sample_len")]
    pub sample_len: usize,
    #[serde(default)]
    pub augment_labels: bool,
    #[serde(default)]
    pub augment_flip_vert: bool,
    #[serde(default)]
    pub augment_flip_horiz: bool,
}

impl DataConfig {
    /// Number of channels fed to the network, xcorr channels included
    pub fn input_channels(&self) -> usize {
        let n = self.num_microphones;
        if self.compute_xcorrs {
            n + n * n.saturating_sub(1) / 2
        } else {
            n
        }
    }

    /// Whether vertical flips are applied to the training set
    pub fn flip_vert(&self) -> bool {
        self.augment_labels && self.augment_flip_vert
    }

    /// Whether horizontal flips are applied to the training set
    pub fn flip_horiz(&self) -> bool {
        self.augment_labels && self.augment_flip_horiz
    }
}

/// Optimizer and schedule settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct OptimizationConfig {
    pub num_epochs: usize,
    pub train_batch_size: usize,
    pub val_batch_size: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub clip_gradients: bool,
    pub seed: u64,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            num_epochs: 50,
            train_batch_size: 32,
            val_batch_size: 32,
            learning_rate: 3e-4,
            weight_decay: 0.0,
            clip_gradients: true,
            seed: 42,
        }
    }
}

/// Covariance regularization applied on top of the Gaussian NLL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CovRegularization {
    HalfNormal,
    Entropy,
}

/// Model hyperparameters as written in the config file.
///
/// Every field is optional; [`ModelParams::resolve`] fills the gaps from the
/// architecture defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ModelParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_batch_norm: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub should_downsample: Option<Vec<bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conv_filter_sizes: Option<Vec<usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conv_num_channels: Option<Vec<usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conv_dilations: Option<Vec<usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_cov: Option<bool>,
    /// `false`, `"HALF_NORMAL"` or `"ENTROPY"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regularize_cov: Option<serde_json::Value>,
}

/// Fully specified model hyperparameters
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedModelParams {
    pub use_batch_norm: bool,
    pub should_downsample: Vec<bool>,
    pub conv_filter_sizes: Vec<usize>,
    pub conv_num_channels: Vec<usize>,
    pub conv_dilations: Vec<usize>,
    pub output_cov: bool,
    pub regularize_cov: Option<CovRegularization>,
}

impl ResolvedModelParams {
    /// Number of convolutional layers
    pub fn num_layers(&self) -> usize {
        self.conv_num_channels.len()
    }
}

impl ModelParams {
    /// Merge these params over the defaults of `arch`.
    ///
    /// The four per-layer lists are truncated to the shortest one.
    pub fn resolve(&self, arch: Architecture) -> Result<ResolvedModelParams> {
        let defaults = arch.default_params();

        let mut should_downsample = self
            .should_downsample
            .clone()
            .unwrap_or(defaults.should_downsample);
        let mut conv_filter_sizes = self
            .conv_filter_sizes
            .clone()
            .unwrap_or(defaults.conv_filter_sizes);
        let mut conv_num_channels = self
            .conv_num_channels
            .clone()
            .unwrap_or(defaults.conv_num_channels);
        let mut conv_dilations = self
            .conv_dilations
            .clone()
            .unwrap_or(defaults.conv_dilations);

        let min_len = should_downsample
            .len()
            .min(conv_filter_sizes.len())
            .min(conv_num_channels.len())
            .min(conv_dilations.len());
        if min_len == 0 {
            anyhow::bail!("MODEL_PARAMS must describe at least one convolutional layer");
        }
        should_downsample.truncate(min_len);
        conv_filter_sizes.truncate(min_len);
        conv_num_channels.truncate(min_len);
        conv_dilations.truncate(min_len);

        let regularize_cov = match &self.regularize_cov {
            None | Some(serde_json::Value::Null) | Some(serde_json::Value::Bool(false)) => None,
            Some(serde_json::Value::String(s)) if s == "HALF_NORMAL" => {
                Some(CovRegularization::HalfNormal)
            }
            Some(serde_json::Value::String(s)) if s == "ENTROPY" => {
                Some(CovRegularization::Entropy)
            }
            Some(other) => anyhow::bail!(
                "Unrecognized value {} passed as `REGULARIZE_COV` parameter in model config!",
                other
            ),
        };

        Ok(ResolvedModelParams {
            use_batch_norm: self.use_batch_norm.unwrap_or(defaults.use_batch_norm),
            should_downsample,
            conv_filter_sizes,
            conv_num_channels,
            conv_dilations,
            output_cov: self.output_cov.unwrap_or(defaults.output_cov),
            regularize_cov,
        })
    }
}

impl From<&ResolvedModelParams> for ModelParams {
    fn from(p: &ResolvedModelParams) -> Self {
        let regularize_cov = match p.regularize_cov {
            None => serde_json::Value::Bool(false),
            Some(CovRegularization::HalfNormal) => serde_json::Value::from("HALF_NORMAL"),
            Some(CovRegularization::Entropy) => serde_json::Value::from("ENTROPY"),
        };
        Self {
            use_batch_norm: Some(p.use_batch_norm),
            should_downsample: Some(p.should_downsample.clone()),
            conv_filter_sizes: Some(p.conv_filter_sizes.clone()),
            conv_num_channels: Some(p.conv_num_channels.clone()),
            conv_dilations: Some(p.conv_dilations.clone()),
            output_cov: Some(p.output_cov),
            regularize_cov: Some(regularize_cov),
        }
    }
}

impl GerbilizerConfig {
    /// Load a config from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_json(&content).with_context(|| format!("Failed to parse config: {:?}", path))
    }

    /// Parse a config from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Resolve a config given either as a path or as a name under [`CONFIG_DIR`]
    pub fn resolve(path_or_name: &str) -> Result<Self> {
        Self::load(Self::locate(path_or_name, Path::new(CONFIG_DIR))?)
    }

    /// Find the file a config argument refers to
    pub fn locate(path_or_name: &str, config_dir: &Path) -> Result<PathBuf> {
        let direct = PathBuf::from(path_or_name);
        if direct.is_file() {
            return Ok(direct);
        }
        let named = config_dir.join(format!("{}.json", path_or_name));
        if named.is_file() {
            return Ok(named);
        }
        anyhow::bail!(
            "Requested config could not be found: {} (also tried {:?})",
            path_or_name,
            named
        )
    }

    /// Parsed architecture
    pub fn architecture(&self) -> Result<Architecture> {
        self.architecture.parse()
    }

    /// Model params with architecture defaults filled in
    pub fn resolved_model_params(&self) -> Result<ResolvedModelParams> {
        self.model_params.resolve(self.architecture()?)
    }

    /// Arena dimensions as `f32`
    pub fn arena_dims(&self) -> [f32; 2] {
        [self.data.arena_dims[0] as f32, self.data.arena_dims[1] as f32]
    }

    /// Copy of this config with model params replaced by the resolved ones,
    /// so that saved runs keep working if the defaults change.
    pub fn with_resolved_params(&self) -> Result<Self> {
        let resolved = self.resolved_model_params()?;
        let mut out = self.clone();
        out.model_params = ModelParams::from(&resolved);
        Ok(out)
    }

    /// Write the config as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write config: {:?}", path))
    }
}

fn default_num_microphones() -> usize {
    4
}

fn default_sample_len() -> usize {
    8192
}
