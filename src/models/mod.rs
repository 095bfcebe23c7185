//! Neural network models for sound source localization
//!
//! This module contains:
//! - Gated convolution layers
//! - The simple and log-domain network architectures
//! - Output interpretation (location, Cholesky factor)
//! - Loss functions

mod layers;
pub mod losses;
pub mod output;
mod simplenet;

use anyhow::Result;
use candle_nn::VarBuilder;
use std::fmt;
use std::str::FromStr;

use crate::config::{GerbilizerConfig, ResolvedModelParams};

// Re-exports
pub use layers::{GatedConvLayer, GatedLayerSpec};
pub use losses::LocalizationLoss;
pub use output::{GaussianOutput, OutputKind};
pub use simplenet::{layer_specs, GerbilizerNetwork};

/// Supported architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    /// `GerbilizerSimpleNetwork`
    SimpleNetwork,
    /// `GerbilizerLogSimpleNetwork`
    LogSimpleNetwork,
}

impl Architecture {
    /// Name as written in configs
    pub fn name(&self) -> &'static str {
        match self {
            Self::SimpleNetwork => "GerbilizerSimpleNetwork",
            Self::LogSimpleNetwork => "GerbilizerLogSimpleNetwork",
        }
    }

    /// Whether the first layer runs in the log domain
    pub fn log_input(&self) -> bool {
        matches!(self, Self::LogSimpleNetwork)
    }

    /// Hyperparameters used when `MODEL_PARAMS` leaves a field out
    pub fn default_params(&self) -> ResolvedModelParams {
        match self {
            Self::SimpleNetwork => ResolvedModelParams {
                use_batch_norm: true,
                should_downsample: vec![false, true, true, true, true, true, false],
                conv_filter_sizes: vec![19, 7, 39, 41, 23, 29, 33],
                conv_num_channels: vec![16, 16, 16, 32, 32, 32, 64],
                conv_dilations: vec![1; 7],
                output_cov: true,
                regularize_cov: None,
            },
            Self::LogSimpleNetwork => ResolvedModelParams {
                use_batch_norm: true,
                should_downsample: [false, true].repeat(5),
                conv_filter_sizes: vec![33; 10],
                conv_num_channels: vec![16, 16, 32, 32, 64, 64, 128, 128, 256, 256],
                conv_dilations: vec![1; 10],
                output_cov: true,
                regularize_cov: None,
            },
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Architecture {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "GerbilizerSimpleNetwork" => Ok(Self::SimpleNetwork),
            "GerbilizerLogSimpleNetwork" => Ok(Self::LogSimpleNetwork),
            other => anyhow::bail!("ARCHITECTURE {} not recognized.", other),
        }
    }
}

/// Build the configured network and the loss it is trained with.
///
/// Fails if `SAMPLE_LEN` is shorter than the network's receptive field.
pub fn build_model(
    config: &GerbilizerConfig,
    vb: VarBuilder,
) -> Result<(GerbilizerNetwork, LocalizationLoss)> {
    let arch = config.architecture()?;
    let params = config.resolved_model_params()?;
    let network =
        GerbilizerNetwork::new(config.data.input_channels(), &params, arch.log_input(), vb)?;

    let min_len = network.min_input_len();
    if config.data.sample_len < min_len {
        anyhow::bail!(
            "SAMPLE_LEN {} is shorter than the receptive field of {} ({} samples)",
            config.data.sample_len,
            arch,
            min_len
        );
    }

    let loss = if params.output_cov {
        LocalizationLoss::GaussianNll(params.regularize_cov)
    } else {
        LocalizationLoss::SquaredError
    };

    tracing::debug!(
        "Built {} with {} layers, {} input channels, loss {:?}",
        arch,
        params.num_layers(),
        network.input_channels(),
        loss
    );
    Ok((network, loss))
}
