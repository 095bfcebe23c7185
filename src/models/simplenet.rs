//! Gated convolutional localization networks
//!
//! Architecture:
//! - Input: (batch, channels, samples)
//! - Stack of gated convolution layers, optionally downsampling
//! - Global average pool over time
//! - Linear readout of the location, or location plus Cholesky factor

use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{Linear, Module, VarBuilder};

use super::layers::{GatedConvLayer, GatedLayerSpec};
use super::output::OutputKind;
use crate::config::ResolvedModelParams;

/// Offset keeping the log-domain input finite
const LOG_EPS: f64 = 1e-6;

/// Convolutional network regressing a source location from audio
pub struct GerbilizerNetwork {
    layers: Vec<GatedConvLayer>,
    readout: Linear,
    log_input: bool,
    output: OutputKind,
    input_channels: usize,
}

impl GerbilizerNetwork {
    /// Build the network, registering weights under `vb`.
    ///
    /// With `log_input` the first layer sees `log|x + 1e-6|` and its output
    /// is exponentiated.
    pub fn new(
        input_channels: usize,
        params: &ResolvedModelParams,
        log_input: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        if input_channels == 0 {
            anyhow::bail!("Network needs at least one input channel");
        }
        let specs = layer_specs(input_channels, params);
        let conv_vb = vb.pp("conv_layers");
        let layers = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| GatedConvLayer::new(*spec, params.use_batch_norm, conv_vb.pp(i)))
            .collect::<Result<Vec<_>>>()?;

        let output = OutputKind::from_output_cov(params.output_cov);
        let last_channels = specs
            .last()
            .map(|s| s.out_channels)
            .unwrap_or(input_channels);
        let readout = candle_nn::linear(last_channels, output.n_outputs(), vb.pp("coord_readout"))?;

        Ok(Self {
            layers,
            readout,
            log_input,
            output,
            input_channels,
        })
    }

    /// What the readout predicts
    pub fn output_kind(&self) -> OutputKind {
        self.output
    }

    /// Expected input channels
    pub fn input_channels(&self) -> usize {
        self.input_channels
    }

    /// Shortest input that still leaves one sample after the last layer
    pub fn min_input_len(&self) -> usize {
        self.layers.iter().rev().fold(1, |need, layer| {
            let spec = layer.spec();
            let span = spec.dilation * (spec.filter_size - 1) + 1;
            (need - 1) * spec.stride() + span
        })
    }

    /// Time steps remaining after the conv stack, `None` if `len` is too short
    pub fn output_len(&self, len: usize) -> Option<usize> {
        self.layers
            .iter()
            .try_fold(len, |l, layer| layer.spec().output_len(l))
    }

    /// Raw output `(batch, 2)` or `(batch, 5)`
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (_, channels, len) = x.dims3()?;
        if channels != self.input_channels {
            anyhow::bail!(
                "Expected {} input channels, got {}",
                self.input_channels,
                channels
            );
        }
        if self.output_len(len).is_none() {
            anyhow::bail!(
                "Input of {} samples is shorter than the receptive field ({} samples)",
                len,
                self.min_input_len()
            );
        }

        let mut h = x.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            h = if i == 0 && self.log_input {
                let logged = (h + LOG_EPS)?.abs()?.log()?;
                layer.forward_t(&logged, train)?.exp()?
            } else {
                layer.forward_t(&h, train)?
            };
        }

        let pooled = h.mean(2)?;
        Ok(self.readout.forward(&pooled)?)
    }
}

/// Per-layer shapes for a parameter set
pub fn layer_specs(input_channels: usize, params: &ResolvedModelParams) -> Vec<GatedLayerSpec> {
    let mut in_channels = input_channels;
    (0..params.num_layers())
        .map(|i| {
            let spec = GatedLayerSpec {
                in_channels,
                out_channels: params.conv_num_channels[i],
                filter_size: params.conv_filter_sizes[i],
                downsample: params.should_downsample[i],
                dilation: params.conv_dilations[i],
            };
            in_channels = spec.out_channels;
            spec
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_params(output_cov: bool) -> ResolvedModelParams {
        ResolvedModelParams {
            use_batch_norm: true,
            should_downsample: vec![false, true, true],
            conv_filter_sizes: vec![5, 5, 3],
            conv_num_channels: vec![8, 8, 16],
            conv_dilations: vec![1, 2, 1],
            output_cov,
            regularize_cov: None,
        }
    }

    fn build(params: &ResolvedModelParams, log_input: bool) -> GerbilizerNetwork {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        GerbilizerNetwork::new(4, params, log_input, vb).unwrap()
    }

    #[test]
    fn test_layer_specs_chain_channels() {
        let specs = layer_specs(10, &small_params(true));
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].in_channels, 10);
        assert_eq!(specs[1].in_channels, 8);
        assert_eq!(specs[2].in_channels, 8);
        assert_eq!(specs[2].out_channels, 16);
    }

    #[test]
    fn test_output_shapes() {
        let x = Tensor::randn(0.0f32, 1.0, (3, 4, 64), &Device::Cpu).unwrap();
        let cov = build(&small_params(true), false);
        assert_eq!(cov.forward_t(&x, true).unwrap().dims(), &[3, 5]);
        let loc = build(&small_params(false), false);
        assert_eq!(loc.forward_t(&x, false).unwrap().dims(), &[3, 2]);
    }

    #[test]
    fn test_log_network_forward_is_finite() {
        let net = build(&small_params(true), true);
        let x = Tensor::randn(0.0f32, 1.0, (2, 4, 48), &Device::Cpu).unwrap();
        let y = net.forward_t(&x, false).unwrap();
        let values = y.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_min_input_len_is_tight() {
        let net = build(&small_params(true), false);
        let min = net.min_input_len();
        assert_eq!(net.output_len(min), Some(1));
        assert_eq!(net.output_len(min - 1), None);

        let short = Tensor::zeros((1, 4, min - 1), DType::F32, &Device::Cpu).unwrap();
        assert!(net.forward_t(&short, false).is_err());
    }

    #[test]
    fn test_rejects_wrong_channel_count() {
        let net = build(&small_params(false), false);
        let x = Tensor::zeros((1, 6, 64), DType::F32, &Device::Cpu).unwrap();
        assert!(net.forward_t(&x, false).is_err());
    }
}
