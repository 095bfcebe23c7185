//! Gated convolution layer

use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{BatchNorm, Conv1d, Conv1dConfig, Module, ModuleT, VarBuilder};

/// Slope of the linear leak added to the tanh branch
const TANH_LEAK: f64 = 0.05;

/// Shape of one gated layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatedLayerSpec {
    pub in_channels: usize,
    pub out_channels: usize,
    pub filter_size: usize,
    pub downsample: bool,
    pub dilation: usize,
}

impl GatedLayerSpec {
    /// Stride of both convolutions
    pub fn stride(&self) -> usize {
        if self.downsample {
            2
        } else {
            1
        }
    }

    /// Output length for an input of `len` samples, `None` if the input is
    /// shorter than the receptive field
    pub fn output_len(&self, len: usize) -> Option<usize> {
        let span = self.dilation * (self.filter_size - 1) + 1;
        (len >= span).then(|| (len - span) / self.stride() + 1)
    }
}

/// `BN((tanh(f(x)) + 0.05 * f(x)) * sigmoid(g(x)))` with unpadded `f`, `g`
pub struct GatedConvLayer {
    fc: Conv1d,
    gc: Conv1d,
    batch_norm: Option<BatchNorm>,
    spec: GatedLayerSpec,
}

impl GatedConvLayer {
    /// Create the layer, registering weights under `vb`
    pub fn new(spec: GatedLayerSpec, use_batch_norm: bool, vb: VarBuilder) -> Result<Self> {
        if spec.filter_size == 0 || spec.dilation == 0 {
            anyhow::bail!("Filter size and dilation must be positive: {:?}", spec);
        }
        let conv = |name: &str| {
            let cfg = Conv1dConfig {
                padding: 0,
                stride: spec.stride(),
                dilation: spec.dilation,
                ..Default::default()
            };
            candle_nn::conv1d(
                spec.in_channels,
                spec.out_channels,
                spec.filter_size,
                cfg,
                vb.pp(name),
            )
        };
        let fc = conv("fc")?;
        let gc = conv("gc")?;
        let batch_norm = if use_batch_norm {
            Some(candle_nn::batch_norm(
                spec.out_channels,
                candle_nn::BatchNormConfig::default(),
                vb.pp("batch_norm"),
            )?)
        } else {
            None
        };
        Ok(Self {
            fc,
            gc,
            batch_norm,
            spec,
        })
    }

    /// Layer shape
    pub fn spec(&self) -> &GatedLayerSpec {
        &self.spec
    }

    /// Input `(batch, in_channels, len)`, output `(batch, out_channels, len')`
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let fcx = self.fc.forward(x)?;
        let gate = candle_nn::ops::sigmoid(&self.gc.forward(x)?)?;
        let h = (fcx.tanh()? + (&fcx * TANH_LEAK)?)?;
        let h = (h * gate)?;
        match &self.batch_norm {
            Some(bn) => Ok(bn.forward_t(&h, train)?),
            None => Ok(h),
        }
    }
}
