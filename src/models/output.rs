//! Interpreting raw network output
//!
//! A location-only model emits `(batch, 2)`. A covariance model emits
//! `(batch, 5)`: the mean followed by the three free entries of a
//! lower-triangular Cholesky factor `L`, with the diagonal passed through a
//! softplus so that `Sigma = L L^T` is positive definite.

use anyhow::Result;
use candle_core::{IndexOp, Tensor};

use crate::utils::mat2::Mat2;
use crate::utils::tensor_utils::softplus;

/// Floor added to the Cholesky diagonal
pub const MIN_CHOLESKY_DIAG: f64 = 1e-3;

/// What the readout layer predicts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// `(x, y)` only
    Location,
    /// `(x, y)` plus a Cholesky factor of the covariance
    LocationWithCovariance,
}

impl OutputKind {
    /// From the `OUTPUT_COV` flag
    pub fn from_output_cov(output_cov: bool) -> Self {
        if output_cov {
            Self::LocationWithCovariance
        } else {
            Self::Location
        }
    }

    /// Width of the readout layer
    pub fn n_outputs(&self) -> usize {
        match self {
            Self::Location => 2,
            Self::LocationWithCovariance => 5,
        }
    }
}

/// Mean and Cholesky factor split out of a `(batch, 5)` output
pub struct GaussianOutput {
    /// `(batch, 2)`
    pub mean: Tensor,
    /// `(batch,)` positive
    pub l00: Tensor,
    /// `(batch,)`
    pub l10: Tensor,
    /// `(batch,)` positive
    pub l11: Tensor,
}

impl GaussianOutput {
    /// Split a raw `(batch, 5)` tensor
    pub fn from_raw(raw: &Tensor) -> Result<Self> {
        let (_, width) = raw.dims2()?;
        if width != 5 {
            anyhow::bail!("Expected 5 outputs per sample for a covariance model, got {}", width);
        }
        let mean = raw.narrow(1, 0, 2)?;
        let l00 = (softplus(&raw.i((.., 2))?)? + MIN_CHOLESKY_DIAG)?;
        let l10 = raw.i((.., 3))?;
        let l11 = (softplus(&raw.i((.., 4))?)? + MIN_CHOLESKY_DIAG)?;
        Ok(Self { mean, l00, l10, l11 })
    }

    /// Cholesky factors as a `(batch, 2, 2)` tensor
    pub fn cholesky(&self) -> Result<Tensor> {
        let zeros = self.l00.zeros_like()?;
        let row0 = Tensor::stack(&[&self.l00, &zeros], 1)?;
        let row1 = Tensor::stack(&[&self.l10, &self.l11], 1)?;
        Ok(Tensor::stack(&[&row0, &row1], 1)?)
    }

    /// Host copies as `(mean, L)` pairs
    pub fn to_host(&self) -> Result<Vec<([f64; 2], Mat2)>> {
        let mean = self.mean.to_vec2::<f32>()?;
        let l00 = self.l00.to_vec1::<f32>()?;
        let l10 = self.l10.to_vec1::<f32>()?;
        let l11 = self.l11.to_vec1::<f32>()?;
        Ok((0..mean.len())
            .map(|i| {
                (
                    [mean[i][0] as f64, mean[i][1] as f64],
                    [[l00[i] as f64, 0.0], [l10[i] as f64, l11[i] as f64]],
                )
            })
            .collect())
    }
}
