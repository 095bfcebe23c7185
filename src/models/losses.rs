//! Per-instance loss functions
//!
//! Every loss maps `(raw_output, target)` to a `(batch,)` tensor; the
//! trainer averages it.

use anyhow::Result;
use candle_core::{IndexOp, Tensor};

use super::output::GaussianOutput;
use crate::config::CovRegularization;

/// Loss paired with a model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalizationLoss {
    /// Squared Euclidean error of the predicted location
    SquaredError,
    /// Gaussian negative log-likelihood, optionally regularized
    GaussianNll(Option<CovRegularization>),
}

impl LocalizationLoss {
    /// Per-instance loss for raw output and `(batch, 2)` targets
    pub fn compute(&self, raw: &Tensor, target: &Tensor) -> Result<Tensor> {
        match self {
            Self::SquaredError => se_loss(raw, target),
            Self::GaussianNll(reg) => {
                let out = GaussianOutput::from_raw(raw)?;
                let nll = gaussian_nll(&out, target)?;
                match reg {
                    None => Ok(nll),
                    Some(CovRegularization::HalfNormal) => Ok((nll + half_normal_penalty(&out)?)?),
                    Some(CovRegularization::Entropy) => Ok((nll + (log_det(&out)? * 0.5)?)?),
                }
            }
        }
    }
}

/// `|pred - target|^2` summed over x and y
pub fn se_loss(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    Ok((pred - target)?.sqr()?.sum(1)?)
}

/// `log det Sigma = 2 (ln L00 + ln L11)`
pub fn log_det(out: &GaussianOutput) -> Result<Tensor> {
    Ok(((out.l00.log()? + out.l11.log()?)? * 2.0)?)
}

/// Squared Mahalanobis distance `d^T Sigma^-1 d` via forward substitution
pub fn mahalanobis_sq(out: &GaussianOutput, target: &Tensor) -> Result<Tensor> {
    let diff = (target - &out.mean)?;
    let d0 = diff.i((.., 0))?;
    let d1 = diff.i((.., 1))?;
    let z0 = (d0 / &out.l00)?;
    let z1 = ((d1 - (&out.l10 * &z0)?)? / &out.l11)?;
    Ok((z0.sqr()? + z1.sqr()?)?)
}

/// `0.5 * (log det Sigma + d^T Sigma^-1 d)`
pub fn gaussian_nll(out: &GaussianOutput, target: &Tensor) -> Result<Tensor> {
    let total = (log_det(out)? + mahalanobis_sq(out, target)?)?;
    Ok((total * 0.5)?)
}

/// Half-normal prior on the variances: `0.5 * (Sigma00^2 + Sigma11^2)`
pub fn half_normal_penalty(out: &GaussianOutput) -> Result<Tensor> {
    let var_x = out.l00.sqr()?;
    let var_y = (out.l10.sqr()? + out.l11.sqr()?)?;
    Ok(((var_x.sqr()? + var_y.sqr()?)? * 0.5)?)
}
