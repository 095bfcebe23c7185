//! Calibration of Gaussian location predictions
//!
//! For each event the model predicts a mean and covariance in arena units.
//! A truth lies inside the `p`-level Gaussian region when its squared
//! Mahalanobis distance is at most the chi-square (2 dof) quantile
//! `-2 ln(1 - p)`.

use anyhow::Result;
use std::f64::consts::PI;

use crate::utils::mat2::{self, Mat2};

/// Probability levels of the calibration curve
pub const CALIBRATION_LEVELS: [f64; 10] = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0];

/// Mass of the reported confidence set
pub const CONFIDENCE_LEVEL: f64 = 0.95;

/// Points sampled on the confidence ellipse boundary
const BOUNDARY_POINTS: usize = 256;

/// Chi-square quantile with two degrees of freedom
pub fn chi2_quantile_2dof(p: f64) -> f64 {
    if p >= 1.0 {
        f64::INFINITY
    } else {
        -2.0 * (1.0 - p).ln()
    }
}

/// Per-event and aggregate assessment results
#[derive(Debug, Clone)]
pub struct CalibrationResults {
    /// Fraction of truths inside the region of each level in [`CALIBRATION_LEVELS`]
    pub calibration_curve: Vec<f64>,
    /// Area of each 95% confidence ellipse
    pub confidence_set_areas: Vec<f64>,
    /// Whether each truth lies in its 95% ellipse
    pub location_in_confidence_set: Vec<bool>,
    /// Distance from each truth to the furthest point of its 95% ellipse
    pub distances_to_furthest_point: Vec<f64>,
    /// Mean Euclidean distance between means and truths
    pub mean_error: f64,
}

/// Accumulates calibration statistics one event at a time
#[derive(Debug, Clone, Default)]
pub struct CalibrationAccumulator {
    level_counts: [usize; CALIBRATION_LEVELS.len()],
    areas: Vec<f64>,
    in_set: Vec<bool>,
    furthest: Vec<f64>,
    error_sum: f64,
}

impl CalibrationAccumulator {
    /// Empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Events seen so far
    pub fn len(&self) -> usize {
        self.areas.len()
    }

    /// Whether no events were seen
    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    /// Record one prediction against its true location, all in arena units
    pub fn calculate_step(&mut self, mean: [f64; 2], cov: &Mat2, truth: [f64; 2]) -> Result<()> {
        let inv = mat2::inverse(cov)
            .ok_or_else(|| anyhow::anyhow!("Covariance {:?} is singular", cov))?;
        let chol = mat2::cholesky(cov)
            .ok_or_else(|| anyhow::anyhow!("Covariance {:?} is not positive definite", cov))?;

        let d = [truth[0] - mean[0], truth[1] - mean[1]];
        let m2 = mat2::quad_form(&inv, d);
        for (count, &p) in self.level_counts.iter_mut().zip(CALIBRATION_LEVELS.iter()) {
            if m2 <= chi2_quantile_2dof(p) {
                *count += 1;
            }
        }

        let q = chi2_quantile_2dof(CONFIDENCE_LEVEL);
        self.areas.push(PI * q * mat2::det(cov).sqrt());
        self.in_set.push(m2 <= q);

        let r = q.sqrt();
        let furthest = (0..BOUNDARY_POINTS)
            .map(|k| {
                let theta = 2.0 * PI * k as f64 / BOUNDARY_POINTS as f64;
                let (u0, u1) = (r * theta.cos(), r * theta.sin());
                let px = mean[0] + chol[0][0] * u0;
                let py = mean[1] + chol[1][0] * u0 + chol[1][1] * u1;
                (px - truth[0]).hypot(py - truth[1])
            })
            .fold(0.0f64, f64::max);
        self.furthest.push(furthest);

        self.error_sum += d[0].hypot(d[1]);
        Ok(())
    }

    /// Summarise everything recorded
    pub fn results(&self) -> CalibrationResults {
        let n = self.len().max(1) as f64;
        CalibrationResults {
            calibration_curve: self.level_counts.iter().map(|&c| c as f64 / n).collect(),
            confidence_set_areas: self.areas.clone(),
            location_in_confidence_set: self.in_set.clone(),
            distances_to_furthest_point: self.furthest.clone(),
            mean_error: self.error_sum / n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDENTITY: Mat2 = [[1.0, 0.0], [0.0, 1.0]];

    #[test]
    fn test_quantiles() {
        assert!((chi2_quantile_2dof(0.95) - 5.991464547107979).abs() < 1e-12);
        assert!(chi2_quantile_2dof(1.0).is_infinite());
    }

    #[test]
    fn test_step_inside_and_outside() {
        let mut acc = CalibrationAccumulator::new();
        acc.calculate_step([0.0, 0.0], &IDENTITY, [0.0, 0.0]).unwrap();
        acc.calculate_step([0.0, 0.0], &IDENTITY, [3.0, 0.0]).unwrap();
        let res = acc.results();

        assert_eq!(res.location_in_confidence_set, vec![true, false]);
        // every level contains the exact hit; only p = 1.0 contains the miss
        assert_eq!(res.calibration_curve[0], 0.5);
        assert_eq!(res.calibration_curve[9], 1.0);
        assert!((res.mean_error - 1.5).abs() < 1e-12);
        assert!((res.confidence_set_areas[0] - PI * 5.991464547107979).abs() < 1e-9);
    }

    #[test]
    fn test_furthest_point_on_circle() {
        let mut acc = CalibrationAccumulator::new();
        acc.calculate_step([10.0, 10.0], &IDENTITY, [10.0, 10.0]).unwrap();
        let r = chi2_quantile_2dof(CONFIDENCE_LEVEL).sqrt();
        assert!((acc.results().distances_to_furthest_point[0] - r).abs() < 1e-9);

        // From the centre of an axis-aligned ellipse the furthest point is
        // the end of the major axis
        let mut acc = CalibrationAccumulator::new();
        acc.calculate_step([0.0, 0.0], &[[16.0, 0.0], [0.0, 1.0]], [0.0, 0.0]).unwrap();
        assert!((acc.results().distances_to_furthest_point[0] - 4.0 * r).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_singular_covariance() {
        let mut acc = CalibrationAccumulator::new();
        assert!(acc
            .calculate_step([0.0, 0.0], &[[1.0, 1.0], [1.0, 1.0]], [0.0, 0.0])
            .is_err());
        assert!(acc.is_empty());
    }
}
