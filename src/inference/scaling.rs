//! Mapping network output back to arena coordinates
//!
//! The network works on the `[-1, 1]^2` square. Arena coordinates are
//! millimetres with the origin at a corner, given by the affine map
//! `z = A y + b` with `A = diag(width, length) / 2` and `b = (width, length) / 2`.
//! A covariance `Sigma = L L^T` becomes `A Sigma A^T`.

use crate::utils::mat2::{self, Mat2};

/// One unscaled prediction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    /// Location in millimetres
    pub mean: [f64; 2],
    /// Covariance in square millimetres, for covariance models
    pub cov: Option<Mat2>,
}

fn affine(arena_dims: [f32; 2]) -> (Mat2, [f64; 2]) {
    let (w, l) = (arena_dims[0] as f64, arena_dims[1] as f64);
    ([[0.5 * w, 0.0], [0.0, 0.5 * l]], [0.5 * w, 0.5 * l])
}

/// Map a scaled mean and optional Cholesky factor to arena units
pub fn unscale_output(mean: [f64; 2], cholesky: Option<&Mat2>, arena_dims: [f32; 2]) -> Prediction {
    let (a, b) = affine(arena_dims);
    let mean = [a[0][0] * mean[0] + b[0], a[1][1] * mean[1] + b[1]];
    let cov = cholesky.map(|l| {
        let sigma = mat2::mul(l, &mat2::transpose(l));
        mat2::mul(&mat2::mul(&a, &sigma), &mat2::transpose(&a))
    });
    Prediction { mean, cov }
}

/// Map a scaled label to arena units
pub fn unscale_location(location: [f32; 2], arena_dims: [f32; 2]) -> [f64; 2] {
    unscale_output([location[0] as f64, location[1] as f64], None, arena_dims).mean
}
