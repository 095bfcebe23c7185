//! Utility functions and helpers for Gerbilizer
//!
//! This module provides common utilities used across the crate.

/// Tensor utilities
pub mod tensor_utils {
    use candle_core::{Device, Result, Tensor};

    /// Numerically stable softplus: `max(x, 0) + ln(1 + exp(-|x|))`
    pub fn softplus(x: &Tensor) -> Result<Tensor> {
        let tail = (x.abs()?.neg()?.exp()? + 1.0)?.log()?;
        x.relu()? + tail
    }

    /// CUDA device 0 when available and not disabled, CPU otherwise
    pub fn select_device(force_cpu: bool) -> Result<Device> {
        if force_cpu {
            Ok(Device::Cpu)
        } else {
            Device::cuda_if_available(0)
        }
    }

    /// Copy a `(batch, 2)` tensor to host rows
    pub fn to_pairs(t: &Tensor) -> Result<Vec<[f32; 2]>> {
        Ok(t
            .to_vec2::<f32>()?
            .into_iter()
            .map(|row| [row[0], row[1]])
            .collect())
    }
}

/// Small 2x2 linear algebra on host values
pub mod mat2 {
    /// Row-major 2x2 matrix
    pub type Mat2 = [[f64; 2]; 2];

    /// Determinant
    pub fn det(m: &Mat2) -> f64 {
        m[0][0] * m[1][1] - m[0][1] * m[1][0]
    }

    /// `a * b`
    pub fn mul(a: &Mat2, b: &Mat2) -> Mat2 {
        let mut out = [[0.0; 2]; 2];
        for (i, row) in out.iter_mut().enumerate() {
            for (j, v) in row.iter_mut().enumerate() {
                *v = a[i][0] * b[0][j] + a[i][1] * b[1][j];
            }
        }
        out
    }

    /// Transpose
    pub fn transpose(m: &Mat2) -> Mat2 {
        [[m[0][0], m[1][0]], [m[0][1], m[1][1]]]
    }

    /// Inverse, `None` when singular
    pub fn inverse(m: &Mat2) -> Option<Mat2> {
        let d = det(m);
        if d.abs() < f64::MIN_POSITIVE {
            return None;
        }
        Some([[m[1][1] / d, -m[0][1] / d], [-m[1][0] / d, m[0][0] / d]])
    }

    /// Lower-triangular Cholesky factor of a symmetric positive-definite matrix
    pub fn cholesky(m: &Mat2) -> Option<Mat2> {
        if m[0][0] <= 0.0 {
            return None;
        }
        let l00 = m[0][0].sqrt();
        let l10 = m[1][0] / l00;
        let rest = m[1][1] - l10 * l10;
        if rest <= 0.0 {
            return None;
        }
        Some([[l00, 0.0], [l10, rest.sqrt()]])
    }

    /// Quadratic form `v^T m v`
    pub fn quad_form(m: &Mat2, v: [f64; 2]) -> f64 {
        v[0] * (m[0][0] * v[0] + m[0][1] * v[1]) + v[1] * (m[1][0] * v[0] + m[1][1] * v[1])
    }
}
