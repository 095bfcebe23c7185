//! Pairwise microphone cross-correlation

use ndarray::{s, Array2, ArrayView1, ArrayView2};
use rustfft::{num_complex::Complex, FftPlanner};

/// All unordered microphone pairs `(a, b)` with `a < b`, in lexicographic order
pub fn mic_pairs(n_mics: usize) -> Vec<(usize, usize)> {
    let mut pairs = Vec::with_capacity(n_mics * n_mics.saturating_sub(1) / 2);
    for a in 0..n_mics {
        for b in (a + 1)..n_mics {
            pairs.push((a, b));
        }
    }
    pairs
}

/// Cross-correlator for fixed-length traces
pub struct CrossCorrelator {
    len: usize,
    fft_len: usize,
    planner: FftPlanner<f32>,
}

impl CrossCorrelator {
    /// Create a correlator for traces of `len` samples
    pub fn new(len: usize) -> Self {
        // Linear (non-circular) correlation needs room for 2n - 1 lags
        let fft_len = (2 * len).saturating_sub(1).max(1).next_power_of_two();
        Self {
            len,
            fft_len,
            planner: FftPlanner::new(),
        }
    }

    /// 'same'-mode cross-correlation of `a` with `b`.
    ///
    /// Output sample `i` holds `sum_j a[j + m] * b[j]` for lag
    /// `m = i - len / 2` (integer division), so the zero-lag term sits at
    /// the centre.
    pub fn correlate(&mut self, a: ArrayView1<f32>, b: ArrayView1<f32>) -> Vec<f32> {
        let n = self.len;
        if n == 0 {
            return Vec::new();
        }
        let fft = self.planner.plan_fft_forward(self.fft_len);
        let ifft = self.planner.plan_fft_inverse(self.fft_len);

        let mut fa = padded(a, self.fft_len);
        let mut fb = padded(b, self.fft_len);
        fft.process(&mut fa);
        fft.process(&mut fb);

        let mut prod: Vec<Complex<f32>> = fa
            .iter()
            .zip(fb.iter())
            .map(|(x, y)| x * y.conj())
            .collect();
        ifft.process(&mut prod);

        let scale = 1.0 / self.fft_len as f32;
        let first_lag = (n as isize - 1) / 2 - (n as isize - 1);
        (0..n)
            .map(|i| {
                let lag = first_lag + i as isize;
                let idx = lag.rem_euclid(self.fft_len as isize) as usize;
                prod[idx].re * scale
            })
            .collect()
    }
}

fn padded(x: ArrayView1<f32>, len: usize) -> Vec<Complex<f32>> {
    let mut out = vec![Complex::new(0.0, 0.0); len];
    for (dst, &src) in out.iter_mut().zip(x.iter()) {
        dst.re = src;
    }
    out
}

/// Append one cross-correlation channel per microphone pair.
///
/// Input has shape `(n_mics, samples)`; output has
/// `(n_mics + C(n_mics, 2), samples)` with the original traces first.
pub fn append_xcorr(audio: ArrayView2<f32>) -> Array2<f32> {
    let (n_mics, len) = audio.dim();
    let pairs = mic_pairs(n_mics);
    let mut out = Array2::zeros((n_mics + pairs.len(), len));
    out.slice_mut(s![..n_mics, ..]).assign(&audio);

    let mut correlator = CrossCorrelator::new(len);
    for (k, (a, b)) in pairs.into_iter().enumerate() {
        let corr = correlator.correlate(audio.row(a), audio.row(b));
        out.row_mut(n_mics + k)
            .iter_mut()
            .zip(corr)
            .for_each(|(dst, v)| *dst = v);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1};

    /// Direct O(n^2) evaluation of the same lags
    fn correlate_direct(a: &[f32], b: &[f32]) -> Vec<f32> {
        let n = a.len() as isize;
        let first_lag = (n - 1) / 2 - (n - 1);
        (0..n)
            .map(|i| {
                let lag = first_lag + i;
                (0..n)
                    .filter_map(|j| {
                        let k = j + lag;
                        (k >= 0 && k < n).then(|| a[k as usize] * b[j as usize])
                    })
                    .sum()
            })
            .collect()
    }

    #[test]
    fn test_mic_pairs_order() {
        assert_eq!(
            mic_pairs(4),
            vec![(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)]
        );
        assert!(mic_pairs(1).is_empty());
    }

    #[test]
    fn test_fft_matches_direct() {
        for n in [1usize, 2, 5, 8, 13] {
            let a: Vec<f32> = (0..n).map(|i| ((i * 7) % 5) as f32 - 2.0).collect();
            let b: Vec<f32> = (0..n).map(|i| ((i * 3) % 4) as f32 * 0.5).collect();
            let mut c = CrossCorrelator::new(n);
            let fast = c.correlate(Array1::from(a.clone()).view(), Array1::from(b.clone()).view());
            let slow = correlate_direct(&a, &b);
            for (x, y) in fast.iter().zip(slow.iter()) {
                assert!((x - y).abs() < 1e-4, "n={} fast={} slow={}", n, x, y);
            }
        }
    }

    #[test]
    fn test_matches_known_same_mode_output() {
        // correlate([1, 2, 3], [0, 1, 0.5], 'same') == [2.0, 3.5, 3.0]
        let mut c = CrossCorrelator::new(3);
        let out = c.correlate(array![1.0f32, 2.0, 3.0].view(), array![0.0f32, 1.0, 0.5].view());
        let expected = [2.0, 3.5, 3.0];
        for (x, y) in out.iter().zip(expected.iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_append_xcorr_shape() {
        let audio = Array2::from_shape_fn((4, 32), |(c, t)| ((c + 1) * t) as f32 * 0.01);
        let out = append_xcorr(audio.view());
        assert_eq!(out.dim(), (10, 32));
        assert_eq!(out.row(2), audio.row(2));
    }
}
