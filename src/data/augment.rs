//! Segment sampling, feature scaling and mirror augmentation
//!
//! The four-microphone arena is laid out as
//!
//! ```text
//!     1-------------0
//!     |             |
//!     |             |
//!     2-------------3
//! ```
//!
//! so mirroring the arena about its horizontal axis swaps mics 0<->3 and
//! 1<->2, and mirroring about its vertical axis swaps 0<->1 and 2<->3.

use anyhow::Result;
use ndarray::{s, Array2, ArrayView2, Axis};
use rand::Rng;

use super::xcorr::mic_pairs;

/// Fraction of each event excluded from either end when sampling a segment
pub const SEGMENT_MARGIN: f64 = 0.1;

/// Mic permutation applied by a vertical flip (y -> -y)
pub const FLIP_VERT_MICS: [usize; 4] = [3, 2, 1, 0];
/// Mic permutation applied by a horizontal flip (x -> -x)
pub const FLIP_HORIZ_MICS: [usize; 4] = [1, 0, 3, 2];

/// Sample a contiguous segment of `segment_len` samples from `audio`.
///
/// `audio` has shape `(samples, channels)`; the result has shape
/// `(channels, segment_len)`. The start is drawn uniformly from
/// `[margin, n - margin - segment_len)` where `margin` is 10% of the event.
/// Events too short for that are placed whole inside a block of zeros at a
/// random offset in `[-margin, margin)`.
pub fn sample_segment<R: Rng>(
    audio: ArrayView2<f32>,
    segment_len: usize,
    rng: &mut R,
) -> Array2<f32> {
    let (n_samp, n_channels) = audio.dim();
    let margin = (n_samp as f64 * SEGMENT_MARGIN) as usize;

    if n_samp.saturating_sub(2 * margin) <= segment_len {
        let mut padded = Array2::zeros((n_channels, segment_len));
        let offset: isize = if margin > 0 {
            rng.gen_range(-(margin as isize)..margin as isize)
        } else {
            0
        };
        let end = (n_samp as isize + offset).min(segment_len as isize);
        if offset < 0 {
            let src_start = (-offset) as usize;
            let src_end = (end - offset) as usize;
            if end > 0 {
                padded
                    .slice_mut(s![.., ..end as usize])
                    .assign(&audio.slice(s![src_start..src_end, ..]).t());
            }
        } else if end > offset {
            let (dst_start, dst_end) = (offset as usize, end as usize);
            padded
                .slice_mut(s![.., dst_start..dst_end])
                .assign(&audio.slice(s![..dst_end - dst_start, ..]).t());
        }
        return padded;
    }

    let start = rng.gen_range(margin..n_samp - margin - segment_len);
    audio
        .slice(s![start..start + segment_len, ..])
        .t()
        .to_owned()
}

fn mean_std(values: ArrayView2<f32>) -> (f32, f32) {
    let n = values.len();
    if n == 0 {
        return (0.0, 1.0);
    }
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n as f64;
    let var = values
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n as f64;
    let std = var.sqrt();
    // Silent channels would otherwise divide by zero
    let std = if std > f64::EPSILON { std } else { 1.0 };
    (mean as f32, std as f32)
}

/// Scale a `(channels, samples)` segment to zero mean and unit variance.
///
/// The first `n_mics` rows share one mean/std; any remaining (xcorr) rows
/// are scaled with their own joint statistics.
pub fn scale_audio(audio: &mut Array2<f32>, n_mics: usize) {
    let n_mics = n_mics.min(audio.nrows());
    let (mean, std) = mean_std(audio.slice(s![..n_mics, ..]));
    audio
        .slice_mut(s![..n_mics, ..])
        .mapv_inplace(|v| (v - mean) / std);

    if n_mics < audio.nrows() {
        let (mean, std) = mean_std(audio.slice(s![n_mics.., ..]));
        audio
            .slice_mut(s![n_mics.., ..])
            .mapv_inplace(|v| (v - mean) / std);
    }
}

/// Scale a location in millimetres (arena centre at the origin) to `[-1, 1]`
pub fn scale_location(location: [f32; 2], arena_dims: [f32; 2]) -> [f32; 2] {
    [
        location[0] / (arena_dims[0] / 2.0),
        location[1] / (arena_dims[1] / 2.0),
    ]
}

/// Channel permutation for a segment after a mic permutation.
///
/// Xcorr channels follow their pair: the slot for pair `(a, b)` receives the
/// channel of pair `{perm[a], perm[b]}`.
pub fn channel_permutation(mic_perm: &[usize], n_channels: usize) -> Result<Vec<usize>> {
    let n_mics = mic_perm.len();
    let pairs = mic_pairs(n_mics);
    if n_channels == n_mics {
        return Ok(mic_perm.to_vec());
    }
    if n_channels != n_mics + pairs.len() {
        anyhow::bail!(
            "Cannot permute {} channels for {} microphones",
            n_channels,
            n_mics
        );
    }
    let mut order = mic_perm.to_vec();
    for &(a, b) in &pairs {
        let (pa, pb) = (mic_perm[a], mic_perm[b]);
        let key = (pa.min(pb), pa.max(pb));
        let pos = pairs
            .iter()
            .position(|&p| p == key)
            .ok_or_else(|| anyhow::anyhow!("Invalid mic permutation {:?}", mic_perm))?;
        order.push(n_mics + pos);
    }
    Ok(order)
}

fn permute_rows(audio: &Array2<f32>, order: &[usize]) -> Array2<f32> {
    audio.select(Axis(0), order)
}

/// Audio and optional label after a mirror flip
pub type Flipped = (Array2<f32>, Option<[f32; 2]>);

/// Mirror a scaled sample about the arena's horizontal axis
pub fn flip_vertical(audio: &Array2<f32>, location: Option<[f32; 2]>) -> Result<Flipped> {
    let order = channel_permutation(&FLIP_VERT_MICS, audio.nrows())?;
    Ok((permute_rows(audio, &order), location.map(|[x, y]| [x, -y])))
}

/// Mirror a scaled sample about the arena's vertical axis
pub fn flip_horizontal(audio: &Array2<f32>, location: Option<[f32; 2]>) -> Result<Flipped> {
    let order = channel_permutation(&FLIP_HORIZ_MICS, audio.nrows())?;
    Ok((permute_rows(audio, &order), location.map(|[x, y]| [-x, y])))
}
