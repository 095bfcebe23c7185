//! Vocalization dataset files
//!
//! A dataset holds every sound event concatenated along the time axis of a
//! single `audio` array, plus a `length_idx` array of `n + 1` offsets that
//! delimits event `i` as `audio[length_idx[i]..length_idx[i + 1]]`.
//! `locations` holds one `(x, y)` pair per event and is only needed for
//! training and assessment.

use anyhow::{Context, Result};
use hdf5::File;
use ndarray::{s, Array2, ArrayView2};
use std::path::{Path, PathBuf};

/// Name of the concatenated audio dataset
pub const AUDIO_KEY: &str = "audio";
/// Name of the event offset dataset
pub const LENGTH_IDX_KEY: &str = "length_idx";
/// Name of the per-event location dataset
pub const LOCATIONS_KEY: &str = "locations";

// Older recordings were packed under these names
const LEGACY_AUDIO_KEY: &str = "vocalizations";
const LEGACY_LENGTH_IDX_KEY: &str = "len_idx";

/// Random access to sound events and their labels
pub trait VocalizationSource {
    /// Number of sound events
    fn len(&self) -> usize;

    /// Number of microphone channels
    fn n_channels(&self) -> usize;

    /// Whether per-event locations are available
    fn has_locations(&self) -> bool;

    /// Audio for event `idx`, shape `(samples, channels)`
    fn audio(&self, idx: usize) -> Result<Array2<f32>>;

    /// Location of event `idx` in millimetres, arena centre at the origin
    fn location(&self, idx: usize) -> Result<Option<[f32; 2]>>;

    /// Whether the source holds no events
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Check the `length_idx` invariants and convert to `usize` offsets.
///
/// The index must be non-empty, start at 0, never decrease and never point
/// past the end of the audio buffer.
pub fn validate_length_index(length_idx: &[i64], audio_rows: usize) -> Result<Vec<usize>> {
    let first = *length_idx
        .first()
        .ok_or_else(|| anyhow::anyhow!("{} is empty", LENGTH_IDX_KEY))?;
    if first != 0 {
        anyhow::bail!("{} must start at 0, found {}", LENGTH_IDX_KEY, first);
    }
    for (i, pair) in length_idx.windows(2).enumerate() {
        if pair[1] < pair[0] {
            anyhow::bail!(
                "{} decreases at position {} ({} -> {})",
                LENGTH_IDX_KEY,
                i + 1,
                pair[0],
                pair[1]
            );
        }
    }
    let last = *length_idx.last().unwrap_or(&0);
    if last as usize > audio_rows {
        anyhow::bail!(
            "{} ends at {} but audio only has {} samples",
            LENGTH_IDX_KEY,
            last,
            audio_rows
        );
    }
    Ok(length_idx.iter().map(|&v| v as usize).collect())
}

fn validate_locations(shape: &[usize], n_events: usize) -> Result<()> {
    if shape.len() != 2 || shape[1] != 2 {
        anyhow::bail!("{} must have shape (n, 2), found {:?}", LOCATIONS_KEY, shape);
    }
    if shape[0] != n_events {
        anyhow::bail!(
            "{} has {} rows but {} describes {} events",
            LOCATIONS_KEY,
            shape[0],
            LENGTH_IDX_KEY,
            n_events
        );
    }
    Ok(())
}

/// HDF5-backed dataset. Audio is read lazily, one event at a time.
pub struct VocalizationFile {
    path: PathBuf,
    file: File,
    audio_key: &'static str,
    length_idx: Vec<usize>,
    locations: Option<Array2<f32>>,
    n_channels: usize,
    total_samples: usize,
}

impl VocalizationFile {
    /// Open and validate a dataset file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open dataset file: {:?}", path))?;

        let (audio_key, length_key) = if file.link_exists(AUDIO_KEY) {
            (AUDIO_KEY, LENGTH_IDX_KEY)
        } else if file.link_exists(LEGACY_AUDIO_KEY) {
            (LEGACY_AUDIO_KEY, LEGACY_LENGTH_IDX_KEY)
        } else {
            anyhow::bail!("Dataset {:?} has no `{}` dataset", path, AUDIO_KEY);
        };

        let audio = file
            .dataset(audio_key)
            .with_context(|| format!("Failed to open `{}` in {:?}", audio_key, path))?;
        let audio_shape = audio.shape();
        if audio_shape.len() != 2 {
            anyhow::bail!(
                "`{}` must be 2-D (samples, channels), found shape {:?}",
                audio_key,
                audio_shape
            );
        }
        let (total_samples, n_channels) = (audio_shape[0], audio_shape[1]);

        let raw_index: Vec<i64> = file
            .dataset(length_key)
            .and_then(|ds| ds.read_raw::<i64>())
            .with_context(|| format!("Failed to read `{}` from {:?}", length_key, path))?;
        let length_idx = validate_length_index(&raw_index, total_samples)
            .with_context(|| format!("Invalid dataset {:?}", path))?;
        let n_events = length_idx.len() - 1;

        let locations = if file.link_exists(LOCATIONS_KEY) {
            let ds = file.dataset(LOCATIONS_KEY)?;
            validate_locations(&ds.shape(), n_events)
                .with_context(|| format!("Invalid dataset {:?}", path))?;
            let locations = ds
                .read_2d::<f32>()
                .with_context(|| format!("Failed to read `{}` from {:?}", LOCATIONS_KEY, path))?;
            Some(locations)
        } else {
            None
        };

        tracing::debug!(
            "Opened {:?}: {} events, {} channels, {} samples",
            path,
            n_events,
            n_channels,
            total_samples
        );

        Ok(Self {
            path: path.to_path_buf(),
            file,
            audio_key,
            length_idx,
            locations,
            n_channels,
            total_samples,
        })
    }

    /// Write an in-memory dataset to a new HDF5 file
    pub fn create<P: AsRef<Path>>(path: P, data: &InMemoryVocalizations) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Failed to create dataset file: {:?}", path))?;
        file.new_dataset_builder()
            .with_data(&data.audio)
            .create(AUDIO_KEY)?;
        let length_idx: Vec<i64> = data.length_idx.iter().map(|&v| v as i64).collect();
        file.new_dataset_builder()
            .with_data(length_idx.as_slice())
            .create(LENGTH_IDX_KEY)?;
        if let Some(locations) = &data.locations {
            file.new_dataset_builder()
                .with_data(locations)
                .create(LOCATIONS_KEY)?;
        }
        Ok(())
    }

    /// Path this dataset was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total number of audio samples across all events
    pub fn total_samples(&self) -> usize {
        self.total_samples
    }

    /// Event boundaries
    pub fn length_idx(&self) -> &[usize] {
        &self.length_idx
    }
}

impl VocalizationSource for VocalizationFile {
    fn len(&self) -> usize {
        self.length_idx.len() - 1
    }

    fn n_channels(&self) -> usize {
        self.n_channels
    }

    fn has_locations(&self) -> bool {
        self.locations.is_some()
    }

    fn audio(&self, idx: usize) -> Result<Array2<f32>> {
        if idx >= self.len() {
            anyhow::bail!("Event index {} out of range ({} events)", idx, self.len());
        }
        let (start, end) = (self.length_idx[idx], self.length_idx[idx + 1]);
        let ds = self.file.dataset(self.audio_key)?;
        ds.read_slice_2d::<f32, _>(s![start..end, ..])
            .with_context(|| format!("Failed to read event {} from {:?}", idx, self.path))
    }

    fn location(&self, idx: usize) -> Result<Option<[f32; 2]>> {
        location_row(self.locations.as_ref(), idx, self.len())
    }
}

/// Dataset held entirely in memory
#[derive(Debug, Clone)]
pub struct InMemoryVocalizations {
    audio: Array2<f32>,
    length_idx: Vec<usize>,
    locations: Option<Array2<f32>>,
}

impl InMemoryVocalizations {
    /// Build from raw arrays, applying the same checks as [`VocalizationFile::open`]
    pub fn new(
        audio: Array2<f32>,
        length_idx: Vec<i64>,
        locations: Option<Array2<f32>>,
    ) -> Result<Self> {
        let length_idx = validate_length_index(&length_idx, audio.nrows())?;
        if let Some(locations) = &locations {
            validate_locations(locations.shape(), length_idx.len() - 1)?;
        }
        Ok(Self {
            audio,
            length_idx,
            locations,
        })
    }

    /// Build from a list of per-event `(samples, channels)` arrays
    pub fn from_events(events: &[Array2<f32>], locations: Option<Array2<f32>>) -> Result<Self> {
        let n_channels = events.first().map(|e| e.ncols()).unwrap_or(0);
        let views: Vec<ArrayView2<f32>> = events.iter().map(|e| e.view()).collect();
        let audio = if views.is_empty() {
            Array2::zeros((0, n_channels))
        } else {
            ndarray::concatenate(ndarray::Axis(0), &views)
                .context("Events must all have the same number of channels")?
        };
        let mut length_idx = Vec::with_capacity(events.len() + 1);
        length_idx.push(0i64);
        for event in events {
            let last = *length_idx.last().unwrap_or(&0);
            length_idx.push(last + event.nrows() as i64);
        }
        Self::new(audio, length_idx, locations)
    }
}

impl VocalizationSource for InMemoryVocalizations {
    fn len(&self) -> usize {
        self.length_idx.len() - 1
    }

    fn n_channels(&self) -> usize {
        self.audio.ncols()
    }

    fn has_locations(&self) -> bool {
        self.locations.is_some()
    }

    fn audio(&self, idx: usize) -> Result<Array2<f32>> {
        if idx >= self.len() {
            anyhow::bail!("Event index {} out of range ({} events)", idx, self.len());
        }
        let (start, end) = (self.length_idx[idx], self.length_idx[idx + 1]);
        Ok(self.audio.slice(s![start..end, ..]).to_owned())
    }

    fn location(&self, idx: usize) -> Result<Option<[f32; 2]>> {
        location_row(self.locations.as_ref(), idx, self.len())
    }
}

fn location_row(
    locations: Option<&Array2<f32>>,
    idx: usize,
    len: usize,
) -> Result<Option<[f32; 2]>> {
    if idx >= len {
        anyhow::bail!("Event index {} out of range ({} events)", idx, len);
    }
    Ok(locations.map(|l| [l[[idx, 0]], l[[idx, 1]]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_length_index_must_start_at_zero() {
        let err = validate_length_index(&[1, 4, 8], 8).unwrap_err();
        assert!(err.to_string().contains("start at 0"));
    }

    #[test]
    fn test_length_index_must_not_decrease() {
        let err = validate_length_index(&[0, 5, 3], 8).unwrap_err();
        assert!(err.to_string().contains("decreases"));
    }

    #[test]
    fn test_length_index_within_audio() {
        assert!(validate_length_index(&[0, 4, 9], 8).is_err());
        assert!(validate_length_index(&[], 8).is_err());
        assert_eq!(validate_length_index(&[0, 4, 4, 8], 8).unwrap(), vec![0, 4, 4, 8]);
    }

    #[test]
    fn test_in_memory_events() {
        let audio = Array2::from_shape_fn((10, 2), |(t, c)| (t * 10 + c) as f32);
        let locations = array![[1.0f32, 2.0], [3.0, 4.0]];
        let data = InMemoryVocalizations::new(audio, vec![0, 3, 10], Some(locations)).unwrap();

        assert_eq!(data.len(), 2);
        assert_eq!(data.n_channels(), 2);
        let event = data.audio(1).unwrap();
        assert_eq!(event.dim(), (7, 2));
        assert_eq!(event[[0, 1]], 31.0);
        assert_eq!(data.location(1).unwrap(), Some([3.0, 4.0]));
        assert!(data.audio(2).is_err());
    }

    #[test]
    fn test_location_count_mismatch_rejected() {
        let audio = Array2::zeros((10, 4));
        let locations = Array2::zeros((3, 2));
        let err = InMemoryVocalizations::new(audio, vec![0, 5, 10], Some(locations)).unwrap_err();
        assert!(err.to_string().contains("rows"));
    }

    #[test]
    fn test_from_events() {
        let events = vec![Array2::<f32>::ones((5, 3)), Array2::<f32>::zeros((8, 3))];
        let data = InMemoryVocalizations::from_events(&events, None).unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data.audio(0).unwrap().nrows(), 5);
        assert_eq!(data.audio(1).unwrap().nrows(), 8);
        assert!(!data.has_locations());
        assert_eq!(data.location(0).unwrap(), None);
    }

    #[test]
    fn test_hdf5_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.h5");
        let events = vec![
            Array2::from_shape_fn((6, 4), |(t, c)| (t + c) as f32),
            Array2::from_shape_fn((9, 4), |(t, c)| (t * c) as f32),
        ];
        let locations = array![[-10.0f32, 5.0], [20.0, -7.5]];
        let data = InMemoryVocalizations::from_events(&events, Some(locations)).unwrap();
        VocalizationFile::create(&path, &data).unwrap();

        let file = VocalizationFile::open(&path).unwrap();
        assert_eq!(file.len(), 2);
        assert_eq!(file.n_channels(), 4);
        assert_eq!(file.total_samples(), 15);
        assert_eq!(file.audio(1).unwrap(), events[1]);
        assert_eq!(file.location(0).unwrap(), Some([-10.0, 5.0]));
    }

    #[test]
    fn test_legacy_dataset_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.h5");
        let audio = Array2::from_shape_fn((12, 4), |(t, c)| (t * 4 + c) as f32);
        let locations = array![[1.5f32, -2.0], [30.0, 40.0], [-5.0, 0.0]];
        {
            let file = File::create(&path).unwrap();
            file.new_dataset_builder()
                .with_data(&audio)
                .create(LEGACY_AUDIO_KEY)
                .unwrap();
            file.new_dataset_builder()
                .with_data(&ndarray::arr1(&[0i64, 3, 7, 12]))
                .create(LEGACY_LENGTH_IDX_KEY)
                .unwrap();
            file.new_dataset_builder()
                .with_data(&locations)
                .create(LOCATIONS_KEY)
                .unwrap();
        }

        let file = VocalizationFile::open(&path).unwrap();
        assert_eq!(file.len(), 3);
        assert_eq!(file.n_channels(), 4);
        let event = file.audio(1).unwrap();
        assert_eq!(event.dim(), (4, 4));
        assert_eq!(event[[0, 0]], 12.0);
        assert_eq!(event, audio.slice(ndarray::s![3..7, ..]).to_owned());
        assert_eq!(file.location(1).unwrap(), Some([30.0, 40.0]));
        assert_eq!(file.location(2).unwrap(), Some([-5.0, 0.0]));
    }
}
