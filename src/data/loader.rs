//! Training samples and batching

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::path::Path;

use super::augment::{flip_horizontal, flip_vertical, sample_segment, scale_audio, scale_location};
use super::store::{VocalizationFile, VocalizationSource};
use super::xcorr::append_xcorr;
use crate::config::GerbilizerConfig;

/// Training split file name inside a data directory
pub const TRAIN_FILE: &str = "train_set.h5";
/// Validation split file name
pub const VAL_FILE: &str = "val_set.h5";
/// Test split file name (optional)
pub const TEST_FILE: &str = "test_set.h5";

/// How samples are built from raw events
#[derive(Debug, Clone)]
pub struct DatasetOptions {
    /// Samples per segment
    pub segment_len: usize,
    /// Arena width and length in millimetres
    pub arena_dims: [f32; 2],
    /// Number of microphone channels expected in the data
    pub n_mics: usize,
    /// Append pairwise cross-correlations
    pub make_xcorrs: bool,
    /// Randomly mirror about the horizontal axis
    pub flip_vert: bool,
    /// Randomly mirror about the vertical axis
    pub flip_horiz: bool,
}

impl DatasetOptions {
    /// Options for evaluation data (no augmentation)
    pub fn from_config(config: &GerbilizerConfig) -> Self {
        Self {
            segment_len: config.data.sample_len,
            arena_dims: config.arena_dims(),
            n_mics: config.data.num_microphones,
            make_xcorrs: config.data.compute_xcorrs,
            flip_vert: false,
            flip_horiz: false,
        }
    }

    /// Options for the training split, with augmentation as configured
    pub fn training(config: &GerbilizerConfig) -> Self {
        Self {
            flip_vert: config.data.flip_vert(),
            flip_horiz: config.data.flip_horiz(),
            ..Self::from_config(config)
        }
    }
}

/// One network input and its scaled label
#[derive(Debug, Clone)]
pub struct Sample {
    /// Shape `(channels, segment_len)`
    pub audio: Array2<f32>,
    /// Location scaled to `[-1, 1]`
    pub location: Option<[f32; 2]>,
}

/// Sound events turned into fixed-length, scaled network inputs
pub struct VocalizationDataset {
    source: Box<dyn VocalizationSource>,
    options: DatasetOptions,
}

impl VocalizationDataset {
    /// Wrap a source, checking that it matches the options
    pub fn new(source: Box<dyn VocalizationSource>, options: DatasetOptions) -> Result<Self> {
        if source.n_channels() != options.n_mics {
            anyhow::bail!(
                "Data has {} channels but NUM_MICROPHONES is {}",
                source.n_channels(),
                options.n_mics
            );
        }
        if (options.flip_vert || options.flip_horiz) && options.n_mics != 4 {
            anyhow::bail!(
                "Flip augmentation requires 4 microphones, found {}",
                options.n_mics
            );
        }
        if options.segment_len == 0 {
            anyhow::bail!("SAMPLE_LEN must be positive");
        }
        Ok(Self { source, options })
    }

    /// Open an HDF5 dataset file
    pub fn open<P: AsRef<Path>>(path: P, options: DatasetOptions) -> Result<Self> {
        let file = VocalizationFile::open(path)?;
        Self::new(Box::new(file), options)
    }

    /// Number of events
    pub fn len(&self) -> usize {
        self.source.len()
    }

    /// Whether the dataset is empty
    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }

    /// Whether labels are available
    pub fn has_locations(&self) -> bool {
        self.source.has_locations()
    }

    /// Channels per sample after xcorr expansion
    pub fn sample_channels(&self) -> usize {
        let n = self.options.n_mics;
        if self.options.make_xcorrs {
            n + n * n.saturating_sub(1) / 2
        } else {
            n
        }
    }

    /// Build options
    pub fn options(&self) -> &DatasetOptions {
        &self.options
    }

    /// Build the sample for event `idx`
    pub fn get<R: Rng>(&self, idx: usize, rng: &mut R) -> Result<Sample> {
        let raw = self.source.audio(idx)?;
        let mut audio = sample_segment(raw.view(), self.options.segment_len, rng);
        if self.options.make_xcorrs {
            audio = append_xcorr(audio.view());
        }
        scale_audio(&mut audio, self.options.n_mics);

        let mut location = self
            .source
            .location(idx)?
            .map(|loc| scale_location(loc, self.options.arena_dims));

        if self.options.flip_vert && rng.gen_bool(0.5) {
            (audio, location) = flip_vertical(&audio, location)?;
        }
        if self.options.flip_horiz && rng.gen_bool(0.5) {
            (audio, location) = flip_horizontal(&audio, location)?;
        }

        Ok(Sample { audio, location })
    }
}

/// A batch of samples on a device
#[derive(Debug, Clone)]
pub struct Batch {
    /// Shape `(batch, channels, segment_len)`
    pub audio: Tensor,
    /// Shape `(batch, 2)` when the data is labelled
    pub locations: Option<Tensor>,
    /// Event indices in batch order
    pub indices: Vec<usize>,
}

impl Batch {
    /// Stack samples into tensors
    pub fn collate(samples: &[Sample], indices: Vec<usize>, device: &Device) -> Result<Self> {
        let first = samples
            .first()
            .ok_or_else(|| anyhow::anyhow!("Cannot collate an empty batch"))?;
        let (channels, len) = first.audio.dim();

        let mut audio = Vec::with_capacity(samples.len() * channels * len);
        for sample in samples {
            if sample.audio.dim() != (channels, len) {
                anyhow::bail!(
                    "Sample shape {:?} does not match {:?}",
                    sample.audio.dim(),
                    (channels, len)
                );
            }
            audio.extend(sample.audio.iter().copied());
        }
        let audio = Tensor::from_vec(audio, (samples.len(), channels, len), device)?;

        let locations = if samples.iter().all(|s| s.location.is_some()) {
            let flat: Vec<f32> = samples
                .iter()
                .flat_map(|s| s.location.unwrap_or_default())
                .collect();
            Some(Tensor::from_vec(flat, (samples.len(), 2), device)?)
        } else {
            None
        };

        Ok(Self {
            audio,
            locations,
            indices,
        })
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Whether the batch is empty
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Batches a dataset, optionally shuffling each pass
pub struct DataLoader {
    dataset: VocalizationDataset,
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
}

impl DataLoader {
    /// Create a loader; `seed` drives both shuffling and segment sampling
    pub fn new(dataset: VocalizationDataset, batch_size: usize, shuffle: bool, seed: u64) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Underlying dataset
    pub fn dataset(&self) -> &VocalizationDataset {
        &self.dataset
    }

    /// Number of batches per pass
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// One pass over the data
    pub fn iter<'a>(&'a mut self, device: &'a Device) -> BatchIter<'a> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }
        BatchIter {
            loader: self,
            device,
            order,
            pos: 0,
        }
    }
}

/// Iterator over the batches of one pass
pub struct BatchIter<'a> {
    loader: &'a mut DataLoader,
    device: &'a Device,
    order: Vec<usize>,
    pos: usize,
}

impl Iterator for BatchIter<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.order.len() {
            return None;
        }
        let end = (self.pos + self.loader.batch_size).min(self.order.len());
        let indices = self.order[self.pos..end].to_vec();
        self.pos = end;

        let loader = &mut *self.loader;
        let batch = indices
            .iter()
            .map(|&idx| loader.dataset.get(idx, &mut loader.rng))
            .collect::<Result<Vec<_>>>()
            .and_then(|samples| Batch::collate(&samples, indices, self.device));
        Some(batch)
    }
}

/// Loaders for each split of a data directory
pub struct DataLoaders {
    pub train: DataLoader,
    pub val: DataLoader,
    pub test: Option<DataLoader>,
}

/// Open `train_set.h5`, `val_set.h5` and (if present) `test_set.h5` under `data_dir`
pub fn build_dataloaders<P: AsRef<Path>>(
    data_dir: P,
    config: &GerbilizerConfig,
) -> Result<DataLoaders> {
    let data_dir = data_dir.as_ref();
    if !data_dir.is_dir() {
        anyhow::bail!(
            "Training data must be a directory holding {} and {}: {:?}",
            TRAIN_FILE,
            VAL_FILE,
            data_dir
        );
    }
    let opt = &config.optimization;

    let train =
        VocalizationDataset::open(data_dir.join(TRAIN_FILE), DatasetOptions::training(config))
            .context("Failed to load training split")?;
    let val =
        VocalizationDataset::open(data_dir.join(VAL_FILE), DatasetOptions::from_config(config))
            .context("Failed to load validation split")?;
    for (name, ds) in [("training", &train), ("validation", &val)] {
        if !ds.has_locations() {
            anyhow::bail!(
                "The {} split has no `locations`; labels are required for training",
                name
            );
        }
    }

    let test_path = data_dir.join(TEST_FILE);
    let test = if test_path.is_file() {
        let ds = VocalizationDataset::open(&test_path, DatasetOptions::from_config(config))
            .context("Failed to load test split")?;
        Some(DataLoader::new(ds, opt.val_batch_size, false, opt.seed.wrapping_add(2)))
    } else {
        None
    };

    tracing::info!(
        "Loaded {} training / {} validation events from {:?}",
        train.len(),
        val.len(),
        data_dir
    );

    Ok(DataLoaders {
        train: DataLoader::new(train, opt.train_batch_size, true, opt.seed),
        val: DataLoader::new(val, opt.val_batch_size, false, opt.seed.wrapping_add(1)),
        test,
    })
}
