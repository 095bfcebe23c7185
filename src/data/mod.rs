//! Dataset access and sample construction
//!
//! - HDF5 dataset reading and schema validation
//! - Segment sampling, cross-correlation channels, scaling, mirror flips
//! - Batching into candle tensors

mod augment;
mod loader;
mod store;
mod xcorr;

pub use augment::{
    channel_permutation, flip_horizontal, flip_vertical, sample_segment, scale_audio,
    scale_location, FLIP_HORIZ_MICS, FLIP_VERT_MICS,
};
pub use loader::{
    build_dataloaders, Batch, DataLoader, DataLoaders, DatasetOptions, Sample,
    VocalizationDataset, TEST_FILE, TRAIN_FILE, VAL_FILE,
};
pub use store::{
    validate_length_index, InMemoryVocalizations, VocalizationFile, VocalizationSource,
    AUDIO_KEY, LENGTH_IDX_KEY, LOCATIONS_KEY,
};
pub use xcorr::{append_xcorr, mic_pairs, CrossCorrelator};
