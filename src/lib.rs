//! # Gerbilizer
//!
//! Sound source localization from multi-channel microphone recordings.
//! Convolutional networks regress the location of a vocalizing animal in a
//! rectangular arena, optionally with a Gaussian uncertainty estimate.
//!
//! ## Features
//!
//! - HDF5 dataset reading with schema validation
//! - Segment sampling, cross-correlation channels and mirror augmentation
//! - Gated convolutional networks via Candle
//! - Training with AdamW, gradient clipping and best-weights checkpoints
//! - Prediction and calibration assessment
//! - SLURM batch submission
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use gerbilizer::{build_dataloaders, GerbilizerConfig, Trainer};
//!
//! let config = GerbilizerConfig::resolve("default")?;
//! let mut loaders = build_dataloaders("data/", &config)?;
//! let mut trainer = Trainer::new(config, candle_core::Device::Cpu, "runs/default")?;
//! trainer.fit(&mut loaders.train, &mut loaders.val)?;
//! ```

// Require docs for public items, but not struct fields (too verbose)
#![warn(missing_docs)]
#![allow(rustdoc::missing_crate_level_docs)]

pub mod assess;
pub mod config;
pub mod data;
pub mod inference;
pub mod job;
pub mod models;
pub mod training;
pub mod utils;

// Re-exports for convenience
pub use assess::{assess_model, CalibrationAccumulator};
pub use config::GerbilizerConfig;
pub use data::{build_dataloaders, VocalizationDataset, VocalizationFile};
pub use inference::{write_predictions, Predictor};
pub use job::{JobError, JobRequest, SlurmResources};
pub use models::{build_model, Architecture, GerbilizerNetwork};
pub use training::Trainer;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
