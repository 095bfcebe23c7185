//! Model training
//!
//! - Training loop with AdamW and gradient clipping
//! - Weight checkpoints and non-strict pretrained loading

mod checkpoint;
mod trainer;

pub use checkpoint::{
    load_pretrained, load_weights, save_weights, LoadReport, BEST_WEIGHTS_FILE, CONFIG_FILE,
    FINAL_WEIGHTS_FILE,
};
pub use trainer::{clip_grad_norm, EpochStats, Trainer, TrainingSummary, MAX_GRAD_NORM};
