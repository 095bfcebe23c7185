//! Inference with trained models
//!
//! - Predictor: batched eval-mode forward passes over a dataset
//! - Unscaling of outputs to arena millimetres
//! - Writing the `predictions` output file

mod predictor;
mod scaling;

pub use predictor::{
    split_output, write_predictions, PredictionSet, Predictor, ScaledOutput, PREDICTIONS_KEY,
};
pub use scaling::{unscale_location, unscale_output, Prediction};
