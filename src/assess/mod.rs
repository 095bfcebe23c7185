//! Assessment of covariance models on labelled data
//!
//! Writes model output alongside error, confidence-set and calibration
//! metrics to an HDF5 file.

mod calibration;

pub use calibration::{
    chi2_quantile_2dof, CalibrationAccumulator, CalibrationResults, CALIBRATION_LEVELS,
    CONFIDENCE_LEVEL,
};

use anyhow::{Context, Result};
use hdf5::File;
use ndarray::{arr0, Array1, Array2, Array3};
use std::path::Path;

use crate::data::VocalizationDataset;
use crate::inference::{unscale_location, PredictionSet, Predictor};
use crate::models::OutputKind;

/// Summary of an assessment run
#[derive(Debug, Clone)]
pub struct AssessmentSummary {
    pub n_events: usize,
    pub mean_error: f64,
    pub calibration_curve: Vec<f64>,
}

/// Predict every event of `dataset` and write results to `outfile`.
///
/// Datasets written: `raw_output` `(n, 3, 2)` (scaled mean and Cholesky
/// factor), `raw_locations`, `scaled_locations`, `means`, `covs`,
/// `confidence_set_areas`, `location_in_confidence_set`,
/// `distances_to_furthest_point`. Attributes: `mean_error`,
/// `calibration_curve`.
pub fn assess_model<P: AsRef<Path>>(
    predictor: &Predictor,
    dataset: VocalizationDataset,
    outfile: P,
) -> Result<AssessmentSummary> {
    if !dataset.has_locations() {
        anyhow::bail!("Assessment requires a dataset with `locations`");
    }
    let set = predictor.predict(dataset)?;
    if set.kind != OutputKind::LocationWithCovariance {
        anyhow::bail!("Assessment requires a model with OUTPUT_COV enabled");
    }
    write_assessment(&set, predictor.options().arena_dims, outfile)
}

/// Compute metrics for a prediction set and write them to `outfile`
pub fn write_assessment<P: AsRef<Path>>(
    set: &PredictionSet,
    arena_dims: [f32; 2],
    outfile: P,
) -> Result<AssessmentSummary> {
    let outfile = outfile.as_ref();
    let labels = set
        .labels
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("Prediction set has no labels"))?;
    let n = set.len();

    let mut raw_output = Array3::<f64>::zeros((n, 3, 2));
    let mut raw_locations = Array2::<f64>::zeros((n, 2));
    let mut scaled_locations = Array2::<f64>::zeros((n, 2));
    let mut means = Array2::<f64>::zeros((n, 2));
    let mut covs = Array3::<f64>::zeros((n, 2, 2));
    let mut acc = CalibrationAccumulator::new();

    for i in 0..n {
        let scaled = &set.scaled[i];
        let pred = &set.predictions[i];
        let (chol, cov) = match (scaled.cholesky, pred.cov) {
            (Some(l), Some(c)) => (l, c),
            _ => anyhow::bail!("Event {} has no covariance", i),
        };
        let truth = unscale_location(labels[i], arena_dims);

        for j in 0..2 {
            raw_output[[i, 0, j]] = scaled.mean[j];
            raw_locations[[i, j]] = labels[i][j] as f64;
            scaled_locations[[i, j]] = truth[j];
            means[[i, j]] = pred.mean[j];
            for k in 0..2 {
                raw_output[[i, 1 + j, k]] = chol[j][k];
                covs[[i, j, k]] = cov[j][k];
            }
        }
        acc.calculate_step(pred.mean, &cov, truth)
            .with_context(|| format!("Failed to assess event {}", i))?;
    }
    let results = acc.results();

    if let Some(parent) = outfile.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory: {:?}", parent))?;
    }
    let file = File::create(outfile)
        .with_context(|| format!("Failed to create assessment file: {:?}", outfile))?;
    file.new_dataset_builder().with_data(&raw_output).create("raw_output")?;
    file.new_dataset_builder().with_data(&raw_locations).create("raw_locations")?;
    file.new_dataset_builder().with_data(&scaled_locations).create("scaled_locations")?;
    file.new_dataset_builder().with_data(&means).create("means")?;
    file.new_dataset_builder().with_data(&covs).create("covs")?;
    file.new_dataset_builder()
        .with_data(&Array1::from(results.confidence_set_areas.clone()))
        .create("confidence_set_areas")?;
    let in_set: Array1<u8> = results
        .location_in_confidence_set
        .iter()
        .map(|&b| u8::from(b))
        .collect();
    file.new_dataset_builder()
        .with_data(&in_set)
        .create("location_in_confidence_set")?;
    file.new_dataset_builder()
        .with_data(&Array1::from(results.distances_to_furthest_point.clone()))
        .create("distances_to_furthest_point")?;

    file.new_attr_builder()
        .with_data(&arr0(results.mean_error))
        .create("mean_error")?;
    file.new_attr_builder()
        .with_data(&Array1::from(results.calibration_curve.clone()))
        .create("calibration_curve")?;

    let inside = results
        .location_in_confidence_set
        .iter()
        .filter(|&&b| b)
        .count();
    tracing::info!(
        "Assessed {} events: mean error {:.2} mm, {:.1}% inside 95% sets; results in {:?}",
        n,
        results.mean_error,
        100.0 * inside as f64 / n.max(1) as f64,
        outfile
    );

    Ok(AssessmentSummary {
        n_events: n,
        mean_error: results.mean_error,
        calibration_curve: results.calibration_curve,
    })
}
