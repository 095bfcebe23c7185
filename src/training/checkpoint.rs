//! Saving weights and loading pretrained weights
//!
//! Pretrained loading is non-strict: tensors whose names and shapes match the
//! model are copied, everything else is reported so that mismatched
//! checkpoints do not fall back to random weights silently.

use anyhow::{Context, Result};
use candle_core::{safetensors, Device};
use candle_nn::VarMap;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// File name of the lowest-validation-loss weights
pub const BEST_WEIGHTS_FILE: &str = "best_weights.safetensors";
/// File name of the weights after the last epoch
pub const FINAL_WEIGHTS_FILE: &str = "final_weights.safetensors";
/// File name of the saved run config
pub const CONFIG_FILE: &str = "config.json";

/// What a pretrained load did
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// Source file
    pub file_path: PathBuf,
    /// Model tensors overwritten from the file
    pub loaded: BTreeSet<String>,
    /// Model tensors absent from the file
    pub missing: BTreeSet<String>,
    /// File tensors with no counterpart in the model
    pub unexpected: BTreeSet<String>,
    /// Present in both but with different shapes, left untouched
    pub shape_mismatched: BTreeSet<String>,
}

impl LoadReport {
    /// Fraction of model tensors that were loaded
    pub fn success_rate(&self) -> f32 {
        let expected = self.loaded.len() + self.missing.len() + self.shape_mismatched.len();
        if expected == 0 {
            return 1.0;
        }
        self.loaded.len() as f32 / expected as f32
    }

    /// Whether every model tensor was loaded
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.shape_mismatched.is_empty()
    }

    /// Log a summary, listing at most ten names per category
    pub fn log_summary(&self) {
        tracing::info!(
            "Pretrained weights {:?}: {:.0}% loaded ({} tensors)",
            self.file_path,
            self.success_rate() * 100.0,
            self.loaded.len()
        );
        for (label, keys) in [
            ("missing", &self.missing),
            ("unexpected", &self.unexpected),
            ("shape mismatch", &self.shape_mismatched),
        ] {
            if keys.is_empty() {
                continue;
            }
            let shown: Vec<&str> = keys.iter().take(10).map(String::as_str).collect();
            tracing::warn!("  {} {}: {:?}", keys.len(), label, shown);
        }
    }
}

/// Copy matching tensors from a safetensors file into `varmap`
pub fn load_pretrained<P: AsRef<Path>>(
    varmap: &VarMap,
    path: P,
    device: &Device,
) -> Result<LoadReport> {
    let path = path.as_ref();
    let tensors = safetensors::load(path, device)
        .with_context(|| format!("Failed to read pretrained weights: {:?}", path))?;

    let mut report = LoadReport {
        file_path: path.to_path_buf(),
        ..Default::default()
    };

    let vars = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("Model parameters are poisoned by a panicked thread"))?;
    for (name, var) in vars.iter() {
        match tensors.get(name) {
            None => {
                report.missing.insert(name.clone());
            }
            Some(t) if t.dims() != var.dims() => {
                tracing::debug!("{}: file {:?} vs model {:?}", name, t.dims(), var.dims());
                report.shape_mismatched.insert(name.clone());
            }
            Some(t) => {
                var.set(&t.to_dtype(var.dtype())?)
                    .with_context(|| format!("Failed to assign {}", name))?;
                report.loaded.insert(name.clone());
            }
        }
    }
    report.unexpected = tensors
        .keys()
        .filter(|k| !vars.contains_key(*k))
        .cloned()
        .collect();

    Ok(report)
}

/// Write all parameters, batch norm statistics included
pub fn save_weights<P: AsRef<Path>>(varmap: &VarMap, path: P) -> Result<()> {
    let path = path.as_ref();
    varmap
        .save(path)
        .with_context(|| format!("Failed to save weights: {:?}", path))
}

/// Load weights saved by [`save_weights`], requiring every tensor to match
pub fn load_weights<P: AsRef<Path>>(varmap: &VarMap, path: P, device: &Device) -> Result<()> {
    let report = load_pretrained(varmap, path, device)?;
    if !report.is_complete() {
        report.log_summary();
        anyhow::bail!(
            "Weights {:?} do not match the model: {} missing, {} with wrong shape",
            report.file_path,
            report.missing.len(),
            report.shape_mismatched.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Tensor};
    use candle_nn::{Init, VarBuilder};

    fn varmap_with(shapes: &[(&str, usize)], value: f64) -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        for (name, n) in shapes {
            vb.get_with_hints(*n, name, Init::Const(value)).unwrap();
        }
        varmap
    }

    #[test]
    fn test_non_strict_load_reports_mismatches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.safetensors");
        let source = varmap_with(&[("a", 3), ("b", 2), ("extra", 1)], 7.0);
        save_weights(&source, &path).unwrap();

        let target = varmap_with(&[("a", 3), ("b", 4), ("c", 1)], 0.0);
        let report = load_pretrained(&target, &path, &Device::Cpu).unwrap();

        assert_eq!(report.loaded.iter().collect::<Vec<_>>(), vec!["a"]);
        assert!(report.shape_mismatched.contains("b"));
        assert!(report.missing.contains("c"));
        assert!(report.unexpected.contains("extra"));
        assert!(!report.is_complete());

        let a: Tensor = target.data().lock().unwrap()["a"].as_tensor().clone();
        assert_eq!(a.to_vec1::<f32>().unwrap(), vec![7.0; 3]);
        assert!(load_weights(&target, &path, &Device::Cpu).is_err());
    }

    #[test]
    fn test_strict_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.safetensors");
        save_weights(&varmap_with(&[("w", 4)], 1.5), &path).unwrap();

        let target = varmap_with(&[("w", 4)], 0.0);
        load_weights(&target, &path, &Device::Cpu).unwrap();
        let w = target.data().lock().unwrap()["w"].as_tensor().clone();
        assert_eq!(w.to_vec1::<f32>().unwrap(), vec![1.5; 4]);
    }
}
