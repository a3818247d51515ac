//! The immutable model registry and the serving-boundary entry point.
//!
//! All bundles and the shared scaler state are loaded once at process start
//! and passed explicitly into the prediction path; after loading, nothing
//! here mutates, so concurrent readers need no locking. An unknown model
//! identifier is the one unrecoverable request error — everything else the
//! pipeline can degrade around.

use crate::align::{self, AlignError};
use crate::model::{ModelBundle, ModelError};
use crate::preprocess::{self, PreprocessError};
use crate::sanitize;
use crate::scale::{self, ScaleError, ScalerState};
use ndarray::Array1;
use polars::prelude::DataFrame;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// File the shared scaler state persists under, next to the model artifacts.
pub const SCALER_FILE: &str = "scaler.toml";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Model '{0}' is not loaded; predictions unavailable.")]
    UnknownModel(String),
    #[error("Models directory '{0}' could not be read: {1}")]
    ModelsDirUnreadable(String, #[source] std::io::Error),
    #[error("No model artifacts found under '{0}'.")]
    NoModels(String),
    #[error("Failed to load model artifact '{path}': {source}")]
    BundleLoad {
        path: String,
        #[source]
        source: ModelError,
    },
    #[error(transparent)]
    ScaleError(#[from] ScaleError),
}

#[derive(Error, Debug)]
pub enum PredictError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error(transparent)]
    Align(#[from] AlignError),
}

/// One registered model: the persisted bundle plus the scaler state fit
/// alongside it, when one was persisted.
pub struct ModelEntry {
    pub bundle: ModelBundle,
    pub scaler: Option<ScalerState>,
}

/// Read-only mapping from model identifier to its entry.
pub struct ModelRegistry {
    entries: HashMap<String, ModelEntry>,
}

impl ModelRegistry {
    pub fn from_entries(entries: HashMap<String, ModelEntry>) -> Self {
        Self { entries }
    }

    /// Loads every `*.toml` model artifact under `dir` (identifier = file
    /// stem), attaching the shared scaler state from `scaler.toml` if
    /// present. A missing scaler degrades later, at prediction time; a
    /// missing or empty models directory is fatal now.
    pub fn load_dir(dir: &Path) -> Result<Self, RegistryError> {
        let scaler_path = dir.join(SCALER_FILE);
        let scaler = if scaler_path.exists() {
            Some(ScalerState::load(&scaler_path.to_string_lossy())?)
        } else {
            log::warn!(
                "No {} under '{}'; predictions will run on unscaled features",
                SCALER_FILE,
                dir.display()
            );
            None
        };

        let mut entries = HashMap::new();
        let listing = std::fs::read_dir(dir)
            .map_err(|e| RegistryError::ModelsDirUnreadable(dir.display().to_string(), e))?;
        for entry in listing.flatten() {
            let path = entry.path();
            let is_toml = path.extension().is_some_and(|ext| ext == "toml");
            let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                continue;
            };
            if !is_toml || path.file_name().is_some_and(|n| n == SCALER_FILE) {
                continue;
            }
            let bundle =
                ModelBundle::load(&path.to_string_lossy()).map_err(|e| {
                    RegistryError::BundleLoad {
                        path: path.display().to_string(),
                        source: e,
                    }
                })?;
            log::info!(
                "Loaded model '{stem}' ({} features) from '{}'",
                bundle
                    .feature_names
                    .as_ref()
                    .map(|f| f.len())
                    .unwrap_or_else(|| bundle.regressor.num_features()),
                path.display()
            );
            entries.insert(
                stem,
                ModelEntry {
                    bundle,
                    scaler: scaler.clone(),
                },
            );
        }

        if entries.is_empty() {
            return Err(RegistryError::NoModels(dir.display().to_string()));
        }
        Ok(Self { entries })
    }

    pub fn get(&self, model_id: &str) -> Result<&ModelEntry, RegistryError> {
        self.entries
            .get(model_id)
            .ok_or_else(|| RegistryError::UnknownModel(model_id.to_string()))
    }

    pub fn model_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.entries.keys().map(|k| k.as_str()).collect();
        ids.sort_unstable();
        ids
    }
}

/// The outcome handed back across the serving boundary: the sanitized
/// prediction vector plus every degradation the request survived. An empty
/// `degradations` list means the clean path ran end to end.
#[derive(Debug)]
pub struct PredictionReport {
    pub predictions: Array1<f64>,
    pub degradations: Vec<String>,
}

impl PredictionReport {
    pub fn is_degraded(&self) -> bool {
        !self.degradations.is_empty()
    }
}

/// Runs the full serving path for one request: preprocessing, transform-only
/// scaling, feature alignment, model invocation with repair, sanitization.
/// Fails only on an unknown model or an unrecoverable invocation mismatch;
/// every other deviation degrades and is reported.
pub fn predict_rows(
    registry: &ModelRegistry,
    table: DataFrame,
    model_id: &str,
) -> Result<PredictionReport, PredictError> {
    let entry = registry.get(model_id)?;
    let mut degradations = Vec::new();

    let processed = preprocess::preprocess_table(table)?;

    let scaled = match &entry.scaler {
        Some(state) => scale::apply_scaler(&processed, state),
        None => {
            log::warn!("No scaler state for model '{model_id}'; skipping standardization");
            degradations.push("no persisted scaler; features left unscaled".to_string());
            processed
        }
    };

    let (raw, notes) = align::predict_aligned(&scaled, &entry.bundle)?;
    degradations.extend(notes);

    let (predictions, action) = sanitize::sanitize_predictions(&raw);
    if let Some(action) = action {
        degradations.push(action.describe().to_string());
    }

    log::info!(
        "Prediction complete for model '{model_id}': {} rows, {} degradations",
        predictions.len(),
        degradations.len()
    );
    Ok(PredictionReport {
        predictions,
        degradations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LinearModel, Regressor};
    use polars::prelude::*;

    fn linear_bundle(names: &[&str]) -> ModelBundle {
        ModelBundle {
            regressor: Regressor::Linear(LinearModel {
                intercept: 20_000.0,
                coefficients: vec![0.0; names.len()],
            }),
            feature_names: Some(names.iter().map(|s| s.to_string()).collect()),
        }
    }

    fn registry_with(id: &str, bundle: ModelBundle) -> ModelRegistry {
        let mut entries = HashMap::new();
        entries.insert(
            id.to_string(),
            ModelEntry {
                bundle,
                scaler: None,
            },
        );
        ModelRegistry::from_entries(entries)
    }

    #[test]
    fn unknown_model_is_fatal_not_empty() {
        let registry = registry_with("linear", linear_bundle(&["Temperature"]));
        let df = DataFrame::new(vec![
            Series::new("Temperature".into(), &[40.0f64]).into(),
        ])
        .unwrap();
        let err = predict_rows(&registry, df, "nonexistent").expect_err("unknown model");
        assert!(matches!(
            err,
            PredictError::Registry(RegistryError::UnknownModel(_))
        ));
    }

    #[test]
    fn degraded_requests_still_return_predictions() {
        // No scaler, missing features, synthesized dates: the report should
        // carry the degradations, not hide them.
        let registry = registry_with(
            "linear",
            linear_bundle(&["Temperature", "Store_1", "weekday_0"]),
        );
        let df = DataFrame::new(vec![
            Series::new("Temperature".into(), &[40.0f64, 41.0]).into(),
        ])
        .unwrap();
        let report = predict_rows(&registry, df, "linear").expect("predict");
        assert_eq!(report.predictions.len(), 2);
        assert!(report.is_degraded());
        assert!(
            report
                .degradations
                .iter()
                .any(|d| d.contains("no persisted scaler"))
        );
    }

    #[test]
    fn registry_listing_is_sorted() {
        let mut entries = HashMap::new();
        entries.insert(
            "zeta".to_string(),
            ModelEntry {
                bundle: linear_bundle(&["Temperature"]),
                scaler: None,
            },
        );
        entries.insert(
            "alpha".to_string(),
            ModelEntry {
                bundle: linear_bundle(&["Temperature"]),
                scaler: None,
            },
        );
        let registry = ModelRegistry::from_entries(entries);
        assert_eq!(registry.model_ids(), vec!["alpha", "zeta"]);
    }
}
