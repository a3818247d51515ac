//! Inference-time feature alignment.
//!
//! A trained bundle expects an exact column vector: the feature names saved
//! at training time, in order. Inference input rarely matches — one-hot
//! encoding is data-dependent, so a batch from a single store only produces
//! that store's dummy column, and upstream callers add and drop columns
//! freely. This module reconciles an arbitrary preprocessed table against a
//! bundle's expected feature list, then invokes the model through an
//! explicit repair state machine.
//!
//! Nothing here guesses blindly: every repair is driven either by the
//! bundle's expected feature list or by the expected count carried in the
//! model's own mismatch error. Reshaping without a target count is not a
//! thing this module does.

use crate::data::{self, DataError};
use crate::encode::{self, EncodeError};
use crate::model::{ModelBundle, ModelError};
use crate::schema;
use ndarray::{Array1, Array2, s};
use polars::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AlignError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error(transparent)]
    DataError(#[from] DataError),
    #[error(transparent)]
    EncodeError(#[from] EncodeError),
    #[error("Model invocation failed after exhausting repair strategies: {0}")]
    RepairExhausted(ModelError),
}

/// A feature matrix reconciled against a bundle, plus the degradation notes
/// accumulated while building it. `names` matches `matrix` column-for-column.
#[derive(Debug)]
pub struct AlignedFeatures {
    pub names: Vec<String>,
    pub matrix: Array2<f64>,
    pub notes: Vec<String>,
}

/// Builds the prediction matrix for `bundle` from a preprocessed (and
/// usually scaled) table. With feature names present the output columns are
/// exactly `feature_names`, in order, whatever the input's column set was.
/// Without feature names the input's column order is trusted as-is — the
/// legacy path, explicitly logged as risky.
pub fn align_features(
    df: &DataFrame,
    bundle: &ModelBundle,
) -> Result<AlignedFeatures, AlignError> {
    let mut notes = Vec::new();

    let Some(expected) = &bundle.feature_names else {
        log::warn!(
            "Model bundle carries no feature names; assuming input column order matches \
             training order (legacy artifact, alignment unverifiable)"
        );
        notes.push("legacy bundle without feature names; positional matching".to_string());
        let names = data::column_names(df);
        let matrix = to_matrix(df, &names)?;
        return Ok(AlignedFeatures {
            names,
            matrix,
            notes,
        });
    };

    let mut working = df.clone();

    // The target is never a feature; drop it quietly when the model does not
    // expect it.
    let names = data::column_names(&working);
    if names.iter().any(|c| c == schema::TARGET) && !expected.iter().any(|c| c == schema::TARGET)
    {
        working = working.drop(schema::TARGET)?;
    }

    working = repair_family_drift(working, expected, &mut notes)?;

    // Zero-fill expected columns the input still lacks. Missing features are
    // an accuracy loss, not a hard failure; each one is surfaced.
    let names = data::column_names(&working);
    for column in expected {
        if !names.iter().any(|c| c == column) {
            log::warn!("Expected feature '{column}' missing from input; filling with zeros");
            notes.push(format!("missing feature '{column}' zero-filled"));
            working.with_column(Series::new(
                column.as_str().into(),
                vec![0.0f64; working.height()],
            ))?;
        }
    }

    // Drop input columns the model never saw. Surfaced as well: silently
    // ignoring caller data is how schema drift goes unnoticed.
    for column in data::column_names(&working) {
        if !expected.iter().any(|c| c == &column) {
            log::warn!("Input column '{column}' is not a model feature; dropping");
            notes.push(format!("unexpected column '{column}' dropped"));
            working = working.drop(&column)?;
        }
    }

    let matrix = to_matrix(&working, expected)?;
    Ok(AlignedFeatures {
        names: expected.clone(),
        matrix,
        notes,
    })
}

/// Rebuilds each encoded family whose present column set differs from the
/// training-time set. The pre-encoding category is reconstructed per row
/// first (raw column if one survives, else argmax over the present members),
/// so a lone `Store_2` batch yields a zeroed `Store_1` and a correct
/// `Store_2` — never a misattributed column.
///
/// A family whose members already match the expected set exactly is left
/// untouched: those values are in training units (post-scaler) and
/// re-deriving them would throw that away.
fn repair_family_drift(
    mut df: DataFrame,
    expected: &[String],
    notes: &mut Vec<String>,
) -> Result<DataFrame, AlignError> {
    for family in schema::CATEGORICAL_FAMILIES {
        let expected_members: Vec<String> = expected
            .iter()
            .filter(|c| schema::is_family_member(c, family))
            .cloned()
            .collect();
        if expected_members.is_empty() {
            continue;
        }

        let names = data::column_names(&df);
        let raw_present = names.iter().any(|c| c == family);
        let present_members = encode::family_members(&names, family);

        if !raw_present && same_column_set(&present_members, &expected_members) {
            continue;
        }

        let Some(categories) = encode::reconstruct_categories(&df, family)? else {
            // No trace of the family in this batch; the zero-fill pass will
            // create the expected columns and warn per column.
            continue;
        };

        log::warn!(
            "Encoded family '{family}' drifted from the training-time column set; \
             rebuilding {} expected columns from row-level categories",
            expected_members.len()
        );
        notes.push(format!("family '{family}' rebuilt against training columns"));
        df = encode::rebuild_family(df, family, &expected_members, &categories)?;
        if raw_present {
            df = df.drop(family)?;
        }
    }
    Ok(df)
}

fn same_column_set(present: &[String], expected: &[String]) -> bool {
    present.len() == expected.len() && expected.iter().all(|c| present.contains(c))
}

fn to_matrix(df: &DataFrame, names: &[String]) -> Result<Array2<f64>, AlignError> {
    Ok(data::feature_matrix(df, names)?)
}

#[derive(PartialEq, Clone, Copy)]
enum Attempt {
    Strict,
    Positional,
    Resized,
}

/// Invokes the model on an aligned matrix through the bounded repair chain:
/// strict named invocation, then a name-insensitive positional retry, then a
/// single pad-or-truncate retry driven by the expected count the model's
/// error reports. Each fallback is logged distinctly; when the chain is
/// exhausted the last error propagates.
pub fn invoke_with_repair(
    bundle: &ModelBundle,
    aligned: &AlignedFeatures,
) -> Result<(Array1<f64>, Vec<String>), AlignError> {
    let mut notes = Vec::new();
    let mut matrix = aligned.matrix.clone();
    let mut attempt = if bundle.feature_names.is_some() {
        Attempt::Strict
    } else {
        Attempt::Positional
    };

    loop {
        let result = match attempt {
            Attempt::Strict => bundle.predict_strict(&aligned.names, &matrix),
            Attempt::Positional | Attempt::Resized => bundle.predict_positional(&matrix),
        };
        match result {
            Ok(predictions) => return Ok((predictions, notes)),
            Err(ModelError::FeatureNamesMismatch { detail }) if attempt == Attempt::Strict => {
                log::warn!(
                    "Strict invocation rejected feature names ({detail}); \
                     retrying with positional matching"
                );
                notes.push("name validation bypassed (positional retry)".to_string());
                attempt = Attempt::Positional;
            }
            Err(ModelError::FeatureCountMismatch { expected, found })
                if attempt != Attempt::Resized =>
            {
                log::warn!(
                    "Model expects {expected} features but matrix has {found}; \
                     resizing by zero-padding or truncation and retrying once"
                );
                notes.push(format!("matrix resized from {found} to {expected} columns"));
                matrix = resize_columns(&matrix, expected);
                attempt = Attempt::Resized;
            }
            Err(e) => return Err(AlignError::RepairExhausted(e)),
        }
    }
}

/// Pads the matrix with zero columns or truncates it on the right to exactly
/// `target` columns. Only ever called with a count the model itself reported.
fn resize_columns(matrix: &Array2<f64>, target: usize) -> Array2<f64> {
    let (rows, cols) = (matrix.nrows(), matrix.ncols());
    if cols >= target {
        matrix.slice(s![.., ..target]).to_owned()
    } else {
        let mut resized = Array2::zeros((rows, target));
        resized.slice_mut(s![.., ..cols]).assign(matrix);
        resized
    }
}

/// The full core path: align the table, invoke with repair, return raw
/// predictions plus all degradation notes.
pub fn predict_aligned(
    df: &DataFrame,
    bundle: &ModelBundle,
) -> Result<(Array1<f64>, Vec<String>), AlignError> {
    let aligned = align_features(df, bundle)?;
    let mut notes = aligned.notes.clone();
    let (predictions, invoke_notes) = invoke_with_repair(bundle, &aligned)?;
    notes.extend(invoke_notes);
    Ok((predictions, notes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LinearModel, Regressor};
    use approx::assert_abs_diff_eq;

    fn table(columns: Vec<Column>) -> DataFrame {
        DataFrame::new(columns).expect("test frame")
    }

    fn bundle_with_names(names: &[&str]) -> ModelBundle {
        ModelBundle {
            regressor: Regressor::Linear(LinearModel {
                intercept: 0.0,
                coefficients: vec![1.0; names.len()],
            }),
            feature_names: Some(names.iter().map(|s| s.to_string()).collect()),
        }
    }

    #[test]
    fn single_store_batch_rebuilds_the_full_family() {
        // Trained on stores 1 and 2; this batch only contains store 2, so a
        // naive join would misattribute the lone dummy column.
        let bundle = bundle_with_names(&["Store_1", "Store_2", "Temperature"]);
        let df = table(vec![
            Series::new("Store_2".into(), &[1.0f64, 1.0]).into(),
            Series::new("Temperature".into(), &[40.0f64, 41.0]).into(),
        ]);
        let aligned = align_features(&df, &bundle).expect("align");
        assert_eq!(
            aligned.names,
            vec!["Store_1", "Store_2", "Temperature"]
        );
        assert_eq!(aligned.matrix.column(0).to_vec(), vec![0.0, 0.0]);
        assert_eq!(aligned.matrix.column(1).to_vec(), vec![1.0, 1.0]);
        assert_eq!(aligned.matrix.column(2).to_vec(), vec![40.0, 41.0]);
    }

    #[test]
    fn raw_categorical_column_is_authoritative() {
        let bundle = bundle_with_names(&["Store_1", "Store_2"]);
        let df = table(vec![
            Series::new("Store".into(), &[2i64, 1]).into(),
        ]);
        let aligned = align_features(&df, &bundle).expect("align");
        assert_eq!(aligned.matrix.column(0).to_vec(), vec![0.0, 1.0]);
        assert_eq!(aligned.matrix.column(1).to_vec(), vec![1.0, 0.0]);
    }

    #[test]
    fn superset_subset_and_disjoint_inputs_all_align() {
        let bundle = bundle_with_names(&["Store_1", "weekday_0", "Temperature"]);

        // Superset: extra column dropped.
        let superset = table(vec![
            Series::new("Store_1".into(), &[1.0f64]).into(),
            Series::new("weekday_0".into(), &[1.0f64]).into(),
            Series::new("Temperature".into(), &[40.0f64]).into(),
            Series::new("Fuel_Price".into(), &[2.5f64]).into(),
        ]);
        let aligned = align_features(&superset, &bundle).expect("align superset");
        assert_eq!(aligned.names.len(), 3);
        assert!(aligned.notes.iter().any(|n| n.contains("Fuel_Price")));

        // Subset: missing feature zero-filled.
        let subset = table(vec![
            Series::new("Temperature".into(), &[40.0f64]).into(),
        ]);
        let aligned = align_features(&subset, &bundle).expect("align subset");
        assert_eq!(aligned.matrix.column(0).to_vec(), vec![0.0]);
        assert!(aligned.notes.iter().any(|n| n.contains("Store_1")));

        // Disjoint categories within a known family.
        let disjoint = table(vec![
            Series::new("Store_7".into(), &[1.0f64]).into(),
            Series::new("Temperature".into(), &[40.0f64]).into(),
        ]);
        let aligned = align_features(&disjoint, &bundle).expect("align disjoint");
        assert_eq!(aligned.matrix.column(0).to_vec(), vec![0.0]);
        assert_eq!(aligned.names, vec!["Store_1", "weekday_0", "Temperature"]);
    }

    #[test]
    fn matching_family_columns_keep_their_scaled_values() {
        let bundle = bundle_with_names(&["Store_1", "Store_2"]);
        // Post-scaler dummies: not 0/1, but the column set matches training
        // exactly, so no rebuild should run.
        let df = table(vec![
            Series::new("Store_1".into(), &[1.7f64]).into(),
            Series::new("Store_2".into(), &[-0.6f64]).into(),
        ]);
        let aligned = align_features(&df, &bundle).expect("align");
        assert_abs_diff_eq!(aligned.matrix[[0, 0]], 1.7);
        assert_abs_diff_eq!(aligned.matrix[[0, 1]], -0.6);
        assert!(aligned.notes.is_empty());
    }

    #[test]
    fn target_column_is_dropped_without_a_note() {
        let bundle = bundle_with_names(&["Temperature"]);
        let df = table(vec![
            Series::new("Weekly_Sales".into(), &[100.0f64]).into(),
            Series::new("Temperature".into(), &[40.0f64]).into(),
        ]);
        let aligned = align_features(&df, &bundle).expect("align");
        assert_eq!(aligned.names, vec!["Temperature"]);
        assert!(aligned.notes.is_empty());
    }

    #[test]
    fn legacy_bundle_uses_input_order() {
        let bundle = ModelBundle {
            regressor: Regressor::Linear(LinearModel {
                intercept: 0.0,
                coefficients: vec![1.0, 1.0],
            }),
            feature_names: None,
        };
        let df = table(vec![
            Series::new("a".into(), &[1.0f64]).into(),
            Series::new("b".into(), &[2.0f64]).into(),
        ]);
        let (predictions, notes) = predict_aligned(&df, &bundle).expect("predict");
        assert_abs_diff_eq!(predictions[0], 3.0);
        assert!(notes.iter().any(|n| n.contains("legacy")));
    }

    #[test]
    fn count_mismatch_is_repaired_by_padding() {
        // Corrupt artifact: three names but a two-coefficient model. Strict
        // passes on names, the regressor then reports its true width and the
        // repair leg truncates to it.
        let bundle = ModelBundle {
            regressor: Regressor::Linear(LinearModel {
                intercept: 0.0,
                coefficients: vec![1.0, 1.0],
            }),
            feature_names: Some(vec![
                "a".to_string(),
                "b".to_string(),
                "c".to_string(),
            ]),
        };
        let df = table(vec![
            Series::new("a".into(), &[1.0f64]).into(),
            Series::new("b".into(), &[2.0f64]).into(),
            Series::new("c".into(), &[4.0f64]).into(),
        ]);
        let (predictions, notes) = predict_aligned(&df, &bundle).expect("predict");
        assert_abs_diff_eq!(predictions[0], 3.0);
        assert!(notes.iter().any(|n| n.contains("resized")));
    }

    #[test]
    fn legacy_count_mismatch_takes_the_resize_leg() {
        let bundle = ModelBundle {
            regressor: Regressor::Linear(LinearModel {
                intercept: 0.0,
                coefficients: vec![],
            }),
            feature_names: None,
        };
        let aligned = AlignedFeatures {
            names: vec!["a".to_string()],
            matrix: Array2::zeros((1, 1)),
            notes: Vec::new(),
        };
        let (predictions, notes) = invoke_with_repair(&bundle, &aligned).expect("repair");
        assert_eq!(predictions.len(), 1);
        assert!(notes.iter().any(|n| n.contains("resized")));
    }

    #[test]
    fn resize_pads_and_truncates() {
        let matrix = ndarray::array![[1.0, 2.0], [3.0, 4.0]];
        let padded = resize_columns(&matrix, 4);
        assert_eq!(padded.ncols(), 4);
        assert_eq!(padded[[0, 3]], 0.0);
        let truncated = resize_columns(&matrix, 1);
        assert_eq!(truncated.ncols(), 1);
        assert_eq!(truncated[[1, 0]], 3.0);
    }
}
