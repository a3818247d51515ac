//! Trained regressors and the persisted model bundle.
//!
//! A `ModelBundle` is the unit of deployment: an opaque fitted regressor plus
//! the ordered feature names it was trained on, serialized together to a
//! human-readable TOML artifact. The bundle is created once at training time
//! and loaded read-only at inference time; everything the aligner needs to
//! reconcile an input table lives in `feature_names`.
//!
//! Two regressor kinds are supported, matching the models this service has
//! historically shipped: ordinary least squares and gradient-boosted
//! regression stumps.

use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Prediction matrix has {found} feature columns, but the model expects {expected}.")]
    FeatureCountMismatch { expected: usize, found: usize },
    #[error("Prediction matrix column names do not match the trained feature names: {detail}")]
    FeatureNamesMismatch { detail: String },
    #[error("Training matrix is singular; the normal equations have no stable solution.")]
    SingularSystem,
    #[error("Training requires at least one sample and one feature.")]
    EmptyTrainingSet,
}

/// Ordinary least squares fit: `y = intercept + x . coefficients`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearModel {
    pub intercept: f64,
    pub coefficients: Vec<f64>,
}

/// One depth-1 regression tree. The stored leaf values already include the
/// shrinkage applied during training.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stump {
    pub feature: usize,
    pub threshold: f64,
    pub left: f64,
    pub right: f64,
}

/// Gradient-boosted regression stumps with squared-error loss.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientBoostModel {
    pub num_features: usize,
    pub base_score: f64,
    pub trees: Vec<Stump>,
}

/// The opaque fitted regressor a bundle carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Regressor {
    Linear(LinearModel),
    GradientBoost(GradientBoostModel),
}

impl Regressor {
    /// The exact feature-vector width this regressor consumes.
    pub fn num_features(&self) -> usize {
        match self {
            Regressor::Linear(m) => m.coefficients.len(),
            Regressor::GradientBoost(m) => m.num_features,
        }
    }

    /// Predicts positionally: columns are matched by index only. Width is
    /// still validated — the error carries the expected count so callers can
    /// repair the matrix instead of guessing.
    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        let expected = self.num_features();
        if x.ncols() != expected {
            return Err(ModelError::FeatureCountMismatch {
                expected,
                found: x.ncols(),
            });
        }
        match self {
            Regressor::Linear(m) => {
                let coefficients = Array1::from_vec(m.coefficients.clone());
                Ok(x.dot(&coefficients) + m.intercept)
            }
            Regressor::GradientBoost(m) => {
                let mut predictions = Array1::from_elem(x.nrows(), m.base_score);
                for row in 0..x.nrows() {
                    for tree in &m.trees {
                        predictions[row] += if x[[row, tree.feature]] <= tree.threshold {
                            tree.left
                        } else {
                            tree.right
                        };
                    }
                }
                Ok(predictions)
            }
        }
    }
}

/// The persisted deployment unit: {fitted regressor, training-time feature
/// names}. `feature_names` order is significant — it defines the column
/// vector the regressor consumes. Bundles without feature names exist only
/// for legacy artifacts and force positional matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelBundle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_names: Option<Vec<String>>,
    pub regressor: Regressor,
}

impl ModelBundle {
    /// Strict invocation: validates the matrix column names against the
    /// trained feature names (order and count) before predicting.
    pub fn predict_strict(
        &self,
        names: &[String],
        x: &Array2<f64>,
    ) -> Result<Array1<f64>, ModelError> {
        if let Some(expected) = &self.feature_names {
            if names != expected.as_slice() {
                return Err(ModelError::FeatureNamesMismatch {
                    detail: names_mismatch_detail(expected, names),
                });
            }
        }
        self.regressor.predict(x.view())
    }

    /// Name-insensitive invocation: the matrix is treated as a plain numeric
    /// array matched positionally. Width is still enforced.
    pub fn predict_positional(&self, x: &Array2<f64>) -> Result<Array1<f64>, ModelError> {
        self.regressor.predict(x.view())
    }

    /// Saves the bundle to a human-readable TOML artifact.
    pub fn save(&self, path: &str) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads a bundle from a TOML artifact.
    pub fn load(path: &str) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let bundle = toml::from_str(&toml_string)?;
        Ok(bundle)
    }
}

fn names_mismatch_detail(expected: &[String], found: &[String]) -> String {
    if expected.len() != found.len() {
        return format!("expected {} columns, found {}", expected.len(), found.len());
    }
    for (e, f) in expected.iter().zip(found.iter()) {
        if e != f {
            return format!("expected '{e}', found '{f}'");
        }
    }
    "column sets differ".to_string()
}

/// Fits ordinary least squares via the normal equations. A small ridge term
/// keeps one-hot collinearity (a family's dummies summing to the intercept)
/// from making the system singular.
pub fn train_linear(x: &Array2<f64>, y: &Array1<f64>) -> Result<LinearModel, ModelError> {
    let (n, p) = (x.nrows(), x.ncols());
    if n == 0 || p == 0 || y.len() != n {
        return Err(ModelError::EmptyTrainingSet);
    }

    const RIDGE: f64 = 1e-8;
    let width = p + 1; // trailing intercept column

    // Gram matrix of [X | 1] and the matching right-hand side.
    let mut gram = vec![vec![0.0f64; width]; width];
    let mut rhs = vec![0.0f64; width];
    for row in 0..n {
        for i in 0..width {
            let xi = if i < p { x[[row, i]] } else { 1.0 };
            rhs[i] += xi * y[row];
            for j in i..width {
                let xj = if j < p { x[[row, j]] } else { 1.0 };
                gram[i][j] += xi * xj;
            }
        }
    }
    for i in 0..width {
        for j in 0..i {
            gram[i][j] = gram[j][i];
        }
        gram[i][i] += RIDGE;
    }

    let solution = solve_gaussian(gram, rhs)?;
    let intercept = solution[p];
    Ok(LinearModel {
        intercept,
        coefficients: solution[..p].to_vec(),
    })
}

/// Gaussian elimination with partial pivoting.
fn solve_gaussian(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Result<Vec<f64>, ModelError> {
    let n = b.len();
    for col in 0..n {
        let pivot_row = (col..n)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .ok_or(ModelError::SingularSystem)?;
        if a[pivot_row][col].abs() < 1e-12 {
            return Err(ModelError::SingularSystem);
        }
        a.swap(col, pivot_row);
        b.swap(col, pivot_row);

        for row in (col + 1)..n {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0f64; n];
    for col in (0..n).rev() {
        let mut sum = b[col];
        for k in (col + 1)..n {
            sum -= a[col][k] * x[k];
        }
        x[col] = sum / a[col][col];
    }
    Ok(x)
}

/// Hyperparameters for the boosted-stumps learner.
#[derive(Debug, Clone)]
pub struct BoostParams {
    pub rounds: usize,
    pub learning_rate: f64,
    /// Candidate split thresholds evaluated per feature per round, taken as
    /// evenly spaced quantile cuts.
    pub max_thresholds: usize,
}

impl Default for BoostParams {
    fn default() -> Self {
        Self {
            rounds: 100,
            learning_rate: 0.1,
            max_thresholds: 16,
        }
    }
}

/// Fits gradient-boosted regression stumps on squared error. Each round
/// greedily picks the (feature, threshold) split that most reduces residual
/// error; training stops early once no split improves.
pub fn train_gradient_boost(
    x: &Array2<f64>,
    y: &Array1<f64>,
    params: &BoostParams,
) -> Result<GradientBoostModel, ModelError> {
    let (n, p) = (x.nrows(), x.ncols());
    if n == 0 || p == 0 || y.len() != n {
        return Err(ModelError::EmptyTrainingSet);
    }

    let base_score = y.sum() / n as f64;
    let mut predictions = vec![base_score; n];
    let mut trees = Vec::new();

    // Fixed threshold grid per feature, computed once.
    let mut thresholds: Vec<Vec<f64>> = Vec::with_capacity(p);
    for j in 0..p {
        let mut values: Vec<f64> = (0..n).map(|i| x[[i, j]]).collect();
        values.sort_by(|a, b| a.total_cmp(b));
        values.dedup();
        thresholds.push(candidate_thresholds(&values, params.max_thresholds));
    }

    for _ in 0..params.rounds {
        let residuals: Vec<f64> = (0..n).map(|i| y[i] - predictions[i]).collect();
        let Some(split) = best_stump(x, &residuals, &thresholds) else {
            break;
        };

        let left = params.learning_rate * split.left_mean;
        let right = params.learning_rate * split.right_mean;
        for i in 0..n {
            predictions[i] += if x[[i, split.feature]] <= split.threshold {
                left
            } else {
                right
            };
        }
        trees.push(Stump {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        });
    }

    Ok(GradientBoostModel {
        num_features: p,
        base_score,
        trees,
    })
}

struct SplitCandidate {
    feature: usize,
    threshold: f64,
    left_mean: f64,
    right_mean: f64,
}

fn candidate_thresholds(sorted_unique: &[f64], max_thresholds: usize) -> Vec<f64> {
    if sorted_unique.len() < 2 {
        return Vec::new();
    }
    let midpoints: Vec<f64> = sorted_unique
        .windows(2)
        .map(|w| (w[0] + w[1]) / 2.0)
        .collect();
    if midpoints.len() <= max_thresholds {
        return midpoints;
    }
    (0..max_thresholds)
        .map(|k| {
            let idx = k * (midpoints.len() - 1) / (max_thresholds - 1);
            midpoints[idx]
        })
        .collect()
}

/// The split minimizing residual SSE across all features and candidate
/// thresholds; `None` when nothing improves on the unsplit residuals.
fn best_stump(
    x: &Array2<f64>,
    residuals: &[f64],
    thresholds: &[Vec<f64>],
) -> Option<SplitCandidate> {
    let n = residuals.len();
    let total_sum: f64 = residuals.iter().sum();
    // A split only counts as progress if its two leaves explain more than a
    // single constant leaf would.
    let baseline = total_sum * total_sum / n as f64;

    let mut best: Option<(f64, SplitCandidate)> = None;
    for (feature, feature_thresholds) in thresholds.iter().enumerate() {
        for &threshold in feature_thresholds {
            let mut left_sum = 0.0;
            let mut left_count = 0usize;
            for i in 0..n {
                if x[[i, feature]] <= threshold {
                    left_sum += residuals[i];
                    left_count += 1;
                }
            }
            if left_count == 0 || left_count == n {
                continue;
            }
            let right_sum = total_sum - left_sum;
            let right_count = n - left_count;
            // SSE reduction of a two-leaf fit is the weighted sum of
            // squared leaf means.
            let gain = left_sum * left_sum / left_count as f64
                + right_sum * right_sum / right_count as f64;
            if best.as_ref().is_none_or(|(g, _)| gain > *g) {
                best = Some((
                    gain,
                    SplitCandidate {
                        feature,
                        threshold,
                        left_mean: left_sum / left_count as f64,
                        right_mean: right_sum / right_count as f64,
                    },
                ));
            }
        }
    }

    match best {
        Some((gain, split)) if gain.is_finite() && gain > baseline + 1e-9 => Some(split),
        _ => None,
    }
}

/// Root mean squared error.
pub fn rmse(predictions: &Array1<f64>, actuals: &Array1<f64>) -> f64 {
    if predictions.is_empty() {
        return 0.0;
    }
    let sse: f64 = predictions
        .iter()
        .zip(actuals.iter())
        .map(|(p, a)| (p - a).powi(2))
        .sum();
    (sse / predictions.len() as f64).sqrt()
}

/// Coefficient of determination against the mean baseline.
pub fn r_squared(predictions: &Array1<f64>, actuals: &Array1<f64>) -> f64 {
    if actuals.is_empty() {
        return 0.0;
    }
    let mean = actuals.sum() / actuals.len() as f64;
    let ss_tot: f64 = actuals.iter().map(|a| (a - mean).powi(2)).sum();
    let ss_res: f64 = predictions
        .iter()
        .zip(actuals.iter())
        .map(|(p, a)| (a - p).powi(2))
        .sum();
    if ss_tot == 0.0 {
        return 0.0;
    }
    1.0 - ss_res / ss_tot
}
