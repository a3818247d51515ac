//! Feature standardization with a persisted state.
//!
//! Two named operations, one per lifecycle phase: `fit_scaler` computes
//! mean/std from a training table and `apply_scaler` replays a previously
//! fit state at inference time. The target column is excluded and
//! re-attached unscaled in both modes; downstream consumers expect it in
//! original units.

use crate::data::{self, DataError};
use crate::schema;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScaleError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error(transparent)]
    DataError(#[from] DataError),
    #[error("Failed to read or write scaler file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML scaler file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize scaler to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

/// The persisted standardization parameters: per-column mean and standard
/// deviation, with the ordered list of columns they were fit on. A state fit
/// at training time must be replayed (transform-only) at inference time for
/// numerical consistency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalerState {
    pub columns: Vec<String>,
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl ScalerState {
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Saves the state to a human-readable TOML file.
    pub fn save(&self, path: &str) -> Result<(), ScaleError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads a previously saved state from a TOML file.
    pub fn load(path: &str) -> Result<Self, ScaleError> {
        let toml_string = fs::read_to_string(path)?;
        let state = toml::from_str(&toml_string)?;
        Ok(state)
    }
}

/// Fit mode: computes mean/std from the table's numeric columns (target
/// excluded), standardizes them, and returns the transformed table with the
/// state used. A table with no numeric columns comes back unchanged with an
/// empty state.
pub fn fit_scaler(df: &DataFrame) -> Result<(DataFrame, ScalerState), ScaleError> {
    let columns = scalable_columns(df);
    let mut mean = Vec::with_capacity(columns.len());
    let mut std = Vec::with_capacity(columns.len());

    for column in &columns {
        let values = data::column_f64(df, column)?;
        let (m, s) = mean_std(&values);
        mean.push(m);
        std.push(s);
    }

    let state = ScalerState { columns, mean, std };
    let transformed = transform_columns(df, &state)?;
    Ok((transformed, state))
}

/// Transform-only mode: applies a previously fit state without recomputing
/// anything. Fails soft — on any transform error the unscaled table is
/// returned so the request can proceed on degraded inputs.
pub fn apply_scaler(df: &DataFrame, state: &ScalerState) -> DataFrame {
    if state.is_empty() {
        return df.clone();
    }
    match transform_columns(df, state) {
        Ok(transformed) => transformed,
        Err(e) => {
            log::warn!("Scaler transform failed ({e}); proceeding with unscaled features");
            df.clone()
        }
    }
}

/// Numeric columns eligible for scaling, in table order, target excluded.
fn scalable_columns(df: &DataFrame) -> Vec<String> {
    data::column_names(df)
        .into_iter()
        .filter(|c| c != schema::TARGET && data::is_numeric_column(df, c))
        .collect()
}

fn transform_columns(df: &DataFrame, state: &ScalerState) -> Result<DataFrame, ScaleError> {
    let mut out = df.clone();
    let names = data::column_names(df);
    for ((column, &m), &s) in state
        .columns
        .iter()
        .zip(state.mean.iter())
        .zip(state.std.iter())
    {
        if !names.iter().any(|c| c == column) {
            // Schema drift is the aligner's problem; a state column missing
            // from this batch is logged and skipped, not fatal.
            log::warn!("Scaler state covers column '{column}' which is absent from the input");
            continue;
        }
        let values = data::column_f64(&out, column)?;
        let scaled: Vec<f64> = values.iter().map(|&v| (v - m) / s).collect();
        out.with_column(Series::new(column.as_str().into(), scaled))?;
    }
    Ok(out)
}

/// Population mean and standard deviation. A zero-variance column scales by
/// 1.0 so constant features pass through centered instead of dividing by
/// zero.
fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 1.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let std = variance.sqrt();
    (mean, if std > 0.0 { std } else { 1.0 })
}
