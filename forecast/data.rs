//! Raw table loading and column extraction.
//!
//! This module is the entry point for user-provided sales data. It reads CSV
//! files into a `DataFrame` and provides the column-extraction helpers the
//! rest of the crate uses to move between Polars columns and plain `f64`
//! buffers. Failures here are assumed to be user-input errors, so the
//! `DataError` variants carry actionable messages.

use ndarray::ShapeBuilder;
use polars::prelude::*;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("The input file '{0}' contains no data rows.")]
    EmptyTable(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
}

/// Loads a raw sales table from a comma-separated CSV file with a header row.
pub fn load_raw_table(path: &Path) -> Result<DataFrame, DataError> {
    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(b',')),
        )
        .finish()?;

    if df.height() == 0 {
        return Err(DataError::EmptyTable(path.display().to_string()));
    }

    log::info!(
        "Loaded {} rows x {} columns from '{}'",
        df.height(),
        df.width(),
        path.display()
    );
    Ok(df)
}

/// Column names of a table as owned strings, in table order.
pub fn column_names(df: &DataFrame) -> Vec<String> {
    df.get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect()
}

/// Extracts a column as `f64`, mapping any nulls to zero. The pipeline runs
/// its null-fill pass before any numeric math, so the zero mapping is a
/// belt-and-braces default rather than an imputation choice.
pub fn column_f64(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
    let column = df.column(column_name)?;
    let casted = match column.cast(&DataType::Float64) {
        Ok(casted) => casted,
        Err(_) => {
            return Err(DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", column.dtype()),
            });
        }
    };
    // A non-strict cast silently turns unparseable values into nulls; any
    // null the source column did not already carry means non-numeric data.
    if casted.null_count() > column.null_count() {
        return Err(DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", column.dtype()),
        });
    }
    let chunked = casted.f64()?.rechunk();
    Ok(chunked.into_iter().map(|v| v.unwrap_or(0.0)).collect())
}

/// Extracts the named columns into a dense matrix, one column per name, in
/// the order given.
pub fn feature_matrix(
    df: &DataFrame,
    names: &[String],
) -> Result<ndarray::Array2<f64>, DataError> {
    let mut buffer = Vec::with_capacity(df.height() * names.len());
    for name in names {
        buffer.extend(column_f64(df, name)?);
    }
    Ok(
        ndarray::Array2::from_shape_vec((df.height(), names.len()).f(), buffer)
            .expect("column buffers share the table height"),
    )
}

/// True if the column's dtype can be treated as numeric for scaling and
/// outlier fences. Booleans count: encoded dummies may round-trip as bool.
pub fn is_numeric_column(df: &DataFrame, column_name: &str) -> bool {
    let Ok(column) = df.column(column_name) else {
        return false;
    };
    matches!(
        column.dtype(),
        DataType::Float64
            | DataType::Float32
            | DataType::Int64
            | DataType::Int32
            | DataType::Int16
            | DataType::Int8
            | DataType::UInt64
            | DataType::UInt32
            | DataType::UInt16
            | DataType::UInt8
            | DataType::Boolean
    )
}

/// Per-row display labels for a column, the way the pipeline stringifies
/// categoricals before encoding. Integer-typed values format without a
/// fractional part, so `Store=1` always yields the category `"1"` whether the
/// source column arrived as int, float or string.
pub fn column_labels(df: &DataFrame, column_name: &str) -> Result<Vec<String>, DataError> {
    let column = df.column(column_name)?;
    let mut labels = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let value = column.get(i).unwrap_or(AnyValue::Null);
        labels.push(label_of(&value));
    }
    Ok(labels)
}

fn label_of(value: &AnyValue) -> String {
    match value {
        AnyValue::Null => "0".to_string(),
        AnyValue::String(s) => (*s).to_string(),
        AnyValue::StringOwned(s) => s.to_string(),
        AnyValue::Boolean(b) => {
            if *b {
                "1".to_string()
            } else {
                "0".to_string()
            }
        }
        AnyValue::Float64(v) => float_label(*v),
        AnyValue::Float32(v) => float_label(*v as f64),
        other => other.to_string(),
    }
}

/// Integral floats label as integers (`1.0` -> `"1"`), matching the encoding
/// a whole-number column gets when it arrives with an integer dtype.
fn float_label(v: f64) -> String {
    if v.fract() == 0.0 && v.is_finite() && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        v.to_string()
    }
}
