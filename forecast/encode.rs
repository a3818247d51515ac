//! Categorical encoding and encoded-column-family bookkeeping.
//!
//! One-hot encoding is data-dependent: the derived column set is exactly the
//! categories observed in the batch being encoded, so two tables encoded
//! independently rarely agree. Everything the aligner needs to repair that
//! drift lives here: deterministic `{source}_{category}` naming, category
//! reconstruction from whichever form of a family survives in a table, and
//! family rebuilds against a training-time column list.

use crate::data::{self, DataError};
use crate::schema;
use itertools::Itertools;
use polars::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error(transparent)]
    DataError(#[from] DataError),
}

/// One-hot encodes every designated categorical source column present in the
/// table. Derived columns are named `{source}_{category}` with categories in
/// sorted label order, so the mapping from value to column is deterministic
/// for a given batch. Source columns are dropped; columns that are already
/// encoded members of a family are left untouched, which is what keeps a
/// second pipeline pass from double-encoding.
pub fn one_hot_encode(mut df: DataFrame) -> Result<DataFrame, EncodeError> {
    for family in schema::CATEGORICAL_FAMILIES {
        let names = data::column_names(&df);
        if !names.iter().any(|c| c == family) {
            continue;
        }
        let labels = data::column_labels(&df, family)?;
        let categories: Vec<String> = labels.iter().unique().sorted().cloned().collect();
        for category in &categories {
            let dummy: Vec<f64> = labels
                .iter()
                .map(|l| if l == category { 1.0 } else { 0.0 })
                .collect();
            let name = format!("{}_{category}", family);
            df.with_column(Series::new(name.into(), dummy))?;
        }
        df = df.drop(family)?;
    }
    Ok(df)
}

/// The members of `family` present in a table, in table order.
pub fn family_members(columns: &[String], family: &str) -> Vec<String> {
    columns
        .iter()
        .filter(|c| schema::is_family_member(c, family))
        .cloned()
        .collect()
}

/// Reconstructs the row-level category of `family` for every row, from
/// whichever representation the table still carries:
///
/// - the raw source column, if present (authoritative);
/// - otherwise the encoded members, taking the per-row argmax. Argmax rather
///   than equality-with-one, because a fitted scaler may already have shifted
///   the dummy values away from {0, 1}.
///
/// Returns `None` when the table carries no trace of the family at all.
pub fn reconstruct_categories(
    df: &DataFrame,
    family: &str,
) -> Result<Option<Vec<String>>, EncodeError> {
    let names = data::column_names(df);
    if names.iter().any(|c| c == family) {
        return Ok(Some(data::column_labels(df, family)?));
    }

    let members = family_members(&names, family);
    if members.is_empty() {
        return Ok(None);
    }

    let mut member_values: Vec<(String, Vec<f64>)> = Vec::with_capacity(members.len());
    for member in &members {
        let suffix = schema::category_suffix(member, family)
            .unwrap_or_default()
            .to_string();
        member_values.push((suffix, data::column_f64(df, member)?));
    }

    let mut categories = Vec::with_capacity(df.height());
    for row in 0..df.height() {
        let mut best = 0usize;
        for (idx, (_, values)) in member_values.iter().enumerate() {
            if values[row] > member_values[best].1[row] {
                best = idx;
            }
        }
        categories.push(member_values[best].0.clone());
    }
    Ok(Some(categories))
}

/// Rebuilds `family` against an expected training-time column list: drops
/// every present member, then derives exactly `expected_columns` from the
/// reconstructed per-row categories. Categories absent from this batch come
/// out as all-zero columns; categories unseen at training time simply have no
/// column to land in and are dropped with the rest.
pub fn rebuild_family(
    mut df: DataFrame,
    family: &str,
    expected_columns: &[String],
    categories: &[String],
) -> Result<DataFrame, EncodeError> {
    let names = data::column_names(&df);
    for member in family_members(&names, family) {
        df = df.drop(&member)?;
    }
    for expected in expected_columns {
        let suffix = schema::category_suffix(expected, family).unwrap_or_default();
        let dummy: Vec<f64> = categories
            .iter()
            .map(|c| if c == suffix { 1.0 } else { 0.0 })
            .collect();
        df.with_column(Series::new(expected.as_str().into(), dummy))?;
    }
    Ok(df)
}
