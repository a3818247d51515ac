//! The fixed domain schema for the weekly-sales dataset.
//!
//! Column names are not configurable. The pipeline, scaler and aligner all
//! agree on this one vocabulary, which eliminates a class of configuration
//! errors and lets the encoded-column families be matched purely by prefix.

/// The prediction target. Never scaled, never part of a model's feature set.
pub const TARGET: &str = "Weekly_Sales";

/// The raw date column consumed by the preprocessing pipeline.
pub const DATE_COLUMN: &str = "Date";

/// Source columns that are one-hot encoded, in canonical encoding order.
/// Each produces an encoded family named `{source}_{category}`.
pub const CATEGORICAL_FAMILIES: [&str; 5] = ["Store", "month", "weekday", "year", "Holiday_Flag"];

/// Numeric columns subject to the IQR outlier fence, applied in this order.
pub const OUTLIER_COLUMNS: [&str; 5] = [
    "Weekly_Sales",
    "Temperature",
    "Fuel_Price",
    "CPI",
    "Unemployment",
];

/// Required input columns and the domain-plausible defaults used to backfill
/// them when absent. Mid-range values for the Walmart store panel; a backfill
/// is a schema repair, not an imputation strategy.
pub const REQUIRED_DEFAULTS: [(&str, f64); 6] = [
    ("Store", 1.0),
    ("Temperature", 60.0),
    ("Fuel_Price", 3.0),
    ("CPI", 211.0),
    ("Unemployment", 8.0),
    ("Holiday_Flag", 0.0),
];

/// Synthetic calendar values used when no date column exists and none of the
/// derived fields survive from an earlier pass.
pub const DEFAULT_WEEKDAY: i64 = 0;
pub const DEFAULT_MONTH: i64 = 1;
pub const DEFAULT_YEAR: i64 = 2023;

/// True if `column` is an encoded member of `family` (e.g. `Store_12`).
pub fn is_family_member(column: &str, family: &str) -> bool {
    column
        .strip_prefix(family)
        .and_then(|rest| rest.strip_prefix('_'))
        .is_some_and(|suffix| !suffix.is_empty())
}

/// The category suffix of an encoded column, e.g. `Store_12` -> `12`.
pub fn category_suffix<'a>(column: &'a str, family: &str) -> Option<&'a str> {
    column
        .strip_prefix(family)
        .and_then(|rest| rest.strip_prefix('_'))
        .filter(|suffix| !suffix.is_empty())
}

/// True if the table still carries the raw (pre-encoding) form of `family`,
/// or any encoded member of it. Used by the idempotence guards: a second
/// pipeline pass must neither re-synthesize nor re-backfill a field that has
/// already been encoded away.
pub fn family_present(columns: &[String], family: &str) -> bool {
    columns
        .iter()
        .any(|c| c == family || is_family_member(c, family))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_membership_requires_suffix() {
        assert!(is_family_member("Store_1", "Store"));
        assert!(is_family_member("Holiday_Flag_0", "Holiday_Flag"));
        assert!(!is_family_member("Store_", "Store"));
        assert!(!is_family_member("Store", "Store"));
        assert!(!is_family_member("Storefront_1", "Store"));
    }

    #[test]
    fn suffix_extraction() {
        assert_eq!(category_suffix("Store_12", "Store"), Some("12"));
        assert_eq!(category_suffix("year_2010", "year"), Some("2010"));
        assert_eq!(category_suffix("Store", "Store"), None);
    }

    #[test]
    fn presence_covers_raw_and_encoded_forms() {
        let cols = vec!["Store_1".to_string(), "Temperature".to_string()];
        assert!(family_present(&cols, "Store"));
        assert!(!family_present(&cols, "weekday"));
        let raw = vec!["Store".to_string()];
        assert!(family_present(&raw, "Store"));
    }
}
