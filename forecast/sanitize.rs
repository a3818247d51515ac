//! A magnitude guard on raw model output.
//!
//! Upstream scaling mismatches (predicting on features standardized with the
//! wrong state, or not at all) can shift predictions by many orders of
//! magnitude. This clamp keeps obviously-broken numbers from reaching
//! consumers. It is lossy and approximate by construction — a safety net,
//! not a correction of whatever went wrong upstream — and every branch that
//! fires is a signal worth chasing, so each is logged and reported.

use ndarray::Array1;

/// Which repair the sanitizer applied, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanitizeAction {
    /// Mean magnitude above 1e9: divided by 1e12, clamped to [10_000, 500_000].
    RescaledExtreme,
    /// Mean magnitude above 1e6: divided by 1e3, clamped to [5_000, 200_000].
    RescaledLarge,
    /// Negative values present: shifted so the minimum lands at 1_000.
    ShiftedNonNegative,
    /// Maximum below 1_000: multiplied by 10_000 (wrong-units assumption).
    ScaledUpSmall,
}

impl SanitizeAction {
    pub fn describe(&self) -> &'static str {
        match self {
            SanitizeAction::RescaledExtreme => {
                "predictions rescaled from extreme magnitude (>1e9 mean)"
            }
            SanitizeAction::RescaledLarge => {
                "predictions rescaled from inflated magnitude (>1e6 mean)"
            }
            SanitizeAction::ShiftedNonNegative => "negative predictions shifted non-negative",
            SanitizeAction::ScaledUpSmall => "undersized predictions scaled up",
        }
    }
}

/// Clamps a raw prediction vector into a plausible weekly-sales range.
/// Returns the sanitized vector and the action taken, `None` when the input
/// passed through untouched.
pub fn sanitize_predictions(raw: &Array1<f64>) -> (Array1<f64>, Option<SanitizeAction>) {
    if raw.is_empty() {
        return (raw.clone(), None);
    }

    let mean_abs = raw.iter().map(|v| v.abs()).sum::<f64>() / raw.len() as f64;
    let min = raw.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = raw.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    let (sanitized, action) = if mean_abs > 1e9 {
        (
            raw.mapv(|v| (v / 1e12).clamp(10_000.0, 500_000.0)),
            SanitizeAction::RescaledExtreme,
        )
    } else if mean_abs > 1e6 {
        (
            raw.mapv(|v| (v / 1e3).clamp(5_000.0, 200_000.0)),
            SanitizeAction::RescaledLarge,
        )
    } else if min < 0.0 {
        let shift = -min + 1_000.0;
        (raw.mapv(|v| v + shift), SanitizeAction::ShiftedNonNegative)
    } else if max < 1_000.0 {
        (raw.mapv(|v| v * 10_000.0), SanitizeAction::ScaledUpSmall)
    } else {
        return (raw.clone(), None);
    };

    log::warn!("Prediction sanitizer engaged: {}", action.describe());
    (sanitized, Some(action))
}
