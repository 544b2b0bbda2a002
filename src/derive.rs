//! # Feature Derivation Module
//!
//! Pure transformations over the [`ObservationTable`]: each call produces a
//! new table with the derived socioeconomic and health columns appended.
//! Nothing is mutated in place, so recomputing a derivation from unchanged
//! inputs yields identical values — a correctness property the tests pin
//! down directly.
//!
//! Z-scoring uses the sample mean and the n-1 standard deviation over
//! non-missing values; quantile cut points use linear interpolation between
//! order statistics. Missing inputs propagate: a row missing any ingredient
//! of a derived value is missing in the derived column.

use crate::data::{
    ColumnError, EDUCP_A, HICOV_A, INS_BIN, INS_LABEL, ObservationTable, PHSTAT_A,
    PHSTAT_REVERSED, POVRATTC_A, SES_CAT, SES_GROUP, SES_SCORE, SES_X_INS,
};
use crate::stats;
use ndarray::Array1;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeriveError {
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(
        "Cannot z-score column '{column}': sample variance is degenerate ({non_missing} non-missing values, sd = {sd:.3e})."
    )]
    DegenerateVariance {
        column: String,
        non_missing: usize,
        sd: f64,
    },
    #[error("Cannot derive '{derived}': column '{column}' has no non-missing values.")]
    AllMissing { derived: String, column: String },
}

/// The sense of the `INS_LABEL` text column.
///
/// Historically this extract's labels assigned "Uninsured" to respondents
/// with `HICOV_A == 1`, inverted relative to `INS_BIN`, which codes the
/// same respondents as 1. [`InsuranceLabeling::SourceConvention`] (the
/// default) preserves that coding for comparability rather than silently
/// correcting it; [`InsuranceLabeling::Corrected`] flips it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InsuranceLabeling {
    #[default]
    SourceConvention,
    Corrected,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeriveConfig {
    pub labeling: InsuranceLabeling,
}

/// Z-scores a column over its non-missing values (sample mean, n-1 sd).
/// NaN entries stay NaN.
pub fn zscore(values: &Array1<f64>, column: &str) -> Result<Array1<f64>, DeriveError> {
    let finite = stats::observed(values);
    let sd = stats::sample_sd(&finite).unwrap_or(0.0);
    if sd < 1e-12 {
        return Err(DeriveError::DegenerateVariance {
            column: column.to_string(),
            non_missing: finite.len(),
            sd,
        });
    }
    // unwrap_or is unreachable here: sample_sd above required >= 2 values.
    let mean = stats::sample_mean(&finite).unwrap_or(f64::NAN);
    Ok(values.mapv(|v| if v.is_finite() { (v - mean) / sd } else { f64::NAN }))
}

/// Appends the derived columns of the analysis to a new table:
/// `INS_BIN`, `SES_SCORE`, `SESxINS`, `SES_cat`, `SES_GROUP`, `INS_LABEL`,
/// and `PHSTAT_REVERSED`.
pub fn derive_features(
    table: &ObservationTable,
    config: &DeriveConfig,
) -> Result<ObservationTable, DeriveError> {
    let hicov = table.numeric(HICOV_A)?;
    let ins_bin = hicov.mapv(|v| {
        if v.is_nan() {
            f64::NAN
        } else if v == 1.0 {
            1.0
        } else {
            0.0
        }
    });

    let educ_z = zscore(table.numeric(EDUCP_A)?, EDUCP_A)?;
    let pov_z = zscore(table.numeric(POVRATTC_A)?, POVRATTC_A)?;
    let ses_score = &educ_z + &pov_z;
    let ses_x_ins = &ses_score * &ins_bin;

    let ses_finite = stats::observed(&ses_score);
    let ses_median = stats::median(&ses_finite).ok_or_else(|| DeriveError::AllMissing {
        derived: SES_CAT.to_string(),
        column: SES_SCORE.to_string(),
    })?;
    // Median split with ties on the high side.
    let ses_cat: Vec<Option<String>> = ses_score
        .iter()
        .map(|&v| {
            if v.is_nan() {
                None
            } else if v >= ses_median {
                Some("High SES".to_string())
            } else {
                Some("Low SES".to_string())
            }
        })
        .collect();

    let q33 = stats::quantile(&ses_finite, 0.33).ok_or_else(|| DeriveError::AllMissing {
        derived: SES_GROUP.to_string(),
        column: SES_SCORE.to_string(),
    })?;
    let q66 = stats::quantile(&ses_finite, 0.66).ok_or_else(|| DeriveError::AllMissing {
        derived: SES_GROUP.to_string(),
        column: SES_SCORE.to_string(),
    })?;
    let ses_group: Vec<Option<String>> = ses_score
        .iter()
        .map(|&v| {
            if v.is_nan() {
                None
            } else if v < q33 {
                Some("Low SES".to_string())
            } else if v > q66 {
                Some("High SES".to_string())
            } else {
                Some("Mid SES".to_string())
            }
        })
        .collect();

    let (covered, not_covered) = match config.labeling {
        InsuranceLabeling::SourceConvention => ("Uninsured", "Insured"),
        InsuranceLabeling::Corrected => ("Insured", "Uninsured"),
    };
    let ins_label: Vec<Option<String>> = hicov
        .iter()
        .map(|&v| {
            if v.is_nan() {
                None
            } else if v == 1.0 {
                Some(covered.to_string())
            } else {
                Some(not_covered.to_string())
            }
        })
        .collect();

    let phstat = table.numeric(PHSTAT_A)?;
    let phstat_max = stats::observed(phstat)
        .into_iter()
        .fold(f64::NEG_INFINITY, f64::max);
    if !phstat_max.is_finite() {
        return Err(DeriveError::AllMissing {
            derived: PHSTAT_REVERSED.to_string(),
            column: PHSTAT_A.to_string(),
        });
    }
    let reversed = phstat.mapv(|v| if v.is_nan() { f64::NAN } else { phstat_max + 1.0 - v });

    let derived = table
        .clone()
        .with_numeric(INS_BIN, ins_bin)?
        .with_numeric(SES_SCORE, ses_score)?
        .with_numeric(SES_X_INS, ses_x_ins)?
        .with_labels(SES_CAT, ses_cat)?
        .with_labels(SES_GROUP, ses_group)?
        .with_labels(INS_LABEL, ins_label)?
        .with_numeric(PHSTAT_REVERSED, reversed)?;

    log::info!(
        "Derived columns appended over {} rows ({} with SES score present)",
        derived.n_rows(),
        ses_finite.len()
    );
    Ok(derived)
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn raw_table() -> ObservationTable {
        // Ten respondents with complete data.
        let hicov = vec![1.0, 2.0, 1.0, 1.0, 2.0, 1.0, 2.0, 1.0, 1.0, 2.0];
        let educ = vec![1.0, 2.0, 3.0, 4.0, 1.0, 2.0, 3.0, 4.0, 2.0, 3.0];
        let pov = vec![0.5, 1.0, 1.5, 2.0, 2.5, 3.0, 0.8, 1.2, 1.9, 2.4];
        let phstat = vec![1.0, 2.0, 3.0, 4.0, 5.0, 1.0, 2.0, 3.0, 4.0, 5.0];
        ObservationTable::new(10)
            .with_numeric(HICOV_A, Array1::from_vec(hicov))
            .unwrap()
            .with_numeric(EDUCP_A, Array1::from_vec(educ))
            .unwrap()
            .with_numeric(POVRATTC_A, Array1::from_vec(pov))
            .unwrap()
            .with_numeric(PHSTAT_A, Array1::from_vec(phstat))
            .unwrap()
    }

    #[test]
    fn ins_bin_is_binary_and_tracks_coverage() {
        let derived = derive_features(&raw_table(), &DeriveConfig::default()).unwrap();
        let hicov = derived.numeric(HICOV_A).unwrap();
        let ins_bin = derived.numeric(INS_BIN).unwrap();
        for (h, b) in hicov.iter().zip(ins_bin.iter()) {
            assert!(*b == 0.0 || *b == 1.0);
            assert_eq!(*b == 1.0, *h == 1.0);
        }
    }

    #[test]
    fn ses_score_recomputation_is_identical() {
        let table = raw_table();
        let first = derive_features(&table, &DeriveConfig::default()).unwrap();
        let second = derive_features(&table, &DeriveConfig::default()).unwrap();
        let a = first.numeric(SES_SCORE).unwrap();
        let b = second.numeric(SES_SCORE).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.to_bits(), y.to_bits());
        }
    }

    #[test]
    fn zscore_uses_sample_standard_deviation() {
        let values = Array1::from_vec(vec![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        let z = zscore(&values, "test").unwrap();
        let sd = (32.0f64 / 7.0).sqrt();
        assert_abs_diff_eq!(z[0], (2.0 - 5.0) / sd, epsilon = 1e-12);
        assert_abs_diff_eq!(z[7], (9.0 - 5.0) / sd, epsilon = 1e-12);
    }

    #[test]
    fn zscore_propagates_missing() {
        let values = Array1::from_vec(vec![1.0, f64::NAN, 3.0, 5.0]);
        let z = zscore(&values, "test").unwrap();
        assert!(z[1].is_nan());
        assert!(z[0].is_finite());
    }

    #[test]
    fn median_split_puts_ties_on_the_high_side() {
        let derived = derive_features(&raw_table(), &DeriveConfig::default()).unwrap();
        let score = derived.numeric(SES_SCORE).unwrap();
        let finite = stats::observed(score);
        let median = stats::median(&finite).unwrap();
        let cat = derived.labels(SES_CAT).unwrap();
        for (v, label) in score.iter().zip(cat.iter()) {
            let expected = if *v >= median { "High SES" } else { "Low SES" };
            assert_eq!(label.as_deref(), Some(expected));
        }
    }

    #[test]
    fn tertile_split_respects_percentile_boundaries() {
        // EDUCP and POVRATTC both 1..9 makes SES_SCORE affine in 1..9, so
        // membership must mirror the [1..9] grid: {1,2,3} low, {4,5,6} mid,
        // {7,8,9} high under interpolated 33rd/66th percentiles.
        let grid: Vec<f64> = (1..=9).map(|v| v as f64).collect();
        let hicov = vec![1.0; 9];
        let phstat = vec![1.0, 2.0, 3.0, 4.0, 5.0, 1.0, 2.0, 3.0, 4.0];
        let table = ObservationTable::new(9)
            .with_numeric(HICOV_A, Array1::from_vec(hicov))
            .unwrap()
            .with_numeric(EDUCP_A, Array1::from_vec(grid.clone()))
            .unwrap()
            .with_numeric(POVRATTC_A, Array1::from_vec(grid))
            .unwrap()
            .with_numeric(PHSTAT_A, Array1::from_vec(phstat))
            .unwrap();
        let derived = derive_features(&table, &DeriveConfig::default()).unwrap();
        let group = derived.labels(SES_GROUP).unwrap();
        let expected = [
            "Low SES", "Low SES", "Low SES", "Mid SES", "Mid SES", "Mid SES", "High SES",
            "High SES", "High SES",
        ];
        for (label, want) in group.iter().zip(expected.iter()) {
            assert_eq!(label.as_deref(), Some(*want));
        }
    }

    #[test]
    fn phstat_reversed_mirrors_around_the_maximum() {
        let derived = derive_features(&raw_table(), &DeriveConfig::default()).unwrap();
        let phstat = derived.numeric(PHSTAT_A).unwrap();
        let reversed = derived.numeric(PHSTAT_REVERSED).unwrap();
        let max = stats::observed(phstat)
            .into_iter()
            .fold(f64::NEG_INFINITY, f64::max);
        for (p, r) in phstat.iter().zip(reversed.iter()) {
            assert_abs_diff_eq!(p + r, max + 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn source_labeling_preserves_the_inversion() {
        let derived = derive_features(&raw_table(), &DeriveConfig::default()).unwrap();
        let hicov = derived.numeric(HICOV_A).unwrap();
        let labels = derived.labels(INS_LABEL).unwrap();
        for (h, label) in hicov.iter().zip(labels.iter()) {
            let expected = if *h == 1.0 { "Uninsured" } else { "Insured" };
            assert_eq!(label.as_deref(), Some(expected));
        }
    }

    #[test]
    fn corrected_labeling_flips_the_sense() {
        let config = DeriveConfig {
            labeling: InsuranceLabeling::Corrected,
        };
        let derived = derive_features(&raw_table(), &config).unwrap();
        let hicov = derived.numeric(HICOV_A).unwrap();
        let labels = derived.labels(INS_LABEL).unwrap();
        for (h, label) in hicov.iter().zip(labels.iter()) {
            let expected = if *h == 1.0 { "Insured" } else { "Uninsured" };
            assert_eq!(label.as_deref(), Some(expected));
        }
    }

    #[test]
    fn constant_column_is_a_degenerate_variance_error() {
        let table = ObservationTable::new(3)
            .with_numeric(HICOV_A, Array1::from_vec(vec![1.0, 2.0, 1.0]))
            .unwrap()
            .with_numeric(EDUCP_A, Array1::from_vec(vec![2.0, 3.0, 4.0]))
            .unwrap()
            .with_numeric(POVRATTC_A, Array1::from_vec(vec![1.5, 1.5, 1.5]))
            .unwrap()
            .with_numeric(PHSTAT_A, Array1::from_vec(vec![1.0, 2.0, 3.0]))
            .unwrap();
        match derive_features(&table, &DeriveConfig::default()) {
            Err(DeriveError::DegenerateVariance { column, .. }) => {
                assert_eq!(column, POVRATTC_A)
            }
            other => panic!("expected DegenerateVariance, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn missing_required_column_names_the_column() {
        let table = ObservationTable::new(2)
            .with_numeric(EDUCP_A, Array1::from_vec(vec![1.0, 2.0]))
            .unwrap();
        match derive_features(&table, &DeriveConfig::default()) {
            Err(DeriveError::Column(ColumnError::Missing(name))) => assert_eq!(name, HICOV_A),
            other => panic!("expected Missing(HICOV_A), got {:?}", other.map(|_| ())),
        }
    }
}
