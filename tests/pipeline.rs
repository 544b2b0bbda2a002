//! End-to-end pipeline tests: simulate -> write -> load -> derive ->
//! describe -> fit, asserting the cross-module properties that unit tests
//! cannot see.

use acuity::data::{
    self, EDUCP_A, HICOV_A, INS_BIN, INS_LABEL, PHSTAT_A, PHSTAT_REVERSED, SES_CAT, SES_SCORE,
    SES_X_INS,
};
use acuity::derive::{DeriveConfig, derive_features};
use acuity::describe::{self, MissingPolicy};
use acuity::fit::{FitError, fit_model};
use acuity::model;
use acuity::simulate::{SimConfig, simulate, write_csv};
use acuity::stats;
use approx::assert_abs_diff_eq;
use ndarray::Array2;
use ndarray_linalg::Solve;
use tempfile::tempdir;

fn derived_from_simulation(rows: usize, seed: u64, missing_rate: f64) -> data::ObservationTable {
    let dir = tempdir().unwrap();
    let csv_path = dir.path().join("survey.csv");

    let simulated = simulate(&SimConfig {
        rows,
        seed,
        missing_rate,
    })
    .unwrap();
    write_csv(&simulated, &csv_path, b';').unwrap();

    let loaded = data::load_survey(&csv_path, b';').unwrap();
    assert_eq!(loaded.n_rows(), rows);
    derive_features(&loaded, &DeriveConfig::default()).unwrap()
}

#[test]
fn derived_columns_satisfy_their_invariants() {
    let table = derived_from_simulation(400, 7, 0.0);

    let hicov = table.numeric(HICOV_A).unwrap();
    let ins_bin = table.numeric(INS_BIN).unwrap();
    for (h, b) in hicov.iter().zip(ins_bin.iter()) {
        assert!(*b == 0.0 || *b == 1.0);
        assert_eq!(*b == 1.0, *h == 1.0);
    }

    // The source labeling is inverted relative to INS_BIN by design.
    let labels = table.labels(INS_LABEL).unwrap();
    for (b, label) in ins_bin.iter().zip(labels.iter()) {
        let expected = if *b == 1.0 { "Uninsured" } else { "Insured" };
        assert_eq!(label.as_deref(), Some(expected));
    }

    let phstat = table.numeric(PHSTAT_A).unwrap();
    let reversed = table.numeric(PHSTAT_REVERSED).unwrap();
    let max = stats::observed(phstat)
        .into_iter()
        .fold(f64::NEG_INFINITY, f64::max);
    for (p, r) in phstat.iter().zip(reversed.iter()) {
        assert_abs_diff_eq!(p + r, max + 1.0, epsilon = 1e-12);
    }

    let score = table.numeric(SES_SCORE).unwrap();
    let interaction = table.numeric(SES_X_INS).unwrap();
    for ((s, b), x) in score.iter().zip(ins_bin.iter()).zip(interaction.iter()) {
        assert_abs_diff_eq!(s * b, *x, epsilon = 1e-12);
    }
}

#[test]
fn cross_tab_accounts_for_every_row() {
    let rows = 300;
    let table = derived_from_simulation(rows, 13, 0.05);

    let tab = describe::cross_tab(&table, SES_CAT, INS_BIN).unwrap();
    assert_eq!(tab.total() + tab.excluded_missing, rows);
    assert!(tab.excluded_missing > 0, "5% masking should exclude rows");
}

#[test]
fn moderation_model_matches_ols_under_complete_data() {
    let table = derived_from_simulation(250, 21, 0.0);
    let report = fit_model(&table, &model::insurance_moderation_model()).unwrap();
    assert!(report.converged);
    assert!(report.indices.is_none(), "saturated model has no fit test");

    // Independent OLS solution via the normal equations.
    let predictors = [SES_SCORE, INS_BIN, SES_X_INS];
    let n = table.n_rows();
    let mut x = Array2::<f64>::zeros((n, 4));
    for i in 0..n {
        x[[i, 0]] = 1.0;
    }
    for (j, name) in predictors.iter().enumerate() {
        let col = table.numeric(name).unwrap();
        for i in 0..n {
            x[[i, j + 1]] = col[i];
        }
    }
    let y = table.numeric(PHSTAT_A).unwrap();
    let xtx = x.t().dot(&x);
    let xty = x.t().dot(y);
    let ols = xtx.solve(&xty).unwrap();

    let estimate = |label: &str| -> f64 {
        report
            .estimates
            .iter()
            .find(|e| e.label == label)
            .unwrap_or_else(|| panic!("missing '{label}'"))
            .estimate
    };
    assert_abs_diff_eq!(estimate("PHSTAT_A ~ 1"), ols[0], epsilon = 1e-6);
    assert_abs_diff_eq!(estimate("PHSTAT_A ~ SES_SCORE"), ols[1], epsilon = 1e-6);
    assert_abs_diff_eq!(estimate("PHSTAT_A ~ INS_BIN"), ols[2], epsilon = 1e-6);
    assert_abs_diff_eq!(estimate("PHSTAT_A ~ SESxINS"), ols[3], epsilon = 1e-6);
}

#[test]
fn moderation_model_handles_missing_cells() {
    let table = derived_from_simulation(400, 29, 0.05);
    let report = fit_model(&table, &model::insurance_moderation_model()).unwrap();

    assert!(report.n_rows > 0);
    for estimate in &report.estimates {
        assert!(
            estimate.estimate.is_finite(),
            "estimate '{}' not finite",
            estimate.label
        );
    }
}

#[test]
fn health_factor_model_fits_simulated_structure() {
    let table = derived_from_simulation(800, 3, 0.0);
    let report = fit_model(&table, &model::health_factor_model()).unwrap();

    assert!(report.converged, "warnings: {:?}", report.warnings);
    let indices = report.indices.as_ref().expect("model is overidentified");
    // 7 manifest variables give 28 moments; 18 free parameters leave 10 df.
    assert_eq!(indices.df, 10);
    assert!(indices.chi_square >= 0.0);
    assert!((0.0..=1.0).contains(&indices.p_value));
    assert!(indices.rmsea.is_finite());

    for estimate in &report.estimates {
        assert!(
            estimate.estimate.is_finite(),
            "estimate '{}' not finite",
            estimate.label
        );
    }
    // The marker rows for both factors are present and fixed at 1.
    let markers: Vec<_> = report
        .estimates
        .iter()
        .filter(|e| e.label.contains("(marker)"))
        .collect();
    assert_eq!(markers.len(), 2);
    for marker in markers {
        assert_abs_diff_eq!(marker.estimate, 1.0, epsilon = 1e-12);
        assert!(marker.std_error.is_none());
    }
}

#[test]
fn degenerate_indicator_surfaces_as_a_fit_error() {
    let table = derived_from_simulation(100, 17, 0.0);

    // Rebuild the table with a constant diabetes column.
    let mut rebuilt = data::ObservationTable::new(table.n_rows());
    for name in [
        HICOV_A,
        EDUCP_A,
        data::POVRATTC_A,
        data::HYPEV_A,
        PHSTAT_A,
        data::PHQCAT_A,
        data::LSATIS4_A,
    ] {
        rebuilt = rebuilt
            .with_numeric(name, table.numeric(name).unwrap().clone())
            .unwrap();
    }
    rebuilt = rebuilt
        .with_numeric(
            data::DIBEV_A,
            ndarray::Array1::from_elem(table.n_rows(), 0.0),
        )
        .unwrap();

    match fit_model(&rebuilt, &model::health_factor_model()) {
        Err(FitError::DegenerateIndicator { column, .. }) => {
            assert_eq!(column, data::DIBEV_A)
        }
        other => panic!("expected DegenerateIndicator, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn ses_median_split_is_exhaustive_and_tied_high() {
    let table = derived_from_simulation(200, 31, 0.0);
    let score = table.numeric(SES_SCORE).unwrap();
    let cat = table.labels(SES_CAT).unwrap();

    let finite = stats::observed(score);
    let median = stats::median(&finite).unwrap();
    let mut high = 0usize;
    for (s, label) in score.iter().zip(cat.iter()) {
        let expected = if *s >= median { "High SES" } else { "Low SES" };
        assert_eq!(label.as_deref(), Some(expected));
        if *s >= median {
            high += 1;
        }
    }
    assert!(high > 0 && high < 200);
}
