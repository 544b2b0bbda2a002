//! # Saturated Multivariate-Normal Estimation
//!
//! The full-information substrate of the model fitter: maximum-likelihood
//! estimates of the mean vector and covariance matrix of the modeled
//! columns when some cells are missing, via EM over missingness patterns.
//! Every row contributes whatever it observed; no case-wise deletion.
//!
//! With complete data the estimate collapses to the sample moments in a
//! single pass (ML convention: covariance divided by n), which is what
//! makes the downstream regression path reduce exactly to ordinary least
//! squares on complete tables.

use ndarray::{Array1, Array2};
use ndarray_linalg::Inverse;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MvnError {
    #[error("Column '{0}' has no observed values; the saturated moments are not estimable.")]
    EmptyColumn(String),
    #[error(
        "The observed-data covariance block for a missingness pattern over columns {0:?} is singular."
    )]
    SingularPattern(Vec<String>),
}

/// ML mean/covariance of a set of columns under missing data.
#[derive(Debug, Clone)]
pub struct SaturatedMoments {
    pub mean: Array1<f64>,
    /// ML covariance (1/n divisor).
    pub cov: Array2<f64>,
    /// Rows contributing at least one observed value.
    pub n_rows: usize,
    pub iterations: usize,
    pub converged: bool,
}

const EM_MAX_ITERATIONS: usize = 500;
const EM_TOLERANCE: f64 = 1e-9;

/// Estimates the saturated moments of `data` (rows x columns, NaN =
/// missing). `names` is used only for diagnostics.
pub fn estimate(data: &Array2<f64>, names: &[String]) -> Result<SaturatedMoments, MvnError> {
    let p = data.ncols();
    debug_assert_eq!(names.len(), p);

    // Rows observing nothing carry no information; drop them from n.
    let rows: Vec<usize> = (0..data.nrows())
        .filter(|&i| data.row(i).iter().any(|v| v.is_finite()))
        .collect();
    let n = rows.len();

    for (j, name) in names.iter().enumerate() {
        if !rows.iter().any(|&i| data[[i, j]].is_finite()) {
            return Err(MvnError::EmptyColumn(name.clone()));
        }
    }

    let complete = rows
        .iter()
        .all(|&i| data.row(i).iter().all(|v| v.is_finite()));
    if complete {
        let (mean, cov) = complete_moments(data, &rows);
        return Ok(SaturatedMoments {
            mean,
            cov,
            n_rows: n,
            iterations: 0,
            converged: true,
        });
    }

    // Group rows by missingness pattern so each conditional sweep is
    // computed once per pattern.
    let mut patterns: BTreeMap<Vec<bool>, Vec<usize>> = BTreeMap::new();
    for &i in &rows {
        let mask: Vec<bool> = data.row(i).iter().map(|v| v.is_finite()).collect();
        patterns.entry(mask).or_default().push(i);
    }

    // Initialize from the observed per-column moments.
    let mut mean = Array1::zeros(p);
    let mut cov = Array2::zeros((p, p));
    for j in 0..p {
        let observed: Vec<f64> = rows
            .iter()
            .map(|&i| data[[i, j]])
            .filter(|v| v.is_finite())
            .collect();
        let m = observed.iter().sum::<f64>() / observed.len() as f64;
        let var = observed.iter().map(|v| (v - m) * (v - m)).sum::<f64>()
            / observed.len() as f64;
        mean[j] = m;
        cov[[j, j]] = var.max(1e-12);
    }

    let mut iterations = 0;
    let mut converged = false;
    while iterations < EM_MAX_ITERATIONS {
        iterations += 1;
        let (new_mean, new_cov) = em_step(data, &patterns, &mean, &cov, n, names)?;

        let mean_change = mean
            .iter()
            .zip(new_mean.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f64, f64::max);
        let cov_change = cov
            .iter()
            .zip(new_cov.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f64, f64::max);

        mean = new_mean;
        cov = new_cov;

        if mean_change.max(cov_change) < EM_TOLERANCE {
            converged = true;
            break;
        }
    }

    if !converged {
        log::warn!(
            "EM for saturated moments stopped after {iterations} iterations without meeting tolerance"
        );
    }

    Ok(SaturatedMoments {
        mean,
        cov,
        n_rows: n,
        iterations,
        converged,
    })
}

fn complete_moments(data: &Array2<f64>, rows: &[usize]) -> (Array1<f64>, Array2<f64>) {
    let p = data.ncols();
    let n = rows.len() as f64;
    let mut mean = Array1::<f64>::zeros(p);
    for &i in rows {
        mean += &data.row(i);
    }
    mean /= n;

    let mut cov = Array2::<f64>::zeros((p, p));
    for &i in rows {
        let centered = &data.row(i) - &mean;
        for a in 0..p {
            for b in 0..p {
                cov[[a, b]] += centered[a] * centered[b];
            }
        }
    }
    cov /= n;
    (mean, cov)
}

/// One E+M step: accumulate expected first and second moments per
/// missingness pattern, then re-normalize.
fn em_step(
    data: &Array2<f64>,
    patterns: &BTreeMap<Vec<bool>, Vec<usize>>,
    mean: &Array1<f64>,
    cov: &Array2<f64>,
    n: usize,
    names: &[String],
) -> Result<(Array1<f64>, Array2<f64>), MvnError> {
    let p = data.ncols();
    let mut t1 = Array1::<f64>::zeros(p);
    let mut t2 = Array2::<f64>::zeros((p, p));

    for (mask, members) in patterns {
        let observed: Vec<usize> = (0..p).filter(|&j| mask[j]).collect();
        let missing: Vec<usize> = (0..p).filter(|&j| !mask[j]).collect();

        // Conditional regression of the missing block on the observed block.
        let (sweep, cond_cov) = if missing.is_empty() {
            (Array2::zeros((0, 0)), Array2::zeros((0, 0)))
        } else {
            let s_oo = submatrix(cov, &observed, &observed);
            let s_mo = submatrix(cov, &missing, &observed);
            let s_mm = submatrix(cov, &missing, &missing);
            let s_oo_inv = s_oo.inv().map_err(|_| {
                MvnError::SingularPattern(observed.iter().map(|&j| names[j].clone()).collect())
            })?;
            let b = s_mo.dot(&s_oo_inv);
            let cond = &s_mm - &b.dot(&s_mo.t());
            (b, cond)
        };

        for &i in members {
            let mut filled = Array1::<f64>::zeros(p);
            for &j in &observed {
                filled[j] = data[[i, j]];
            }
            if !missing.is_empty() {
                let deviation: Array1<f64> =
                    observed.iter().map(|&j| data[[i, j]] - mean[j]).collect();
                let predicted = sweep.dot(&deviation);
                for (k, &j) in missing.iter().enumerate() {
                    filled[j] = mean[j] + predicted[k];
                }
            }

            for a in 0..p {
                t1[a] += filled[a];
                for b in 0..p {
                    t2[[a, b]] += filled[a] * filled[b];
                }
            }
            // The conditional covariance of the imputed block is part of
            // the expected second moment.
            for (ka, &a) in missing.iter().enumerate() {
                for (kb, &b) in missing.iter().enumerate() {
                    t2[[a, b]] += cond_cov[[ka, kb]];
                }
            }
        }
    }

    let nf = n as f64;
    let new_mean = &t1 / nf;
    let mut new_cov = &t2 / nf;
    for a in 0..p {
        for b in 0..p {
            new_cov[[a, b]] -= new_mean[a] * new_mean[b];
        }
    }
    Ok((new_mean, new_cov))
}

fn submatrix(m: &Array2<f64>, rows: &[usize], cols: &[usize]) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((rows.len(), cols.len()));
    for (a, &i) in rows.iter().enumerate() {
        for (b, &j) in cols.iter().enumerate() {
            out[[a, b]] = m[[i, j]];
        }
    }
    out
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("v{i}")).collect()
    }

    #[test]
    fn complete_data_reduces_to_sample_moments() {
        let data = Array2::from_shape_vec(
            (4, 2),
            vec![1.0, 2.0, 2.0, 4.0, 3.0, 5.0, 4.0, 9.0],
        )
        .unwrap();
        let moments = estimate(&data, &names(2)).unwrap();

        assert!(moments.converged);
        assert_eq!(moments.iterations, 0);
        assert_eq!(moments.n_rows, 4);
        assert_abs_diff_eq!(moments.mean[0], 2.5, epsilon = 1e-12);
        assert_abs_diff_eq!(moments.mean[1], 5.0, epsilon = 1e-12);
        // ML convention: divide by n, not n-1.
        assert_abs_diff_eq!(moments.cov[[0, 0]], 1.25, epsilon = 1e-12);
        assert_abs_diff_eq!(moments.cov[[0, 1]], 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(moments.cov[[1, 1]], 6.5, epsilon = 1e-12);
    }

    #[test]
    fn all_missing_rows_are_dropped_from_n() {
        let data = Array2::from_shape_vec(
            (3, 2),
            vec![1.0, 2.0, f64::NAN, f64::NAN, 3.0, 4.0],
        )
        .unwrap();
        let moments = estimate(&data, &names(2)).unwrap();
        assert_eq!(moments.n_rows, 2);
        assert_abs_diff_eq!(moments.mean[0], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn missing_cells_are_handled_by_em() {
        // Strongly correlated pair; one missing value in the second column.
        let data = Array2::from_shape_vec(
            (5, 2),
            vec![
                1.0, 2.1, //
                2.0, 4.0, //
                3.0, 6.2, //
                4.0, f64::NAN, //
                5.0, 9.9,
            ],
        )
        .unwrap();
        let moments = estimate(&data, &names(2)).unwrap();

        assert!(moments.converged);
        assert!(moments.iterations >= 1);
        assert_eq!(moments.n_rows, 5);
        // The imputed expectation for row 3 follows the regression line
        // (roughly 2x), pulling the column-2 mean above its observed mean.
        let observed_mean = (2.1 + 4.0 + 6.2 + 9.9) / 4.0;
        assert!(moments.mean[1] > observed_mean);
        assert!(moments.cov[[0, 1]] > 0.0);
    }

    #[test]
    fn em_is_deterministic() {
        let data = Array2::from_shape_vec(
            (4, 2),
            vec![1.0, f64::NAN, 2.0, 4.1, 3.0, 5.9, 4.0, 8.2],
        )
        .unwrap();
        let a = estimate(&data, &names(2)).unwrap();
        let b = estimate(&data, &names(2)).unwrap();
        assert_eq!(a.mean[1].to_bits(), b.mean[1].to_bits());
        assert_eq!(a.cov[[0, 1]].to_bits(), b.cov[[0, 1]].to_bits());
    }

    #[test]
    fn fully_missing_column_is_rejected() {
        let data = Array2::from_shape_vec(
            (2, 2),
            vec![1.0, f64::NAN, 2.0, f64::NAN],
        )
        .unwrap();
        match estimate(&data, &names(2)) {
            Err(MvnError::EmptyColumn(name)) => assert_eq!(name, "v1"),
            other => panic!("expected EmptyColumn, got {:?}", other.map(|_| ())),
        }
    }
}
