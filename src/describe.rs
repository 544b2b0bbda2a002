//! # Descriptive Reporting
//!
//! Summary statistics, cross-tabulation, correlation matrices, and grouped
//! profiles over the derived table. Every operation takes an explicit
//! [`MissingPolicy`] instead of relying on an implicit library default, so
//! the numbers printed here are reproducible and auditable. These are
//! terminal outputs for inspection; nothing feeds back into model fitting.

use crate::data::{ColumnError, ObservationTable};
use crate::stats;
use itertools::Itertools;
use ndarray::Array2;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DescribeError {
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error("No rows remain for '{column}' under the {policy:?} missing-data policy.")]
    EmptySelection {
        column: String,
        policy: MissingPolicy,
    },
}

/// How an operation treats rows with missing values: drop the row when any
/// requested column is missing (`Listwise`), or drop per column/pair
/// (`Pairwise`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingPolicy {
    Listwise,
    Pairwise,
}

#[derive(Debug, Clone)]
pub struct ColumnSummary {
    pub column: String,
    pub n: usize,
    pub mean: f64,
    pub sd: f64,
    pub min: f64,
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
    pub max: f64,
}

/// Per-column n, mean, sd and quartiles for the requested columns.
pub fn summary_statistics(
    table: &ObservationTable,
    columns: &[&str],
    policy: MissingPolicy,
) -> Result<Vec<ColumnSummary>, DescribeError> {
    let mut kept_rows: Option<Vec<usize>> = None;
    if policy == MissingPolicy::Listwise {
        let mut keep: Vec<usize> = (0..table.n_rows()).collect();
        for name in columns {
            let column = table.numeric(name)?;
            keep.retain(|&i| column[i].is_finite());
        }
        kept_rows = Some(keep);
    }

    let mut summaries = Vec::with_capacity(columns.len());
    for name in columns {
        let column = table.numeric(name)?;
        let values: Vec<f64> = match &kept_rows {
            Some(rows) => rows.iter().map(|&i| column[i]).collect(),
            None => stats::observed(column),
        };
        if values.is_empty() {
            return Err(DescribeError::EmptySelection {
                column: name.to_string(),
                policy,
            });
        }
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        summaries.push(ColumnSummary {
            column: name.to_string(),
            n: values.len(),
            mean: stats::sample_mean(&values).unwrap_or(f64::NAN),
            sd: stats::sample_sd(&values).unwrap_or(f64::NAN),
            min,
            q1: stats::quantile(&values, 0.25).unwrap_or(f64::NAN),
            median: stats::median(&values).unwrap_or(f64::NAN),
            q3: stats::quantile(&values, 0.75).unwrap_or(f64::NAN),
            max,
        });
    }
    Ok(summaries)
}

/// Renders summaries as an aligned console table.
pub fn format_summaries(summaries: &[ColumnSummary]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{:<18} {:>6} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9}\n",
        "column", "n", "mean", "sd", "min", "q1", "median", "q3", "max"
    ));
    for s in summaries {
        out.push_str(&format!(
            "{:<18} {:>6} {:>9.3} {:>9.3} {:>9.3} {:>9.3} {:>9.3} {:>9.3} {:>9.3}\n",
            s.column, s.n, s.mean, s.sd, s.min, s.q1, s.median, s.q3, s.max
        ));
    }
    out
}

/// The per-row category of a column that may be numeric or labeled.
/// Numeric levels render integers without a decimal point.
pub fn level_of(table: &ObservationTable, column: &str, row: usize) -> Result<Option<String>, ColumnError> {
    if let Ok(labels) = table.labels(column) {
        return Ok(labels[row].clone());
    }
    let values = table.numeric(column)?;
    let v = values[row];
    if v.is_nan() {
        return Ok(None);
    }
    if v == v.trunc() {
        Ok(Some(format!("{}", v as i64)))
    } else {
        Ok(Some(format!("{v:.3}")))
    }
}

#[derive(Debug, Clone)]
pub struct CrossTab {
    pub row_column: String,
    pub col_column: String,
    pub row_levels: Vec<String>,
    pub col_levels: Vec<String>,
    pub counts: Array2<usize>,
    /// Rows excluded because either variable was missing.
    pub excluded_missing: usize,
}

impl CrossTab {
    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }
}

impl fmt::Display for CrossTab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} x {}", self.row_column, self.col_column)?;
        write!(f, "{:<12}", "")?;
        for level in &self.col_levels {
            write!(f, " {level:>10}")?;
        }
        writeln!(f, " {:>10}", "total")?;
        for (i, level) in self.row_levels.iter().enumerate() {
            write!(f, "{level:<12}")?;
            let mut row_total = 0;
            for j in 0..self.col_levels.len() {
                write!(f, " {:>10}", self.counts[[i, j]])?;
                row_total += self.counts[[i, j]];
            }
            writeln!(f, " {row_total:>10}")?;
        }
        write!(f, "{:<12}", "total")?;
        for j in 0..self.col_levels.len() {
            let col_total: usize = (0..self.row_levels.len()).map(|i| self.counts[[i, j]]).sum();
            write!(f, " {col_total:>10}")?;
        }
        writeln!(f, " {:>10}", self.total())?;
        if self.excluded_missing > 0 {
            writeln!(f, "({} rows excluded for missing values)", self.excluded_missing)?;
        }
        Ok(())
    }
}

/// Counts of the joint levels of two categorical (or discrete numeric)
/// columns. Rows missing either variable are excluded and counted.
pub fn cross_tab(
    table: &ObservationTable,
    rows: &str,
    cols: &str,
) -> Result<CrossTab, DescribeError> {
    let mut pairs: Vec<(String, String)> = Vec::new();
    let mut excluded = 0usize;
    for i in 0..table.n_rows() {
        match (level_of(table, rows, i)?, level_of(table, cols, i)?) {
            (Some(r), Some(c)) => pairs.push((r, c)),
            _ => excluded += 1,
        }
    }

    let row_levels: Vec<String> = pairs.iter().map(|(r, _)| r.clone()).unique().sorted().collect();
    let col_levels: Vec<String> = pairs.iter().map(|(_, c)| c.clone()).unique().sorted().collect();

    let mut counts = Array2::<usize>::zeros((row_levels.len(), col_levels.len()));
    for (r, c) in &pairs {
        // Levels were built from the same pairs; the positions exist.
        if let (Some(i), Some(j)) = (
            row_levels.iter().position(|l| l == r),
            col_levels.iter().position(|l| l == c),
        ) {
            counts[[i, j]] += 1;
        }
    }

    Ok(CrossTab {
        row_column: rows.to_string(),
        col_column: cols.to_string(),
        row_levels,
        col_levels,
        counts,
        excluded_missing: excluded,
    })
}

#[derive(Debug, Clone)]
pub struct CorrelationMatrix {
    pub columns: Vec<String>,
    pub values: Array2<f64>,
    pub policy: MissingPolicy,
}

impl fmt::Display for CorrelationMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<12}", "")?;
        for name in &self.columns {
            write!(f, " {name:>12}")?;
        }
        writeln!(f)?;
        for (i, name) in self.columns.iter().enumerate() {
            write!(f, "{name:<12}")?;
            for j in 0..self.columns.len() {
                write!(f, " {:>12.3}", self.values[[i, j]])?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Pearson correlations among the requested columns. Under `Pairwise` each
/// pair uses its own complete rows; under `Listwise` all columns share one
/// complete-row set. Undefined entries (degenerate pairs) are NaN.
pub fn correlation_matrix(
    table: &ObservationTable,
    columns: &[&str],
    policy: MissingPolicy,
) -> Result<CorrelationMatrix, DescribeError> {
    let arrays: Vec<_> = columns
        .iter()
        .map(|name| table.numeric(name))
        .collect::<Result<_, _>>()?;

    let listwise_rows: Vec<usize> = (0..table.n_rows())
        .filter(|&i| arrays.iter().all(|col| col[i].is_finite()))
        .collect();

    let k = columns.len();
    let mut values = Array2::<f64>::from_elem((k, k), f64::NAN);
    for i in 0..k {
        values[[i, i]] = 1.0;
        for j in (i + 1)..k {
            let (xs, ys): (Vec<f64>, Vec<f64>) = match policy {
                MissingPolicy::Listwise => (
                    listwise_rows.iter().map(|&r| arrays[i][r]).collect(),
                    listwise_rows.iter().map(|&r| arrays[j][r]).collect(),
                ),
                MissingPolicy::Pairwise => (0..table.n_rows())
                    .filter(|&r| arrays[i][r].is_finite() && arrays[j][r].is_finite())
                    .map(|r| (arrays[i][r], arrays[j][r]))
                    .unzip(),
            };
            let r = stats::pearson(&xs, &ys).unwrap_or(f64::NAN);
            values[[i, j]] = r;
            values[[j, i]] = r;
        }
    }

    Ok(CorrelationMatrix {
        columns: columns.iter().map(|s| s.to_string()).collect(),
        values,
        policy,
    })
}

/// One cell of a grouped mean profile: `series` crossed with `group`.
#[derive(Debug, Clone)]
pub struct GroupCell {
    pub group: String,
    pub series: String,
    pub n: usize,
    pub mean: f64,
    pub std_error: f64,
}

/// Mean and standard error of `outcome` within SES-score quartiles crossed
/// with the levels of `by` — the profile behind the interaction plot.
/// Rows missing any of the three ingredients are excluded.
pub fn interaction_profile(
    table: &ObservationTable,
    outcome: &str,
    score: &str,
    by: &str,
) -> Result<Vec<GroupCell>, DescribeError> {
    let outcome_values = table.numeric(outcome)?;
    let score_values = table.numeric(score)?;

    let finite_scores = stats::observed(score_values);
    let q25 = stats::quantile(&finite_scores, 0.25);
    let q50 = stats::quantile(&finite_scores, 0.50);
    let q75 = stats::quantile(&finite_scores, 0.75);
    let (q25, q50, q75) = match (q25, q50, q75) {
        (Some(a), Some(b), Some(c)) => (a, b, c),
        _ => {
            return Err(DescribeError::EmptySelection {
                column: score.to_string(),
                policy: MissingPolicy::Listwise,
            });
        }
    };
    let quartile_of = |v: f64| -> &'static str {
        if v < q25 {
            "Q1 (low)"
        } else if v < q50 {
            "Q2"
        } else if v < q75 {
            "Q3"
        } else {
            "Q4 (high)"
        }
    };

    let mut cells: Vec<(String, String, Vec<f64>)> = Vec::new();
    for i in 0..table.n_rows() {
        let y = outcome_values[i];
        let s = score_values[i];
        let level = level_of(table, by, i)?;
        let (Some(level), true) = (level, y.is_finite() && s.is_finite()) else {
            continue;
        };
        let group = quartile_of(s).to_string();
        match cells
            .iter_mut()
            .find(|(g, l, _)| *g == group && *l == level)
        {
            Some((_, _, values)) => values.push(y),
            None => cells.push((group, level, vec![y])),
        }
    }

    let order = ["Q1 (low)", "Q2", "Q3", "Q4 (high)"];
    cells.sort_by_key(|(group, level, _)| {
        (
            order.iter().position(|o| o == group).unwrap_or(usize::MAX),
            level.clone(),
        )
    });

    Ok(cells
        .into_iter()
        .map(|(group, series, values)| {
            let n = values.len();
            let mean = stats::sample_mean(&values).unwrap_or(f64::NAN);
            let sd = stats::sample_sd(&values).unwrap_or(f64::NAN);
            GroupCell {
                group,
                series,
                n,
                mean,
                std_error: sd / (n as f64).sqrt(),
            }
        })
        .collect())
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{HICOV_A, INS_BIN, SES_CAT, SES_SCORE};
    use approx::assert_abs_diff_eq;
    use ndarray::Array1;

    fn table_with_missing() -> ObservationTable {
        ObservationTable::new(6)
            .with_numeric("a", Array1::from_vec(vec![1.0, 2.0, 3.0, 4.0, f64::NAN, 6.0]))
            .unwrap()
            .with_numeric("b", Array1::from_vec(vec![2.0, 4.0, 6.0, f64::NAN, 10.0, 12.0]))
            .unwrap()
            .with_numeric("c", Array1::from_vec(vec![1.0, 1.0, 2.0, 2.0, 3.0, 3.0]))
            .unwrap()
    }

    #[test]
    fn pairwise_and_listwise_policies_differ() {
        let table = table_with_missing();
        let pairwise = summary_statistics(&table, &["a", "b"], MissingPolicy::Pairwise).unwrap();
        let listwise = summary_statistics(&table, &["a", "b"], MissingPolicy::Listwise).unwrap();

        // Pairwise keeps each column's own observed values.
        assert_eq!(pairwise[0].n, 5);
        assert_eq!(pairwise[1].n, 5);
        // Listwise keeps only the four rows complete on both.
        assert_eq!(listwise[0].n, 4);
        assert_eq!(listwise[1].n, 4);
        assert_abs_diff_eq!(listwise[0].mean, 3.0, epsilon = 1e-12);
    }

    #[test]
    fn summary_quartiles_are_interpolated() {
        let table = table_with_missing();
        let summaries = summary_statistics(&table, &["c"], MissingPolicy::Pairwise).unwrap();
        assert_abs_diff_eq!(summaries[0].median, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(summaries[0].q1, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(summaries[0].q3, 2.75, epsilon = 1e-12);
    }

    #[test]
    fn cross_tab_totals_exclude_missing_rows() {
        let derived = crate::derive::derive_features(
            &ObservationTable::new(6)
                .with_numeric(
                    HICOV_A,
                    Array1::from_vec(vec![1.0, 2.0, 1.0, 2.0, f64::NAN, 1.0]),
                )
                .unwrap()
                .with_numeric(
                    crate::data::EDUCP_A,
                    Array1::from_vec(vec![1.0, 2.0, 3.0, 4.0, 2.0, 3.0]),
                )
                .unwrap()
                .with_numeric(
                    crate::data::POVRATTC_A,
                    Array1::from_vec(vec![0.5, 1.5, 2.5, 3.5, 1.0, 2.0]),
                )
                .unwrap()
                .with_numeric(
                    crate::data::PHSTAT_A,
                    Array1::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 2.0]),
                )
                .unwrap(),
            &crate::derive::DeriveConfig::default(),
        )
        .unwrap();

        let tab = cross_tab(&derived, SES_CAT, INS_BIN).unwrap();
        // HICOV_A is missing in one row, so INS_BIN is missing there too.
        assert_eq!(tab.excluded_missing, 1);
        assert_eq!(tab.total(), 5);
        assert_eq!(tab.col_levels, vec!["0", "1"]);
    }

    #[test]
    fn correlation_matrix_is_symmetric_with_unit_diagonal() {
        let table = table_with_missing();
        let corr =
            correlation_matrix(&table, &["a", "b", "c"], MissingPolicy::Pairwise).unwrap();
        for i in 0..3 {
            assert_abs_diff_eq!(corr.values[[i, i]], 1.0, epsilon = 1e-12);
            for j in 0..3 {
                let a = corr.values[[i, j]];
                let b = corr.values[[j, i]];
                if a.is_finite() || b.is_finite() {
                    assert_abs_diff_eq!(a, b, epsilon = 1e-12);
                }
            }
        }
        // a and b are exactly proportional on their complete pairs.
        assert_abs_diff_eq!(corr.values[[0, 1]], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn interaction_profile_orders_quartiles() {
        let n = 16;
        let score: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let outcome: Vec<f64> = (0..n).map(|i| (i % 4) as f64).collect();
        let labels: Vec<Option<String>> = (0..n)
            .map(|i| {
                Some(if i % 2 == 0 { "Insured" } else { "Uninsured" }.to_string())
            })
            .collect();
        let table = ObservationTable::new(n)
            .with_numeric("outcome", Array1::from_vec(outcome))
            .unwrap()
            .with_numeric(SES_SCORE, Array1::from_vec(score))
            .unwrap()
            .with_labels("INS_LABEL", labels)
            .unwrap();

        let profile = interaction_profile(&table, "outcome", SES_SCORE, "INS_LABEL").unwrap();
        assert_eq!(profile.len(), 8);
        assert_eq!(profile[0].group, "Q1 (low)");
        assert_eq!(profile[0].series, "Insured");
        assert_eq!(profile.last().unwrap().group, "Q4 (high)");
        for cell in &profile {
            assert!(cell.n >= 1);
            assert!(cell.mean.is_finite());
        }
    }
}
