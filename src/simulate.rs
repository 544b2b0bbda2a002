//! # Synthetic Survey Data
//!
//! A seeded generator for a representative survey extract: socioeconomic
//! draws, two latent health scores built from them, and ordinal indicators
//! discretized off the latents. Useful for demos and for end-to-end tests
//! that need known structure in the data.
//!
//! The analysis pipeline itself is deterministic; randomness lives only
//! here, behind an explicit seed.

use crate::data::{
    ColumnError, DIBEV_A, EDUCP_A, HICOV_A, HYPEV_A, LSATIS4_A, ObservationTable, PHQCAT_A,
    PHSTAT_A, POVRATTC_A,
};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimError {
    #[error("Cannot simulate a table with zero rows.")]
    NoRows,
    #[error("Missing rate must lie in [0, 1); got {0}.")]
    InvalidMissingRate(f64),
    #[error("Invalid distribution parameters: {0}")]
    Parameter(String),
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error("Failed to write the simulated table: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    pub rows: usize,
    pub seed: u64,
    /// Per-cell probability of masking a raw value as missing.
    pub missing_rate: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            rows: 1000,
            seed: 42,
            missing_rate: 0.0,
        }
    }
}

// Coefficients of the latent health structure.
const OBJECTIVE_DIBEV: f64 = 0.48;
const OBJECTIVE_HYPEV: f64 = 0.61;
const PERCEIVED_OBJECTIVE: f64 = -0.48;
const PERCEIVED_POVERTY: f64 = -0.28;
const PERCEIVED_EDUCATION: f64 = 0.01;

/// Columns written to the simulated extract, in file order.
pub const SIMULATED_COLUMNS: [&str; 8] = [
    HICOV_A, EDUCP_A, POVRATTC_A, DIBEV_A, HYPEV_A, PHSTAT_A, PHQCAT_A, LSATIS4_A,
];

/// Generates a synthetic survey table. The same configuration always
/// produces the same table.
pub fn simulate(config: &SimConfig) -> Result<ObservationTable, SimError> {
    if config.rows == 0 {
        return Err(SimError::NoRows);
    }
    if !(0.0..1.0).contains(&config.missing_rate) {
        return Err(SimError::InvalidMissingRate(config.missing_rate));
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let poverty_dist =
        Normal::new(2.0, 0.5).map_err(|e| SimError::Parameter(e.to_string()))?;
    let residual = Normal::new(0.0, 0.5).map_err(|e| SimError::Parameter(e.to_string()))?;
    let indicator_noise =
        Normal::new(0.0, 0.3).map_err(|e| SimError::Parameter(e.to_string()))?;

    let n = config.rows;
    let mut hicov = Vec::with_capacity(n);
    let mut educ = Vec::with_capacity(n);
    let mut poverty = Vec::with_capacity(n);
    let mut dibev = Vec::with_capacity(n);
    let mut hypev = Vec::with_capacity(n);
    let mut phstat = Vec::with_capacity(n);
    let mut phqcat = Vec::with_capacity(n);
    let mut lsatis = Vec::with_capacity(n);

    for _ in 0..n {
        let education = rng.gen_range(1..5) as f64;
        let poverty_ratio = poverty_dist.sample(&mut rng);
        let diabetes = if rng.gen_bool(0.10) { 1.0 } else { 0.0 };
        let hypertension = if rng.gen_bool(0.20) { 1.0 } else { 0.0 };

        let objective = OBJECTIVE_DIBEV * diabetes
            + OBJECTIVE_HYPEV * hypertension
            + residual.sample(&mut rng);
        let perceived = PERCEIVED_OBJECTIVE * objective
            + PERCEIVED_POVERTY * poverty_ratio
            + PERCEIVED_EDUCATION * education
            + residual.sample(&mut rng);

        // Ordinal indicators off the perceived latent. PHSTAT_A and
        // PHQCAT_A run low = better, LSATIS4_A runs high = better.
        let discretize = |value: f64, lo: f64, hi: f64| value.round().clamp(lo, hi);
        let self_rating = discretize(
            3.0 - 1.6 * perceived + indicator_noise.sample(&mut rng),
            1.0,
            5.0,
        );
        let depression = discretize(
            1.5 - 1.2 * perceived + indicator_noise.sample(&mut rng),
            0.0,
            3.0,
        );
        let satisfaction = discretize(
            2.5 + 1.3 * perceived + indicator_noise.sample(&mut rng),
            1.0,
            4.0,
        );

        hicov.push(if rng.gen_bool(0.89) { 1.0 } else { 2.0 });
        educ.push(education);
        poverty.push(poverty_ratio);
        dibev.push(diabetes);
        hypev.push(hypertension);
        phstat.push(self_rating);
        phqcat.push(depression);
        lsatis.push(satisfaction);
    }

    let mut columns = [
        (HICOV_A, hicov),
        (EDUCP_A, educ),
        (POVRATTC_A, poverty),
        (DIBEV_A, dibev),
        (HYPEV_A, hypev),
        (PHSTAT_A, phstat),
        (PHQCAT_A, phqcat),
        (LSATIS4_A, lsatis),
    ];

    if config.missing_rate > 0.0 {
        for (_, values) in columns.iter_mut() {
            for value in values.iter_mut() {
                if rng.gen_bool(config.missing_rate) {
                    *value = f64::NAN;
                }
            }
        }
    }

    let mut table = ObservationTable::new(n);
    for (name, values) in columns {
        table = table.with_numeric(name, Array1::from_vec(values))?;
    }
    log::info!(
        "Simulated {n} rows (seed {}, missing rate {})",
        config.seed,
        config.missing_rate
    );
    Ok(table)
}

/// Writes a table of the simulated columns as a delimited text file with a
/// header row. Missing cells are written empty.
pub fn write_csv(table: &ObservationTable, path: &Path, separator: u8) -> Result<(), SimError> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(separator)
        .from_path(path)?;
    writer.write_record(SIMULATED_COLUMNS)?;

    let columns: Vec<&Array1<f64>> = SIMULATED_COLUMNS
        .iter()
        .map(|name| table.numeric(name))
        .collect::<Result<_, _>>()?;

    for i in 0..table.n_rows() {
        let record: Vec<String> = columns
            .iter()
            .map(|col| {
                let v = col[i];
                if v.is_nan() {
                    String::new()
                } else {
                    format!("{v}")
                }
            })
            .collect();
        writer.write_record(&record)?;
    }
    writer.flush().map_err(csv::Error::from)?;
    log::info!("Simulated table written to '{}'", path.display());
    Ok(())
}
