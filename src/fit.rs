//! # Model Estimation
//!
//! Fits a [`ModelSpec`] to an [`ObservationTable`] by maximum likelihood
//! with full-information handling of missing data. Estimation is staged:
//!
//! 1. The saturated mean/covariance of the modeled columns is estimated by
//!    EM over missingness patterns (`mvn`). With complete data this is the
//!    sample moments exactly.
//! 2. Latent-free specifications are solved in closed form from those
//!    moments — identical to ordinary least squares on complete tables.
//!    Latent specifications minimize the normal-theory ML discrepancy
//!    F(S, Sigma(theta)) with BFGS over a RAM parameterization: marker
//!    loadings fixed to 1, free residual variances, free covariances among
//!    exogenous variables.
//!
//! Standard errors come from the inverse numerical Hessian of the
//! log-likelihood; global fit is summarized by the chi-square test against
//! the saturated model plus CFI/TLI/RMSEA against the independence
//! baseline. Solver pathologies (non-convergence, Heywood cases, singular
//! information) surface as [`FitWarning`]s on the report, never silently.

use crate::data::{ColumnError, ObservationTable};
use crate::model::{FitIndices, FitReport, FitWarning, ModelSpec, ParameterEstimate};
use crate::mvn::{self, MvnError, SaturatedMoments};
use crate::stats;
use ndarray::{Array1, Array2, s};
use ndarray_linalg::{Cholesky, Inverse, Solve, UPLO};
use thiserror::Error;
use wolfe_bfgs::{Bfgs, BfgsSolution};

const BFGS_TOLERANCE: f64 = 1e-7;
const BFGS_MAX_ITERATIONS: usize = 300;
/// Large finite cost returned for infeasible trial points (non-invertible
/// or non-positive-definite implied covariance) so the line search can back
/// off instead of aborting.
const INFEASIBLE_COST: f64 = 1e10;

#[derive(Error, Debug)]
pub enum FitError {
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(
        "Indicator column '{column}' has (near-)zero variance across its {non_missing} observed values; the model is degenerate."
    )]
    DegenerateIndicator { column: String, non_missing: usize },
    #[error("Saturated moment estimation failed: {0}")]
    Mvn(#[from] MvnError),
    #[error("The saturated covariance matrix is not positive definite; the ML discrepancy is undefined.")]
    SingularCovariance,
    #[error(
        "The model has {free} free parameters but only {moments} distinct covariance moments; it is not identified."
    )]
    Underidentified { free: usize, moments: usize },
    #[error("BFGS optimization of the ML discrepancy failed: {0}")]
    Optimization(String),
}

/// Fits `spec` to the table and returns the full report.
pub fn fit_model(table: &ObservationTable, spec: &ModelSpec) -> Result<FitReport, FitError> {
    let names = spec.observed_variables();
    log::info!(
        "Fitting '{}' over {} observed variables",
        spec.name,
        names.len()
    );

    let mut data = Array2::<f64>::zeros((table.n_rows(), names.len()));
    for (j, name) in names.iter().enumerate() {
        let column = table.numeric(name)?;
        let observed = stats::observed(column);
        let sd = stats::sample_sd(&observed).unwrap_or(0.0);
        if sd < 1e-10 {
            return Err(FitError::DegenerateIndicator {
                column: name.clone(),
                non_missing: observed.len(),
            });
        }
        for i in 0..table.n_rows() {
            data[[i, j]] = column[i];
        }
    }

    let moments = mvn::estimate(&data, &names)?;
    let mut warnings = Vec::new();
    if !moments.converged {
        warnings.push(FitWarning::SaturatedMomentsNotConverged {
            iterations: moments.iterations,
        });
    }

    if spec.has_latents() {
        fit_latent(spec, &names, &moments, warnings)
    } else {
        fit_regression(spec, &names, &moments, warnings)
    }
}

fn some_if_finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

fn index_of(names: &[String], name: &str) -> Result<usize, FitError> {
    names
        .iter()
        .position(|n| n == name)
        .ok_or_else(|| FitError::Column(ColumnError::Missing(name.to_string())))
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

// --- Closed-form path for latent-free specifications ---

fn fit_regression(
    spec: &ModelSpec,
    names: &[String],
    moments: &SaturatedMoments,
    mut warnings: Vec<FitWarning>,
) -> Result<FitReport, FitError> {
    let n = moments.n_rows as f64;
    let mut estimates = Vec::new();
    let mut r_squared_per_equation = Vec::new();

    for equation in &spec.structural {
        let y = index_of(names, &equation.outcome)?;
        let xs: Vec<usize> = equation
            .predictors
            .iter()
            .map(|p| index_of(names, p))
            .collect::<Result<_, _>>()?;

        let sxx = submatrix(&moments.cov, &xs, &xs);
        let sxy: Array1<f64> = xs.iter().map(|&j| moments.cov[[j, y]]).collect();
        let syy = moments.cov[[y, y]];

        let beta = sxx.solve(&sxy).map_err(|_| FitError::SingularCovariance)?;
        let sxx_inv = sxx.inv().map_err(|_| FitError::SingularCovariance)?;

        let mu_x: Array1<f64> = xs.iter().map(|&j| moments.mean[j]).collect();
        let intercept = moments.mean[y] - beta.dot(&mu_x);
        let residual_variance = syy - beta.dot(&sxx.dot(&beta));
        if residual_variance <= 0.0 {
            warnings.push(FitWarning::NegativeVariance {
                parameter: format!("{} ~~ {}", equation.outcome, equation.outcome),
            });
        }
        let sigma2 = residual_variance.max(0.0);
        let r_squared = 1.0 - residual_variance / syy;
        r_squared_per_equation.push(r_squared);

        let sd_y = syy.sqrt();
        for (idx, &j) in xs.iter().enumerate() {
            let se = (sigma2 * sxx_inv[[idx, idx]] / n).sqrt();
            let z = if se > 0.0 { beta[idx] / se } else { f64::NAN };
            estimates.push(ParameterEstimate {
                label: format!("{} ~ {}", equation.outcome, names[j]),
                estimate: beta[idx],
                std_error: some_if_finite(se),
                z_value: some_if_finite(z),
                p_value: some_if_finite(stats::normal_two_sided_p(z)),
                standardized: Some(beta[idx] * moments.cov[[j, j]].sqrt() / sd_y),
            });
        }

        let quad = mu_x.dot(&sxx_inv.dot(&mu_x));
        let intercept_se = (sigma2 * (1.0 + quad) / n).sqrt();
        let intercept_z = if intercept_se > 0.0 {
            intercept / intercept_se
        } else {
            f64::NAN
        };
        estimates.push(ParameterEstimate {
            label: format!("{} ~ 1", equation.outcome),
            estimate: intercept,
            std_error: some_if_finite(intercept_se),
            z_value: some_if_finite(intercept_z),
            p_value: some_if_finite(stats::normal_two_sided_p(intercept_z)),
            standardized: None,
        });

        estimates.push(ParameterEstimate {
            label: format!("{} ~~ {}", equation.outcome, equation.outcome),
            estimate: residual_variance,
            std_error: some_if_finite(sigma2 * (2.0 / n).sqrt()),
            z_value: None,
            p_value: None,
            standardized: Some(residual_variance / syy),
        });
    }

    Ok(FitReport {
        model: spec.name.clone(),
        n_rows: moments.n_rows,
        converged: moments.converged,
        iterations: moments.iterations,
        estimates,
        // A single-equation regression with free exogenous moments is
        // saturated: zero degrees of freedom, no global fit test.
        indices: None,
        r_squared: (r_squared_per_equation.len() == 1).then(|| r_squared_per_equation[0]),
        warnings,
    })
}

// --- RAM parameterization for latent specifications ---

#[derive(Debug, Clone, Copy)]
enum Target {
    /// Asymmetric path into (row) from (column): loadings and regressions.
    A(usize, usize),
    /// Symmetric (co)variance entry.
    S(usize, usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParamKind {
    Loading,
    Path,
    Variance,
    Covariance,
}

#[derive(Debug, Clone)]
struct FreeParam {
    label: String,
    target: Target,
    kind: ParamKind,
    start: f64,
}

#[derive(Debug, Clone)]
struct Ram {
    /// Manifest variables first, then latents.
    all_names: Vec<String>,
    /// Fixed marker loadings: (indicator, latent).
    fixed_loadings: Vec<(usize, usize)>,
    free: Vec<FreeParam>,
}

fn build_ram(spec: &ModelSpec, names: &[String], cov: &Array2<f64>) -> Result<Ram, FitError> {
    let p = names.len();
    let mut all_names: Vec<String> = names.to_vec();
    for factor in &spec.measurement {
        all_names.push(factor.name.clone());
    }
    let lookup = |name: &str| -> Result<usize, FitError> {
        all_names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| FitError::Column(ColumnError::Missing(name.to_string())))
    };

    let mut fixed_loadings = Vec::new();
    let mut free = Vec::new();

    // Measurement: first indicator is the marker (loading fixed to 1).
    for factor in &spec.measurement {
        let latent = lookup(&factor.name)?;
        for (k, indicator) in factor.indicators.iter().enumerate() {
            let ind = lookup(indicator)?;
            if k == 0 {
                fixed_loadings.push((ind, latent));
            } else {
                free.push(FreeParam {
                    label: format!("{} =~ {}", factor.name, indicator),
                    target: Target::A(ind, latent),
                    kind: ParamKind::Loading,
                    start: 1.0,
                });
            }
        }
    }

    // Structural paths.
    for equation in &spec.structural {
        let out = lookup(&equation.outcome)?;
        for predictor in &equation.predictors {
            let pred = lookup(predictor)?;
            free.push(FreeParam {
                label: format!("{} ~ {}", equation.outcome, predictor),
                target: Target::A(out, pred),
                kind: ParamKind::Path,
                start: 0.0,
            });
        }
    }

    // Role bookkeeping for variance/covariance structure.
    let is_indicator = |idx: usize| {
        spec.measurement.iter().any(|f| {
            f.indicators
                .iter()
                .any(|ind| all_names[idx] == *ind)
        })
    };
    let is_outcome = |name: &str| spec.structural.iter().any(|e| e.outcome == name);

    // Residual variance for every manifest; exogenous manifests carry their
    // full variance in the same slot.
    let mut exogenous_manifests = Vec::new();
    for (idx, name) in names.iter().enumerate() {
        let exogenous = !is_indicator(idx) && !is_outcome(name);
        let start = if exogenous {
            cov[[idx, idx]]
        } else {
            0.5 * cov[[idx, idx]]
        };
        if exogenous {
            exogenous_manifests.push(idx);
        }
        free.push(FreeParam {
            label: format!("{name} ~~ {name}"),
            target: Target::S(idx, idx),
            kind: ParamKind::Variance,
            start,
        });
    }

    // Latent (disturbance) variances, scaled off the marker indicator.
    for factor in &spec.measurement {
        let latent = lookup(&factor.name)?;
        let marker = lookup(&factor.indicators[0])?;
        free.push(FreeParam {
            label: format!("{0} ~~ {0}", factor.name),
            target: Target::S(latent, latent),
            kind: ParamKind::Variance,
            start: 0.5 * cov[[marker, marker]],
        });
    }

    // Free covariances among exogenous manifest variables.
    for (a, &i) in exogenous_manifests.iter().enumerate() {
        for &j in exogenous_manifests.iter().skip(a + 1) {
            free.push(FreeParam {
                label: format!("{} ~~ {}", names[i], names[j]),
                target: Target::S(i, j),
                kind: ParamKind::Covariance,
                start: cov[[i, j]],
            });
        }
    }

    // Free covariances among exogenous latents (none is regressed on
    // anything).
    let exogenous_latents: Vec<usize> = spec
        .measurement
        .iter()
        .filter(|f| !is_outcome(&f.name))
        .map(|f| lookup(&f.name))
        .collect::<Result<_, _>>()?;
    for (a, &i) in exogenous_latents.iter().enumerate() {
        for &j in exogenous_latents.iter().skip(a + 1) {
            free.push(FreeParam {
                label: format!("{} ~~ {}", all_names[i], all_names[j]),
                target: Target::S(i, j),
                kind: ParamKind::Covariance,
                start: 0.0,
            });
        }
    }

    let moments_available = p * (p + 1) / 2;
    if free.len() > moments_available {
        return Err(FitError::Underidentified {
            free: free.len(),
            moments: moments_available,
        });
    }

    Ok(Ram {
        all_names,
        fixed_loadings,
        free,
    })
}

/// The full (manifests + latents) implied covariance, `None` when the path
/// matrix is not invertible at `theta`.
fn implied_full_covariance(ram: &Ram, theta: &Array1<f64>) -> Option<Array2<f64>> {
    let t = ram.all_names.len();
    let mut a = Array2::<f64>::zeros((t, t));
    let mut s_mat = Array2::<f64>::zeros((t, t));
    for &(ind, latent) in &ram.fixed_loadings {
        a[[ind, latent]] = 1.0;
    }
    for (param, &value) in ram.free.iter().zip(theta.iter()) {
        match param.target {
            Target::A(i, j) => a[[i, j]] = value,
            Target::S(i, j) => {
                s_mat[[i, j]] = value;
                s_mat[[j, i]] = value;
            }
        }
    }
    let b = Array2::eye(t) - a;
    let b_inv = b.inv().ok()?;
    Some(b_inv.dot(&s_mat).dot(&b_inv.t()))
}

/// Normal-theory ML discrepancy F(S, Sigma). `None` when Sigma is not
/// positive definite.
fn ml_discrepancy(sample: &Array2<f64>, ln_det_sample: f64, sigma: &Array2<f64>) -> Option<f64> {
    let chol = sigma.cholesky(UPLO::Lower).ok()?;
    let ln_det: f64 = 2.0 * chol.diag().iter().map(|v| v.ln()).sum::<f64>();
    let sigma_inv = sigma.inv().ok()?;
    let trace = sample.dot(&sigma_inv).diag().sum();
    let p = sample.nrows() as f64;
    let f = ln_det + trace - ln_det_sample - p;
    f.is_finite().then_some(f)
}

/// The ML discrepancy at `theta`. Infeasible trial points evaluate to a
/// large finite cost so the line search backs off instead of aborting.
fn discrepancy_cost(
    ram: &Ram,
    sample: &Array2<f64>,
    ln_det_sample: f64,
    theta: &Array1<f64>,
) -> f64 {
    let p = sample.nrows();
    match implied_full_covariance(ram, theta) {
        Some(full) => {
            let sigma = full.slice(s![..p, ..p]).to_owned();
            ml_discrepancy(sample, ln_det_sample, &sigma).unwrap_or(INFEASIBLE_COST)
        }
        None => INFEASIBLE_COST,
    }
}

fn fit_latent(
    spec: &ModelSpec,
    names: &[String],
    moments: &SaturatedMoments,
    mut warnings: Vec<FitWarning>,
) -> Result<FitReport, FitError> {
    let p = names.len();
    let n = moments.n_rows as f64;
    let sample = moments.cov.clone();

    let ram = build_ram(spec, names, &sample)?;
    let n_free = ram.free.len();
    let df = p * (p + 1) / 2 - n_free;

    let sample_chol = sample
        .cholesky(UPLO::Lower)
        .map_err(|_| FitError::SingularCovariance)?;
    let ln_det_sample: f64 = 2.0 * sample_chol.diag().iter().map(|v| v.ln()).sum::<f64>();

    let ram_for_bfgs = ram.clone();
    let sample_for_bfgs = sample.clone();
    let cost_and_grad = move |theta: &Array1<f64>| -> (f64, Array1<f64>) {
        let eval = |t: &Array1<f64>| {
            discrepancy_cost(&ram_for_bfgs, &sample_for_bfgs, ln_det_sample, t)
        };
        let f0 = eval(theta);
        let mut grad = Array1::<f64>::zeros(n_free);
        for i in 0..n_free {
            let h = 5e-6 * (1.0 + theta[i].abs());
            let mut plus = theta.clone();
            plus[i] += h;
            let mut minus = theta.clone();
            minus[i] -= h;
            grad[i] = (eval(&plus) - eval(&minus)) / (2.0 * h);
        }
        (f0, grad)
    };

    let start = Array1::from_vec(ram.free.iter().map(|param| param.start).collect());
    log::info!(
        "Minimizing the ML discrepancy: {} free parameters, {} covariance moments",
        n_free,
        p * (p + 1) / 2
    );

    let BfgsSolution {
        final_point: theta,
        final_value,
        iterations,
        ..
    } = Bfgs::new(start, cost_and_grad)
        .with_tolerance(BFGS_TOLERANCE)
        .with_max_iterations(BFGS_MAX_ITERATIONS)
        .run()
        .map_err(|e| FitError::Optimization(format!("{e:?}")))?;

    let iterations = iterations as usize;
    let converged = iterations < BFGS_MAX_ITERATIONS;
    if !converged {
        warnings.push(FitWarning::NotConverged { iterations });
    }
    log::info!(
        "Discrepancy minimized to {final_value:.6} in {iterations} iterations"
    );

    let full = implied_full_covariance(&ram, &theta)
        .ok_or_else(|| FitError::Optimization("implied covariance degenerate at solution".into()))?;
    let sigma = full.slice(s![..p, ..p]).to_owned();
    if sigma.cholesky(UPLO::Lower).is_err() {
        warnings.push(FitWarning::NonPositiveDefinite);
    }
    for (param, &value) in ram.free.iter().zip(theta.iter()) {
        if param.kind == ParamKind::Variance && value < 0.0 {
            warnings.push(FitWarning::NegativeVariance {
                parameter: param.label.clone(),
            });
        }
    }

    // Standard errors from the inverse Hessian of -log L = (n-1)/2 * F.
    let cost = |t: &Array1<f64>| discrepancy_cost(&ram, &sample, ln_det_sample, t);
    let log_likelihood_scale = 0.5 * (n - 1.0);
    let hessian = numerical_hessian(&cost, &theta).mapv(|v| v * log_likelihood_scale);
    let parameter_cov = match hessian.inv() {
        Ok(inverse) => Some(inverse),
        Err(_) => {
            warnings.push(FitWarning::SingularInformation);
            None
        }
    };

    let sd_all: Vec<f64> = (0..ram.all_names.len())
        .map(|i| {
            let v = full[[i, i]];
            if v > 0.0 { v.sqrt() } else { f64::NAN }
        })
        .collect();

    let standardize = |param: &FreeParam, estimate: f64| -> Option<f64> {
        let value = match (param.kind, param.target) {
            (ParamKind::Loading, Target::A(ind, latent)) => {
                estimate * sd_all[latent] / sd_all[ind]
            }
            (ParamKind::Path, Target::A(out, pred)) => estimate * sd_all[pred] / sd_all[out],
            (ParamKind::Variance, Target::S(i, _)) => estimate / full[[i, i]],
            (ParamKind::Covariance, Target::S(i, j)) => estimate / (sd_all[i] * sd_all[j]),
            _ => f64::NAN,
        };
        some_if_finite(value)
    };

    let mut estimates = Vec::new();
    // Marker loadings first, in specification order.
    for factor in &spec.measurement {
        let latent = ram
            .all_names
            .iter()
            .position(|n| n == &factor.name)
            .ok_or_else(|| FitError::Column(ColumnError::Missing(factor.name.clone())))?;
        let marker = index_of(names, &factor.indicators[0])?;
        let standardized = some_if_finite(sd_all[latent] / sd_all[marker]);
        estimates.push(ParameterEstimate {
            label: format!("{} =~ {} (marker)", factor.name, factor.indicators[0]),
            estimate: 1.0,
            std_error: None,
            z_value: None,
            p_value: None,
            standardized,
        });
    }
    for (idx, param) in ram.free.iter().enumerate() {
        let estimate = theta[idx];
        let se = parameter_cov.as_ref().and_then(|cov| {
            let v = cov[[idx, idx]];
            if v > 0.0 { Some(v.sqrt()) } else { None }
        });
        let z = se.map(|se| estimate / se);
        estimates.push(ParameterEstimate {
            label: param.label.clone(),
            estimate,
            std_error: se,
            z_value: z.and_then(some_if_finite),
            p_value: z.map(stats::normal_two_sided_p).and_then(some_if_finite),
            standardized: standardize(param, estimate),
        });
    }

    let indices = (df > 0).then(|| {
        let chi_square = ((n - 1.0) * final_value).max(0.0);
        let p_value = stats::chi_square_sf(chi_square, df as f64);

        // Independence baseline: diagonal implied covariance.
        let baseline_f: f64 =
            sample.diag().iter().map(|v| v.ln()).sum::<f64>() - ln_det_sample;
        let baseline_chi_square = ((n - 1.0) * baseline_f).max(0.0);
        let baseline_df = p * (p - 1) / 2;

        let excess = (chi_square - df as f64).max(0.0);
        let baseline_excess = (baseline_chi_square - baseline_df as f64).max(excess);
        let cfi = if baseline_excess > 0.0 {
            1.0 - excess / baseline_excess
        } else {
            1.0
        };
        let tli = if baseline_df > 0 && df > 0 {
            let baseline_ratio = baseline_chi_square / baseline_df as f64;
            let model_ratio = chi_square / df as f64;
            if baseline_ratio > 1.0 {
                (baseline_ratio - model_ratio) / (baseline_ratio - 1.0)
            } else {
                1.0
            }
        } else {
            1.0
        };
        let rmsea = (excess / (df as f64 * (n - 1.0))).sqrt();

        FitIndices {
            chi_square,
            df,
            p_value,
            baseline_chi_square,
            baseline_df,
            cfi,
            tli,
            rmsea,
        }
    });

    Ok(FitReport {
        model: spec.name.clone(),
        n_rows: moments.n_rows,
        converged: converged && moments.converged,
        iterations,
        estimates,
        indices,
        r_squared: None,
        warnings,
    })
}

fn numerical_hessian(cost: &dyn Fn(&Array1<f64>) -> f64, theta: &Array1<f64>) -> Array2<f64> {
    let k = theta.len();
    let f0 = cost(theta);
    let steps: Vec<f64> = theta.iter().map(|v| 1e-4 * (1.0 + v.abs())).collect();
    let mut hessian = Array2::<f64>::zeros((k, k));
    for i in 0..k {
        let mut plus = theta.clone();
        plus[i] += steps[i];
        let mut minus = theta.clone();
        minus[i] -= steps[i];
        hessian[[i, i]] = (cost(&plus) - 2.0 * f0 + cost(&minus)) / (steps[i] * steps[i]);
        for j in (i + 1)..k {
            let mut pp = theta.clone();
            pp[i] += steps[i];
            pp[j] += steps[j];
            let mut pm = theta.clone();
            pm[i] += steps[i];
            pm[j] -= steps[j];
            let mut mp = theta.clone();
            mp[i] -= steps[i];
            mp[j] += steps[j];
            let mut mm = theta.clone();
            mm[i] -= steps[i];
            mm[j] -= steps[j];
            let value = (cost(&pp) - cost(&pm) - cost(&mp) + cost(&mm))
                / (4.0 * steps[i] * steps[j]);
            hessian[[i, j]] = value;
            hessian[[j, i]] = value;
        }
    }
    hessian
}
