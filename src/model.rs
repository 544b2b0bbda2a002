//! # Model Specification and Fit Artifacts
//!
//! Model specifications are structured declarative objects — lists of typed
//! measurement and regression equations over named variables — validated at
//! construction, so a malformed specification fails before it ever reaches
//! the solver. The two analysis models ship as built-in constructors.
//!
//! The fitted result is a [`FitReport`]: a parameter table with standard
//! errors, significance tests and the standardized solution, global fit
//! indices, and any non-fatal solver warnings. Reports print as a console
//! summary and serialize to a human-readable TOML artifact.

use crate::data::{
    DIBEV_A, EDUCP_A, HYPEV_A, INS_BIN, LSATIS4_A, PHQCAT_A, PHSTAT_A, POVRATTC_A, SES_SCORE,
    SES_X_INS,
};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpecError {
    #[error("Latent factor '{0}' declares no indicator variables.")]
    NoIndicators(String),
    #[error("Latent factor '{0}' needs at least two indicators to be identified.")]
    TooFewIndicators(String),
    #[error("Variable '{0}' is declared more than once in the specification.")]
    DuplicateVariable(String),
    #[error("Regression of '{0}' on itself is not a valid structural equation.")]
    SelfRegression(String),
    #[error("Regression of '{outcome}' lists predictor '{predictor}' twice.")]
    DuplicatePredictor { outcome: String, predictor: String },
    #[error("The specification contains no equations.")]
    Empty,
}

/// A latent factor and its manifest indicators (a measurement equation).
#[derive(Debug, Clone, Serialize)]
pub struct LatentFactor {
    pub name: String,
    pub indicators: Vec<String>,
}

/// A structural regression equation: `outcome ~ predictors`.
#[derive(Debug, Clone, Serialize)]
pub struct Regression {
    pub outcome: String,
    pub predictors: Vec<String>,
}

/// A validated model specification.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSpec {
    pub name: String,
    pub measurement: Vec<LatentFactor>,
    pub structural: Vec<Regression>,
}

impl ModelSpec {
    pub fn new(
        name: &str,
        measurement: Vec<LatentFactor>,
        structural: Vec<Regression>,
    ) -> Result<Self, SpecError> {
        if measurement.is_empty() && structural.is_empty() {
            return Err(SpecError::Empty);
        }

        let mut declared: Vec<&str> = Vec::new();
        for factor in &measurement {
            if factor.indicators.is_empty() {
                return Err(SpecError::NoIndicators(factor.name.clone()));
            }
            if factor.indicators.len() < 2 {
                return Err(SpecError::TooFewIndicators(factor.name.clone()));
            }
            if declared.contains(&factor.name.as_str()) {
                return Err(SpecError::DuplicateVariable(factor.name.clone()));
            }
            declared.push(&factor.name);
            for indicator in &factor.indicators {
                if declared.contains(&indicator.as_str()) {
                    return Err(SpecError::DuplicateVariable(indicator.clone()));
                }
                declared.push(indicator);
            }
        }

        for equation in &structural {
            let mut seen: Vec<&str> = Vec::new();
            for predictor in &equation.predictors {
                if predictor == &equation.outcome {
                    return Err(SpecError::SelfRegression(equation.outcome.clone()));
                }
                if seen.contains(&predictor.as_str()) {
                    return Err(SpecError::DuplicatePredictor {
                        outcome: equation.outcome.clone(),
                        predictor: predictor.clone(),
                    });
                }
                seen.push(predictor);
            }
        }

        Ok(Self {
            name: name.to_string(),
            measurement,
            structural,
        })
    }

    pub fn has_latents(&self) -> bool {
        !self.measurement.is_empty()
    }

    pub fn is_latent(&self, name: &str) -> bool {
        self.measurement.iter().any(|f| f.name == name)
    }

    /// All manifest variables the specification touches, in a stable order:
    /// measurement indicators first, then manifest variables of the
    /// structural equations.
    pub fn observed_variables(&self) -> Vec<String> {
        fn push(name: &str, observed: &mut Vec<String>) {
            if !observed.iter().any(|v| v == name) {
                observed.push(name.to_string());
            }
        }
        let mut observed: Vec<String> = Vec::new();
        for factor in &self.measurement {
            for indicator in &factor.indicators {
                push(indicator, &mut observed);
            }
        }
        for equation in &self.structural {
            if !self.is_latent(&equation.outcome) {
                push(&equation.outcome, &mut observed);
            }
            for predictor in &equation.predictors {
                if !self.is_latent(predictor) {
                    push(predictor, &mut observed);
                }
            }
        }
        observed
    }
}

/// Model 1: objective and perceived health as latent factors regressed on
/// the socioeconomic indicators, with perceived health also regressed on
/// objective health.
pub fn health_factor_model() -> ModelSpec {
    ModelSpec::new(
        "Model 1: objective and perceived health (SEM)",
        vec![
            LatentFactor {
                name: "ObjectiveHealth".to_string(),
                indicators: vec![DIBEV_A.to_string(), HYPEV_A.to_string()],
            },
            LatentFactor {
                name: "PerceivedHealth".to_string(),
                indicators: vec![
                    PHSTAT_A.to_string(),
                    PHQCAT_A.to_string(),
                    LSATIS4_A.to_string(),
                ],
            },
        ],
        vec![
            Regression {
                outcome: "PerceivedHealth".to_string(),
                predictors: vec![EDUCP_A.to_string(), POVRATTC_A.to_string()],
            },
            Regression {
                outcome: "ObjectiveHealth".to_string(),
                predictors: vec![EDUCP_A.to_string(), POVRATTC_A.to_string()],
            },
            Regression {
                outcome: "PerceivedHealth".to_string(),
                predictors: vec!["ObjectiveHealth".to_string()],
            },
        ],
    )
    .expect("built-in model specification is valid")
}

/// Model 2: self-rated health regressed on the SES composite, the
/// insurance flag, and their interaction.
pub fn insurance_moderation_model() -> ModelSpec {
    ModelSpec::new(
        "Model 2: SES x insurance moderation (regression)",
        Vec::new(),
        vec![Regression {
            outcome: PHSTAT_A.to_string(),
            predictors: vec![
                SES_SCORE.to_string(),
                INS_BIN.to_string(),
                SES_X_INS.to_string(),
            ],
        }],
    )
    .expect("built-in model specification is valid")
}

// --- Fit artifacts ---

/// One row of the parameter table. `label` uses the conventional operator
/// notation: `F =~ y` (loading), `y ~ x` (regression), `y ~~ y`
/// (variance/covariance), `y ~ 1` (intercept).
#[derive(Debug, Clone, Serialize)]
pub struct ParameterEstimate {
    pub label: String,
    pub estimate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub std_error: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub standardized: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FitIndices {
    pub chi_square: f64,
    pub df: usize,
    pub p_value: f64,
    pub baseline_chi_square: f64,
    pub baseline_df: usize,
    pub cfi: f64,
    pub tli: f64,
    pub rmsea: f64,
}

/// Non-fatal solver conditions, surfaced alongside the results for analyst
/// review rather than aborting the run.
#[derive(Debug, Clone, PartialEq)]
pub enum FitWarning {
    NotConverged { iterations: usize },
    SaturatedMomentsNotConverged { iterations: usize },
    NonPositiveDefinite,
    NegativeVariance { parameter: String },
    SingularInformation,
}

impl fmt::Display for FitWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitWarning::NotConverged { iterations } => {
                write!(f, "optimizer stopped after {iterations} iterations without converging")
            }
            FitWarning::SaturatedMomentsNotConverged { iterations } => {
                write!(
                    f,
                    "EM for the saturated moments stopped after {iterations} iterations without converging"
                )
            }
            FitWarning::NonPositiveDefinite => {
                write!(f, "the implied covariance matrix at the solution is not positive definite")
            }
            FitWarning::NegativeVariance { parameter } => {
                write!(f, "negative variance estimate for '{parameter}' (Heywood case)")
            }
            FitWarning::SingularInformation => {
                write!(f, "the information matrix is singular; standard errors are unavailable")
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to write the fit report: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize the fit report to TOML format: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// The complete fitted result for one model.
#[derive(Debug, Clone)]
pub struct FitReport {
    pub model: String,
    pub n_rows: usize,
    pub converged: bool,
    pub iterations: usize,
    pub estimates: Vec<ParameterEstimate>,
    /// `None` for saturated models (zero degrees of freedom).
    pub indices: Option<FitIndices>,
    /// Proportion of outcome variance explained; regression models only.
    pub r_squared: Option<f64>,
    pub warnings: Vec<FitWarning>,
}

#[derive(Serialize)]
struct ReportDocument<'a> {
    model: &'a str,
    n_rows: usize,
    converged: bool,
    iterations: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    r_squared: Option<f64>,
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    indices: Option<&'a FitIndices>,
    estimates: &'a [ParameterEstimate],
}

impl<'a> From<&'a FitReport> for ReportDocument<'a> {
    fn from(report: &'a FitReport) -> Self {
        ReportDocument {
            model: &report.model,
            n_rows: report.n_rows,
            converged: report.converged,
            iterations: report.iterations,
            r_squared: report.r_squared,
            warnings: report.warnings.iter().map(|w| w.to_string()).collect(),
            indices: report.indices.as_ref(),
            estimates: &report.estimates,
        }
    }
}

#[derive(Serialize)]
struct AnalysisDocument<'a> {
    models: Vec<ReportDocument<'a>>,
}

/// Serializes one or more fit reports into a single TOML artifact.
pub fn save_reports(reports: &[&FitReport], path: &Path) -> Result<(), ModelError> {
    let document = AnalysisDocument {
        models: reports.iter().map(|r| ReportDocument::from(*r)).collect(),
    };
    let serialized = toml::to_string_pretty(&document)?;
    fs::write(path, serialized)?;
    log::info!("Fit report saved to '{}'", path.display());
    Ok(())
}

fn fmt_opt(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:>9.3}"),
        None => format!("{:>9}", "-"),
    }
}

impl fmt::Display for FitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== {} ===", self.model)?;
        writeln!(
            f,
            "n = {}, {} ({} iterations)",
            self.n_rows,
            if self.converged {
                "converged"
            } else {
                "did not converge"
            },
            self.iterations
        )?;
        if let Some(indices) = &self.indices {
            writeln!(
                f,
                "chi-square = {:.3} (df = {}, p = {:.4}), CFI = {:.3}, TLI = {:.3}, RMSEA = {:.3}",
                indices.chi_square,
                indices.df,
                indices.p_value,
                indices.cfi,
                indices.tli,
                indices.rmsea
            )?;
        }
        if let Some(r2) = self.r_squared {
            writeln!(f, "R-squared = {r2:.4}")?;
        }
        writeln!(
            f,
            "{:<36} {:>10} {:>9} {:>9} {:>9} {:>9}",
            "parameter", "estimate", "se", "z", "p", "std"
        )?;
        for row in &self.estimates {
            writeln!(
                f,
                "{:<36} {:>10.4} {} {} {} {}",
                row.label,
                row.estimate,
                fmt_opt(row.std_error),
                fmt_opt(row.z_value),
                fmt_opt(row.p_value),
                fmt_opt(row.standardized),
            )?;
        }
        if self.warnings.is_empty() {
            writeln!(f, "warnings: none")?;
        } else {
            for warning in &self.warnings {
                writeln!(f, "warning: {warning}")?;
            }
        }
        Ok(())
    }
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_specs_validate() {
        let m1 = health_factor_model();
        assert!(m1.has_latents());
        assert_eq!(
            m1.observed_variables(),
            vec![
                DIBEV_A, HYPEV_A, PHSTAT_A, PHQCAT_A, LSATIS4_A, EDUCP_A, POVRATTC_A
            ]
        );

        let m2 = insurance_moderation_model();
        assert!(!m2.has_latents());
        assert_eq!(
            m2.observed_variables(),
            vec![PHSTAT_A, SES_SCORE, INS_BIN, SES_X_INS]
        );
    }

    #[test]
    fn single_indicator_factor_is_rejected() {
        let result = ModelSpec::new(
            "bad",
            vec![LatentFactor {
                name: "F".to_string(),
                indicators: vec!["y1".to_string()],
            }],
            Vec::new(),
        );
        assert!(matches!(result, Err(SpecError::TooFewIndicators(name)) if name == "F"));
    }

    #[test]
    fn duplicate_indicator_is_rejected() {
        let result = ModelSpec::new(
            "bad",
            vec![
                LatentFactor {
                    name: "F".to_string(),
                    indicators: vec!["y1".to_string(), "y2".to_string()],
                },
                LatentFactor {
                    name: "G".to_string(),
                    indicators: vec!["y2".to_string(), "y3".to_string()],
                },
            ],
            Vec::new(),
        );
        assert!(matches!(result, Err(SpecError::DuplicateVariable(name)) if name == "y2"));
    }

    #[test]
    fn self_regression_is_rejected() {
        let result = ModelSpec::new(
            "bad",
            Vec::new(),
            vec![Regression {
                outcome: "y".to_string(),
                predictors: vec!["x".to_string(), "y".to_string()],
            }],
        );
        assert!(matches!(result, Err(SpecError::SelfRegression(name)) if name == "y"));
    }

    #[test]
    fn empty_spec_is_rejected() {
        assert!(matches!(
            ModelSpec::new("bad", Vec::new(), Vec::new()),
            Err(SpecError::Empty)
        ));
    }

    #[test]
    fn report_round_trips_to_toml() {
        let report = FitReport {
            model: "test".to_string(),
            n_rows: 10,
            converged: true,
            iterations: 3,
            estimates: vec![ParameterEstimate {
                label: "y ~ x".to_string(),
                estimate: 0.5,
                std_error: Some(0.1),
                z_value: Some(5.0),
                p_value: Some(0.0001),
                standardized: Some(0.4),
            }],
            indices: None,
            r_squared: Some(0.25),
            warnings: vec![FitWarning::NonPositiveDefinite],
        };
        let file = tempfile::NamedTempFile::new().unwrap();
        save_reports(&[&report], file.path()).unwrap();
        let written = std::fs::read_to_string(file.path()).unwrap();
        assert!(written.contains("y ~ x"));
        assert!(written.contains("positive definite"));
    }

    #[test]
    fn report_display_lists_warnings() {
        let report = FitReport {
            model: "test".to_string(),
            n_rows: 5,
            converged: false,
            iterations: 100,
            estimates: Vec::new(),
            indices: None,
            r_squared: None,
            warnings: vec![FitWarning::NotConverged { iterations: 100 }],
        };
        let text = report.to_string();
        assert!(text.contains("did not converge"));
        assert!(text.contains("100 iterations"));
    }
}
