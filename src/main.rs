//! Command-line entry point: orchestrates the analysis pipeline
//! (load -> derive -> describe -> fit -> plot) and the synthetic-data
//! generator. All heavy lifting lives in the library modules; this file
//! only parses arguments, wires the stages together, and decides what is
//! fatal versus what is logged and skipped.

use acuity::data::{
    self, DIBEV_A, EDUCP_A, HICOV_A, HYPEV_A, INS_BIN, LSATIS4_A, PHQCAT_A, PHSTAT_A, POVRATTC_A,
    SES_CAT, SES_SCORE,
};
use acuity::derive::{DeriveConfig, InsuranceLabeling, derive_features};
use acuity::describe::{self, MissingPolicy};
use acuity::fit::fit_model;
use acuity::model::{self, FitReport};
use acuity::{plot, simulate};
use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(
    name = "acuity",
    version,
    about = "Latent-variable analysis of population health survey data",
    long_about = "Derives socioeconomic and insurance indicators from a delimited survey \
                  extract, fits the health measurement and moderation models by maximum \
                  likelihood with full-information missing-data handling, and renders \
                  descriptive charts."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full analysis pipeline on a survey extract
    Analyze {
        /// Path to the delimited survey file (header row expected)
        data: PathBuf,

        /// Field separator, a single character
        #[arg(long, default_value = ";")]
        separator: String,

        /// Directory for rendered charts
        #[arg(long, default_value = "acuity-out")]
        out_dir: PathBuf,

        /// Insurance label convention: 'source' keeps the historical
        /// inverted labels, 'corrected' flips them
        #[arg(long, default_value = "source")]
        labeling: String,

        /// Optional path for a TOML fit report covering both models
        #[arg(long)]
        report: Option<PathBuf>,

        /// Skip chart rendering
        #[arg(long)]
        skip_plots: bool,
    },

    /// Write a seeded synthetic survey table shaped like the real extract
    Simulate {
        /// Output path for the delimited table
        output: PathBuf,

        /// Number of respondent rows
        #[arg(long, default_value = "1000")]
        rows: usize,

        /// RNG seed
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Per-cell probability of masking a value as missing
        #[arg(long, default_value = "0.0")]
        missing_rate: f64,

        /// Field separator, a single character
        #[arg(long, default_value = ";")]
        separator: String,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Analyze {
            data,
            separator,
            out_dir,
            labeling,
            report,
            skip_plots,
        } => analyze_command(&data, &separator, &out_dir, &labeling, report.as_deref(), skip_plots),
        Commands::Simulate {
            output,
            rows,
            seed,
            missing_rate,
            separator,
        } => simulate_command(&output, rows, seed, missing_rate, &separator),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn parse_separator(separator: &str) -> Result<u8, Box<dyn Error>> {
    let bytes = separator.as_bytes();
    if bytes.len() != 1 {
        return Err(format!("separator must be a single character, got '{separator}'").into());
    }
    Ok(bytes[0])
}

fn parse_labeling(labeling: &str) -> Result<InsuranceLabeling, Box<dyn Error>> {
    match labeling {
        "source" => Ok(InsuranceLabeling::SourceConvention),
        "corrected" => Ok(InsuranceLabeling::Corrected),
        other => Err(format!("labeling must be 'source' or 'corrected', got '{other}'").into()),
    }
}

fn analyze_command(
    data_path: &std::path::Path,
    separator: &str,
    out_dir: &std::path::Path,
    labeling: &str,
    report_path: Option<&std::path::Path>,
    skip_plots: bool,
) -> Result<(), Box<dyn Error>> {
    let separator = parse_separator(separator)?;
    let labeling = parse_labeling(labeling)?;

    // Loading and derivation failures are fatal: no partial table is
    // usable downstream.
    let raw = data::load_survey(data_path, separator)?;
    let table = derive_features(&raw, &DeriveConfig { labeling })?;

    println!("--- Summary statistics (pairwise complete) ---");
    let summary_columns = [
        HICOV_A, EDUCP_A, POVRATTC_A, DIBEV_A, HYPEV_A, PHSTAT_A, PHQCAT_A, LSATIS4_A, SES_SCORE,
    ];
    match describe::summary_statistics(&table, &summary_columns, MissingPolicy::Pairwise) {
        Ok(summaries) => print!("{}", describe::format_summaries(&summaries)),
        Err(e) => log::warn!("summary statistics failed: {e}"),
    }

    println!("\n--- SES category by insurance flag ---");
    match describe::cross_tab(&table, SES_CAT, INS_BIN) {
        Ok(tab) => print!("{tab}"),
        Err(e) => log::warn!("cross-tabulation failed: {e}"),
    }

    println!("\n--- Perceived-health indicator correlations (pairwise) ---");
    match describe::correlation_matrix(
        &table,
        &[PHSTAT_A, PHQCAT_A, LSATIS4_A],
        MissingPolicy::Pairwise,
    ) {
        Ok(corr) => print!("{corr}"),
        Err(e) => log::warn!("correlation matrix failed: {e}"),
    }

    // The two models are independent terminal outputs: a failure in one is
    // reported and the other still runs.
    let mut reports: Vec<FitReport> = Vec::new();
    for spec in [model::health_factor_model(), model::insurance_moderation_model()] {
        println!();
        match fit_model(&table, &spec) {
            Ok(report) => {
                print!("{report}");
                reports.push(report);
            }
            Err(e) => log::error!("fitting '{}' failed: {e}", spec.name),
        }
    }

    if let Some(path) = report_path {
        let refs: Vec<&FitReport> = reports.iter().collect();
        model::save_reports(&refs, path)?;
    }

    if skip_plots {
        log::info!("Chart rendering skipped");
        return Ok(());
    }

    println!();
    for (artifact, outcome) in plot::render_all(&table, out_dir) {
        match outcome {
            Ok(path) => log::info!("rendered {artifact} -> {}", path.display()),
            Err(e) => log::warn!("skipped {artifact}: {e}"),
        }
    }

    Ok(())
}

fn simulate_command(
    output: &std::path::Path,
    rows: usize,
    seed: u64,
    missing_rate: f64,
    separator: &str,
) -> Result<(), Box<dyn Error>> {
    let separator = parse_separator(separator)?;
    let config = simulate::SimConfig {
        rows,
        seed,
        missing_rate,
    };
    let table = simulate::simulate(&config)?;
    simulate::write_csv(&table, output, separator)?;
    println!(
        "Wrote {} simulated rows to {}",
        table.n_rows(),
        output.display()
    );
    Ok(())
}
