//! # Data Loading Module
//!
//! The exclusive entry point for user-provided survey data. It reads a
//! delimited text table (semicolon-separated in the source extract), types
//! each column by its content, and produces the [`ObservationTable`] the
//! rest of the pipeline operates on.
//!
//! - Content typing: columns whose inferred dtype is numeric become `f64`
//!   arrays with nulls encoded as NaN; everything else becomes a label
//!   column. No schema is enforced here — a required column that is absent
//!   fails with a [`ColumnError`] at its point of first use downstream,
//!   never silently as nulls.
//! - Missing values survive loading. Nothing is dropped or imputed; each
//!   downstream operation applies its own declared missing-data policy.

use ndarray::Array1;
use polars::prelude::*;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

// Survey instrument column names, kept verbatim from the source extract.
pub const HICOV_A: &str = "HICOV_A";
pub const EDUCP_A: &str = "EDUCP_A";
pub const POVRATTC_A: &str = "POVRATTC_A";
pub const DIBEV_A: &str = "DIBEV_A";
pub const HYPEV_A: &str = "HYPEV_A";
pub const PHSTAT_A: &str = "PHSTAT_A";
pub const PHQCAT_A: &str = "PHQCAT_A";
pub const LSATIS4_A: &str = "LSATIS4_A";

// Derived column names, appended by the feature deriver.
pub const INS_BIN: &str = "INS_BIN";
pub const SES_SCORE: &str = "SES_SCORE";
pub const SES_X_INS: &str = "SESxINS";
pub const SES_CAT: &str = "SES_cat";
pub const SES_GROUP: &str = "SES_GROUP";
pub const INS_LABEL: &str = "INS_LABEL";
pub const PHSTAT_REVERSED: &str = "PHSTAT_REVERSED";

/// Errors raised while reading the input file into a table.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("Could not read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("The input file '{0}' contains a header but no data rows.")]
    EmptyTable(String),
    #[error(transparent)]
    Column(#[from] ColumnError),
}

/// Errors raised when a column is requested from a table. These fire at the
/// point of first use, naming the offending column.
#[derive(Error, Debug)]
pub enum ColumnError {
    #[error("The required column '{0}' is not present in the table. Please check spelling and case.")]
    Missing(String),
    #[error("The column '{name}' holds {found} data, but {expected} data is required here.")]
    WrongKind {
        name: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("The column '{0}' already exists; derived columns are computed once and never overwritten.")]
    Duplicate(String),
}

#[derive(Debug, Clone)]
enum ColumnData {
    Numeric(Array1<f64>),
    Labels(Vec<Option<String>>),
}

/// An immutable column store of survey observations. Numeric columns are
/// `f64` arrays with NaN encoding *missing*; categorical columns are
/// optional strings. Derivation steps extend a table by value and never
/// mutate one in place.
#[derive(Debug, Clone)]
pub struct ObservationTable {
    n_rows: usize,
    columns: Vec<(String, ColumnData)>,
}

impl ObservationTable {
    pub fn new(n_rows: usize) -> Self {
        Self {
            n_rows,
            columns: Vec::new(),
        }
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|(n, _)| n == name)
    }

    /// The numeric column `name`, or a [`ColumnError`] naming it.
    pub fn numeric(&self, name: &str) -> Result<&Array1<f64>, ColumnError> {
        match self.find(name)? {
            ColumnData::Numeric(values) => Ok(values),
            ColumnData::Labels(_) => Err(ColumnError::WrongKind {
                name: name.to_string(),
                expected: "numeric",
                found: "categorical",
            }),
        }
    }

    /// The label column `name`, or a [`ColumnError`] naming it.
    pub fn labels(&self, name: &str) -> Result<&[Option<String>], ColumnError> {
        match self.find(name)? {
            ColumnData::Labels(values) => Ok(values),
            ColumnData::Numeric(_) => Err(ColumnError::WrongKind {
                name: name.to_string(),
                expected: "categorical",
                found: "numeric",
            }),
        }
    }

    /// Extends the table with a numeric column, by value.
    pub fn with_numeric(mut self, name: &str, values: Array1<f64>) -> Result<Self, ColumnError> {
        self.check_new(name, values.len())?;
        self.columns
            .push((name.to_string(), ColumnData::Numeric(values)));
        Ok(self)
    }

    /// Extends the table with a label column, by value.
    pub fn with_labels(
        mut self,
        name: &str,
        values: Vec<Option<String>>,
    ) -> Result<Self, ColumnError> {
        self.check_new(name, values.len())?;
        self.columns
            .push((name.to_string(), ColumnData::Labels(values)));
        Ok(self)
    }

    fn check_new(&self, name: &str, len: usize) -> Result<(), ColumnError> {
        if self.has_column(name) {
            return Err(ColumnError::Duplicate(name.to_string()));
        }
        assert_eq!(
            len, self.n_rows,
            "column '{name}' length must match the table row count"
        );
        Ok(())
    }

    fn find(&self, name: &str) -> Result<&ColumnData, ColumnError> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, data)| data)
            .ok_or_else(|| ColumnError::Missing(name.to_string()))
    }
}

/// Reads a delimited survey table with a header row. Columns are typed by
/// content: numeric dtypes become `f64` arrays (null -> NaN), everything
/// else becomes labels.
pub fn load_survey(path: &Path, separator: u8) -> Result<ObservationTable, DataError> {
    log::info!("Loading survey data from '{}'", path.display());

    let file = File::open(path).map_err(|source| DataError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let df = CsvReader::new(file)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(separator)),
        )
        .finish()?;

    if df.height() == 0 {
        return Err(DataError::EmptyTable(path.display().to_string()));
    }

    let names: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();

    let mut table = ObservationTable::new(df.height());
    for name in &names {
        let series = df.column(name)?;
        if is_numeric_dtype(series.dtype()) {
            let casted = series.cast(&DataType::Float64)?;
            let chunked = casted.f64()?.rechunk();
            let values: Vec<f64> = chunked
                .into_iter()
                .map(|v| v.unwrap_or(f64::NAN))
                .collect();
            table = table.with_numeric(name, Array1::from_vec(values))?;
        } else {
            let casted = series.cast(&DataType::String)?;
            let chunked = casted.str()?.rechunk();
            let values: Vec<Option<String>> = chunked
                .into_iter()
                .map(|v| v.map(|s| s.to_string()))
                .collect();
            table = table.with_labels(name, values)?;
        }
    }

    log::info!(
        "Loaded {} rows, {} columns",
        table.n_rows(),
        names.len()
    );
    Ok(table)
}

fn is_numeric_dtype(dtype: &DataType) -> bool {
    matches!(
        dtype,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float32
            | DataType::Float64
    )
}
