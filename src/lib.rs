//! Latent-variable analysis of population health survey data: derived
//! socioeconomic and insurance indicators, maximum-likelihood model fitting
//! with full-information missing-data handling, and descriptive reporting.

pub mod data;
pub mod derive;
pub mod describe;
pub mod fit;
pub mod model;
pub mod mvn;
pub mod plot;
pub mod simulate;
pub mod stats;
