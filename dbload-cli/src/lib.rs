//! Command line front end of the load generator.
//!
//! Loads the layered [`config::Config`], drives a run through [`dbload_engine`] and exports the
//! results as CSV and JSON files. While a run is in progress, [`exporter::PrometheusExporter`]
//! optionally serves live metrics.

pub mod cli;
pub mod config;
pub mod exporter;
pub mod observability;
pub mod output;
