//! Test utilities for the load generator.
//!
//! See the modules for all available utilities.

pub mod tracing;
