//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - configuration enums (`Periodicity`, `Family`, `ModelVariant`, `PcaRetention`)
//! - period boundaries and the run-wide `AnalysisConfig`
//! - small result shapes shared by fitting and aggregation (`IntervalEstimate`)

pub mod types;

pub use types::*;
