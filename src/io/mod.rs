//! Input/output helpers.
//!
//! - long-format CSV ingest + validation (`ingest`)
//! - JSON summary, counterfactual CSV and dataset exports (`export`)

pub mod export;
pub mod ingest;

pub use export::*;
pub use ingest::*;
