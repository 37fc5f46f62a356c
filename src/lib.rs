//! `impact-curves` library crate.
//!
//! Estimates what an outcome count series would have been without an
//! intervention (typically a vaccine introduction), from the series' own
//! pre-intervention behaviour and from control series the intervention should
//! not affect. The binary (`impact`) is a thin wrapper around this library so
//! that:
//!
//! - core logic is testable without spawning processes
//! - the engine can be driven from other front-ends
//!
//! Entry point for library use: [`engine::run_analysis`].

pub mod app;
pub mod cli;
pub mod data;
pub mod domain;
pub mod engine;
pub mod error;
pub mod fit;
pub mod impact;
pub mod io;
pub mod logging;
pub mod math;
pub mod models;
pub mod reduce;
pub mod report;
