//! Model fitting.
//!
//! Responsibilities:
//!
//! - screen candidate covariates one at a time
//! - sample the Bayesian count regressions and simulate counterfactuals
//! - fit each counterfactual variant and pick the preferred one
//! - enforce cancellation and per-fit time limits

pub mod budget;
pub mod sampler;
pub mod screen;
pub mod selection;
pub mod variants;

pub use budget::*;
pub use screen::*;
pub use selection::*;
pub use variants::*;
