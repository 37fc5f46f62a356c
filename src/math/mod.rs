//! Mathematical utilities: least squares, count GLMs and summary statistics.

pub mod glm;
pub mod ols;
pub mod stats;

pub use glm::*;
pub use ols::*;
pub use stats::*;
