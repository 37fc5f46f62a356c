//! Count-regression model structure.
//!
//! Design matrices are built by small, pure functions so that the screener, the
//! sampler and the segmented regression can share them.

pub mod design;

pub use design::*;
