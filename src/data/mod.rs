//! Input series for the engine.
//!
//! - validated per-stratum series on a shared time index (`registry`)
//! - period boundaries resolved to index ranges (`windows`)
//! - seeded synthetic strata for demonstrations and tests (`sample`)

pub mod registry;
pub mod sample;
pub mod windows;

pub use registry::*;
pub use sample::*;
pub use windows::*;
