//! Error type shared by the library and the `impact` binary.
//!
//! Every variant maps to a process exit code so `main` can stay tiny:
//!
//! - `2`: bad input or configuration (fatal before any fit)
//! - `3`: degenerate data for a single fit
//! - `4`: numerical failure
//! - `5`: cancelled or timed out
//! - `6`: aggregation request outside the observed range

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum AppError {
    /// Misaligned indices, duplicate names, non-monotonic timestamps, etc.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Constant, all-zero or otherwise unusable covariate.
    #[error("degenerate covariate '{name}': {reason}")]
    DegenerateCovariate { name: String, reason: String },

    #[error("numerical failure: {0}")]
    Numerical(String),

    #[error("invalid aggregation request: {0}")]
    InvalidAggregation(String),

    #[error("fit cancelled")]
    Cancelled,

    #[error("fit timed out after {0:?}")]
    TimedOut(Duration),

    #[error("{0}")]
    Io(String),
}

impl AppError {
    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::MalformedInput(_) | AppError::Config(_) | AppError::Io(_) => 2,
            AppError::DegenerateCovariate { .. } => 3,
            AppError::Numerical(_) => 4,
            AppError::Cancelled | AppError::TimedOut(_) => 5,
            AppError::InvalidAggregation(_) => 6,
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        AppError::MalformedInput(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        AppError::Config(message.into())
    }

    pub fn numerical(message: impl Into<String>) -> Self {
        AppError::Numerical(message.into())
    }

    pub fn degenerate(name: impl Into<String>, reason: impl Into<String>) -> Self {
        AppError::DegenerateCovariate {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
