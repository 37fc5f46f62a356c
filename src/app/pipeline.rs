//! Shared pipeline logic behind the CLI commands.
//!
//! ingest -> validate -> screen / reduce / fit -> select -> summarize
//!
//! The commands then only deal with presentation and exports.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::info;

use crate::domain::AnalysisConfig;
use crate::engine::{AnalysisOutput, run_analysis};
use crate::error::AppError;
use crate::fit::budget::CancelToken;
use crate::fit::screen::{ScreeningReport, screen_registry};
use crate::io::ingest::{IngestedData, load_registry};

/// All computed outputs of a single `impact run`.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub ingest: IngestedData,
    pub output: AnalysisOutput,
}

fn ingest(path: &Path, config: &AnalysisConfig) -> Result<IngestedData, AppError> {
    config.validate()?;
    let ingest = load_registry(path, config)?;
    info!(
        rows = ingest.rows_read,
        strata = ingest.registry.len(),
        covariates = ingest.covariates.len(),
        "input loaded"
    );
    Ok(ingest)
}

/// Load `path` and run the full analysis.
pub fn run_file(path: &Path, config: &AnalysisConfig, cancel: &CancelToken) -> Result<RunOutput, AppError> {
    let ingest = ingest(path, config)?;
    let output = run_analysis(&ingest.registry, config, cancel)?;
    Ok(RunOutput { ingest, output })
}

/// Load `path` and screen its covariates only.
pub fn screen_file(
    path: &Path,
    config: &AnalysisConfig,
) -> Result<(IngestedData, BTreeMap<String, ScreeningReport>), AppError> {
    let ingest = ingest(path, config)?;
    ingest.registry.validate_boundaries(&config.boundaries)?;
    let reports = screen_registry(&ingest.registry, config)?;
    Ok((ingest, reports))
}
