//! Result and dataset exports.
//!
//! - the full analysis output as JSON (configuration included)
//! - per-period counterfactual curves as CSV, easy to plot elsewhere
//! - a registry back to the long CSV layout read by `ingest`

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;

use crate::data::registry::SeriesRegistry;
use crate::domain::AnalysisConfig;
use crate::engine::AnalysisOutput;
use crate::error::AppError;

fn create(path: &Path) -> Result<BufWriter<File>, AppError> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|e| AppError::Io(format!("failed to create '{}': {e}", path.display())))
}

fn csv_error(path: &Path, e: csv::Error) -> AppError {
    AppError::Io(format!("failed to write CSV '{}': {e}", path.display()))
}

pub fn write_summary_json(path: &Path, output: &AnalysisOutput) -> Result<(), AppError> {
    let mut out = create(path)?;
    serde_json::to_writer_pretty(&mut out, output)
        .map_err(|e| AppError::Io(format!("failed to write JSON '{}': {e}", path.display())))?;
    out.flush()
        .map_err(|e| AppError::Io(format!("failed to write JSON '{}': {e}", path.display())))
}

#[derive(Debug, Serialize)]
struct CurveRow<'a> {
    stratum: &'a str,
    variant: &'a str,
    preferred: bool,
    date: chrono::NaiveDate,
    observed: f64,
    median: f64,
    lower: f64,
    upper: f64,
}

/// One row per (stratum, fitted variant, period).
pub fn write_counterfactual_csv(
    path: &Path,
    output: &AnalysisOutput,
    registry: &SeriesRegistry,
) -> Result<(), AppError> {
    let mut writer = csv::Writer::from_writer(create(path)?);
    for (name, result) in &output.strata {
        let Some(stratum) = registry.get(name) else {
            continue;
        };
        let preferred = result.preferred.as_ref().map(|p| p.variant);
        for (&variant, outcome) in &result.variants {
            let Some((model, _)) = outcome.fitted() else {
                continue;
            };
            let cf = &model.counterfactual;
            for (t, &date) in cf.dates.iter().enumerate() {
                writer
                    .serialize(CurveRow {
                        stratum: name,
                        variant: variant.name(),
                        preferred: preferred == Some(variant),
                        date,
                        observed: stratum.outcome()[t],
                        median: cf.median[t],
                        lower: cf.lower[t],
                        upper: cf.upper[t],
                    })
                    .map_err(|e| csv_error(path, e))?;
            }
        }
    }
    writer
        .flush()
        .map_err(|e| AppError::Io(format!("failed to write CSV '{}': {e}", path.display())))
}

/// Write a registry in the long layout `ingest::read_registry` expects for `config`.
pub fn write_long_csv<W: Write>(
    out: W,
    registry: &SeriesRegistry,
    config: &AnalysisConfig,
) -> Result<(), AppError> {
    let mut writer = csv::Writer::from_writer(out);
    let to_io = |e: csv::Error| AppError::Io(format!("failed to write CSV: {e}"));

    let Some(first) = registry.iter().next() else {
        return Err(AppError::malformed("no strata to write"));
    };
    let covariates: Vec<String> = first.covariates().names().to_vec();

    let mut header = vec![
        config.group_field.clone(),
        config.time_field.clone(),
        config.outcome_field.clone(),
    ];
    if let Some(d) = &config.denominator_field {
        header.push(d.clone());
    }
    header.extend(covariates.iter().cloned());
    writer.write_record(&header).map_err(to_io)?;

    for stratum in registry.iter() {
        if stratum.covariates().names() != covariates.as_slice() {
            return Err(AppError::malformed(format!(
                "stratum '{}' has a different covariate set",
                stratum.name()
            )));
        }
        for (t, date) in stratum.dates().iter().enumerate() {
            let mut row = vec![
                stratum.name().to_string(),
                date.format("%Y-%m-%d").to_string(),
                stratum.outcome()[t].to_string(),
            ];
            if config.denominator_field.is_some() {
                row.push(stratum.denominator().map(|d| d[t].to_string()).unwrap_or_default());
            }
            row.extend(stratum.covariates().iter().map(|(_, values)| values[t].to_string()));
            writer.write_record(&row).map_err(to_io)?;
        }
    }
    writer
        .flush()
        .map_err(|e| AppError::Io(format!("failed to write CSV: {e}")))
}

pub fn write_long_csv_file(path: &Path, registry: &SeriesRegistry, config: &AnalysisConfig) -> Result<(), AppError> {
    write_long_csv(create(path)?, registry, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::sample::{SyntheticSpec, synthetic_registry};
    use crate::io::ingest::read_registry;

    #[test]
    fn long_csv_is_read_back_unchanged() {
        let spec = SyntheticSpec {
            population: Some(25_000.0),
            ..SyntheticSpec::default()
        };
        let (registry, config) = synthetic_registry(&spec).unwrap();
        let mut buf = Vec::new();
        write_long_csv(&mut buf, &registry, &config).unwrap();

        let back = read_registry(buf.as_slice(), &config).unwrap();
        assert_eq!(back.registry.len(), registry.len());
        for stratum in registry.iter() {
            assert_eq!(back.registry.get(stratum.name()).unwrap(), stratum);
        }
    }
}
