//! Long-format CSV ingest.
//!
//! One row per (stratum, timestamp) with the outcome count, an optional
//! denominator and any number of candidate covariate columns:
//!
//! ```text
//! age_group,date,J12_18,population,A00_B99,E00_E99,...
//! <2y,2003-01-01,112,55000,1830,204,...
//! ```
//!
//! Rows may come in any order; each stratum is sorted by timestamp and then
//! validated by the registry (gaps, duplicates and misalignment are fatal).
//! Missing values are never imputed.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::NaiveDate;
use csv::StringRecord;
use tracing::{debug, warn};

use crate::data::registry::{SeriesRegistry, Stratum, TimeIndexedSeries};
use crate::domain::AnalysisConfig;
use crate::error::AppError;

/// Ingest output: the registry plus what was read.
#[derive(Debug, Clone)]
pub struct IngestedData {
    pub registry: SeriesRegistry,
    /// Candidate covariate columns, in file order.
    pub covariates: Vec<String>,
    /// Columns passed over by covariate auto-detection (non-numeric content).
    pub skipped_columns: Vec<String>,
    pub rows_read: usize,
}

pub fn load_registry(path: &Path, config: &AnalysisConfig) -> Result<IngestedData, AppError> {
    let file = File::open(path)
        .map_err(|e| AppError::Io(format!("failed to open CSV '{}': {e}", path.display())))?;
    read_registry(file, config)
}

/// Build a registry from any CSV source, using the field names in `config`.
pub fn read_registry<R: Read>(input: R, config: &AnalysisConfig) -> Result<IngestedData, AppError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(input);

    let headers = reader
        .headers()
        .map_err(|e| AppError::malformed(format!("failed to read CSV headers: {e}")))?
        .clone();
    let header_map = build_header_map(&headers);

    let group_idx = require_column(&header_map, &config.group_field)?;
    let time_idx = require_column(&header_map, &config.time_field)?;
    let outcome_idx = require_column(&header_map, &config.outcome_field)?;
    let denominator_idx = config
        .denominator_field
        .as_deref()
        .map(|name| require_column(&header_map, name))
        .transpose()?;

    let explicit = !config.covariate_fields.is_empty();
    let candidates: Vec<(String, usize)> = if explicit {
        config
            .covariate_fields
            .iter()
            .map(|name| require_column(&header_map, name).map(|idx| (name.clone(), idx)))
            .collect::<Result<_, _>>()?
    } else {
        let reserved = [Some(group_idx), Some(time_idx), Some(outcome_idx), denominator_idx];
        headers
            .iter()
            .enumerate()
            .filter(|(idx, _)| !reserved.contains(&Some(*idx)))
            .map(|(idx, name)| (clean_header(name).to_string(), idx))
            .collect()
    };

    let mut records = Vec::new();
    for (i, result) in reader.records().enumerate() {
        // records() starts after the header line; lines are 1-based.
        let line = i + 2;
        let record = result.map_err(|e| AppError::malformed(format!("line {line}: CSV parse error: {e}")))?;
        records.push((line, record));
    }
    if records.is_empty() {
        return Err(AppError::malformed("CSV contains no data rows"));
    }

    let (covariates, skipped_columns) = if explicit {
        (candidates, Vec::new())
    } else {
        let (numeric, skipped): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|(_, idx)| records.iter().all(|(_, r)| parse_f64(field(r, *idx)).is_some()));
        for (name, _) in &skipped {
            warn!(column = %name, "column is not numeric on every row; not used as a covariate");
        }
        (numeric, skipped.into_iter().map(|(name, _)| name).collect())
    };

    let mut groups: BTreeMap<String, Vec<(NaiveDate, usize, &StringRecord)>> = BTreeMap::new();
    for (line, record) in &records {
        let group = field(record, group_idx)
            .ok_or_else(|| missing(*line, &config.group_field))?
            .to_string();
        let raw_date = field(record, time_idx).ok_or_else(|| missing(*line, &config.time_field))?;
        let date = parse_date(raw_date).map_err(|e| AppError::malformed(format!("line {line}: {e}")))?;
        groups.entry(group).or_default().push((date, *line, record));
    }

    let mut registry = SeriesRegistry::new();
    for (name, mut rows) in groups {
        rows.sort_by_key(|(date, line, _)| (*date, *line));
        if let Some(pair) = rows.windows(2).find(|p| p[0].0 == p[1].0) {
            return Err(AppError::malformed(format!(
                "stratum '{name}': duplicate timestamp {} on lines {} and {}",
                pair[0].0, pair[0].1, pair[1].1
            )));
        }
        let dates: Vec<NaiveDate> = rows.iter().map(|(d, _, _)| *d).collect();
        let column = |label: &str, idx: usize| -> Result<TimeIndexedSeries, AppError> {
            let values = rows
                .iter()
                .map(|(_, line, record)| {
                    let raw = field(record, idx).ok_or_else(|| missing(*line, label))?;
                    parse_f64(Some(raw)).ok_or_else(|| {
                        AppError::malformed(format!("line {line}: invalid number '{raw}' in column '{label}'"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(TimeIndexedSeries::new(label, dates.clone(), values))
        };

        let outcome = column(&config.outcome_field, outcome_idx)?;
        let denominator = match (config.denominator_field.as_deref(), denominator_idx) {
            (Some(label), Some(idx)) => Some(column(label, idx)?),
            _ => None,
        };
        let series = covariates
            .iter()
            .map(|(label, idx)| column(label, *idx))
            .collect::<Result<Vec<_>, _>>()?;

        let stratum = Stratum::from_series(name, config.periodicity, outcome, denominator, series)?;
        debug!(stratum = stratum.name(), periods = stratum.len(), "stratum ingested");
        registry.insert(stratum)?;
    }

    Ok(IngestedData {
        registry,
        covariates: covariates.into_iter().map(|(name, _)| name).collect(),
        skipped_columns,
        rows_read: records.len(),
    })
}

fn build_header_map(headers: &StringRecord) -> HashMap<String, usize> {
    headers
        .iter()
        .enumerate()
        .map(|(idx, name)| (clean_header(name).to_ascii_lowercase(), idx))
        .collect()
}

/// Strips whitespace and a UTF-8 BOM on the first header.
fn clean_header(name: &str) -> &str {
    name.trim().trim_start_matches('\u{feff}')
}

fn require_column(header_map: &HashMap<String, usize>, name: &str) -> Result<usize, AppError> {
    header_map
        .get(&name.trim().to_ascii_lowercase())
        .copied()
        .ok_or_else(|| AppError::malformed(format!("missing required column: `{name}`")))
}

fn field(record: &StringRecord, idx: usize) -> Option<&str> {
    record.get(idx).map(str::trim).filter(|s| !s.is_empty())
}

fn missing(line: usize, column: &str) -> AppError {
    AppError::malformed(format!("line {line}: missing value in column '{column}'"))
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    const FMTS: [&str; 3] = ["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y"];
    for fmt in FMTS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(d);
        }
    }
    // Year-month only: the first of the month.
    if let Ok(d) = NaiveDate::parse_from_str(&format!("{s}-01"), "%Y-%m-%d") {
        return Ok(d);
    }
    Err(format!(
        "invalid date '{s}'; expected YYYY-MM-DD, YYYY/MM/DD, DD/MM/YYYY or YYYY-MM"
    ))
}

fn parse_f64(s: Option<&str>) -> Option<f64> {
    let v = s?.parse::<f64>().ok()?;
    if v.is_finite() { Some(v) } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PeriodBoundaries;

    fn config(covariates: &[&str]) -> AnalysisConfig {
        let d = |y, m| NaiveDate::from_ymd_opt(y, m, 1).unwrap();
        let mut config = AnalysisConfig::new(
            "cases",
            PeriodBoundaries {
                intervention: d(2011, 1),
                eval_start: d(2011, 1),
                eval_end: None,
            },
        );
        config.group_field = "group".to_string();
        config.covariate_fields = covariates.iter().map(|s| s.to_string()).collect();
        config
    }

    fn csv_text(groups: &[&str], months: usize) -> String {
        let mut out = String::from("group,date,cases,label,ctrl_a,Ctrl_B\n");
        // Rows in reverse order to exercise sorting.
        for g in groups {
            for m in (0..months).rev() {
                let (y, mo) = (2010 + m / 12, m % 12 + 1);
                out.push_str(&format!("{g},{y}-{mo:02}-01,{},x{m},{},{}\n", 10 + m, 100 + m, 3));
            }
        }
        out
    }

    #[test]
    fn reads_long_format_and_detects_numeric_covariates() {
        let data = read_registry(csv_text(&["a", "b"], 24).as_bytes(), &config(&[])).unwrap();
        assert_eq!(data.registry.len(), 2);
        assert_eq!(data.rows_read, 48);
        assert_eq!(data.covariates, ["ctrl_a", "Ctrl_B"]);
        assert_eq!(data.skipped_columns, ["label"]);

        let a = data.registry.get("a").unwrap();
        assert_eq!(a.len(), 24);
        assert_eq!(a.outcome()[0], 10.0);
        assert_eq!(a.dates()[0], NaiveDate::from_ymd_opt(2010, 1, 1).unwrap());
        assert_eq!(a.covariates().get("ctrl_a").unwrap()[23], 123.0);
    }

    #[test]
    fn explicit_covariates_must_exist() {
        let err = read_registry(csv_text(&["a"], 24).as_bytes(), &config(&["nope"])).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn explicit_non_numeric_covariate_is_rejected() {
        let err = read_registry(csv_text(&["a"], 24).as_bytes(), &config(&["label"])).unwrap_err();
        assert!(matches!(err, AppError::MalformedInput(_)));
    }

    #[test]
    fn duplicate_timestamps_are_rejected() {
        let mut text = csv_text(&["a"], 24);
        text.push_str("a,2010-01-01,5,x,1,1\n");
        let err = read_registry(text.as_bytes(), &config(&[])).unwrap_err();
        assert!(err.to_string().contains("duplicate timestamp"));
    }

    #[test]
    fn gaps_are_rejected() {
        let text: String = csv_text(&["a"], 24)
            .lines()
            .filter(|l| !l.contains("2010-06-01"))
            .map(|l| format!("{l}\n"))
            .collect();
        assert!(read_registry(text.as_bytes(), &config(&[])).is_err());
    }

    #[test]
    fn missing_outcome_value_is_not_imputed() {
        let mut text = csv_text(&["a"], 24);
        text.push_str("b,2010-01-01,,x,1,1\n");
        let err = read_registry(text.as_bytes(), &config(&["ctrl_a"])).unwrap_err();
        assert!(err.to_string().contains("missing value"));
    }

    #[test]
    fn parses_year_month_dates() {
        assert_eq!(parse_date("2012-03").unwrap(), NaiveDate::from_ymd_opt(2012, 3, 1).unwrap());
        assert!(parse_date("March 2012").is_err());
    }
}
