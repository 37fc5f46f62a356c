//! Series registry: per-stratum outcome and covariates on a shared time index.
//!
//! Everything here is validated once at construction so the fitting code can
//! assume aligned, gap-free, strictly increasing series. Nothing in this module
//! computes anything beyond that validation.

use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDate;

use crate::domain::{PeriodBoundaries, Periodicity};
use crate::error::AppError;

/// An ordered sequence of `(timestamp, value)` pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeIndexedSeries {
    pub name: String,
    pub dates: Vec<NaiveDate>,
    pub values: Vec<f64>,
}

impl TimeIndexedSeries {
    pub fn new(name: impl Into<String>, dates: Vec<NaiveDate>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            dates,
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A validated, gap-free time index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeIndex {
    dates: Vec<NaiveDate>,
}

impl TimeIndex {
    pub fn new(dates: Vec<NaiveDate>, periodicity: Periodicity) -> Result<Self, AppError> {
        if dates.is_empty() {
            return Err(AppError::malformed("time index is empty"));
        }
        for pair in dates.windows(2) {
            if pair[1] <= pair[0] {
                return Err(AppError::malformed(format!(
                    "timestamps not strictly increasing: {} followed by {}",
                    pair[0], pair[1]
                )));
            }
            if periodicity.next(pair[0]) != Some(pair[1]) {
                return Err(AppError::malformed(format!(
                    "gap in {:?} time index between {} and {}",
                    periodicity, pair[0], pair[1]
                )));
            }
        }
        Ok(Self { dates })
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn first(&self) -> NaiveDate {
        self.dates[0]
    }

    pub fn last(&self) -> NaiveDate {
        self.dates[self.dates.len() - 1]
    }

    /// Index of the first timestamp `>= date` (may equal `len()`).
    pub fn position_at_or_after(&self, date: NaiveDate) -> usize {
        self.dates.partition_point(|d| *d < date)
    }

    /// Index of the last timestamp `<= date`, if any.
    pub fn position_at_or_before(&self, date: NaiveDate) -> Option<usize> {
        self.dates.partition_point(|d| *d <= date).checked_sub(1)
    }
}

/// Covariate name → values, aligned to the owning stratum's index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CovariateSet {
    names: Vec<String>,
    columns: Vec<Vec<f64>>,
}

impl CovariateSet {
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.columns[i].as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[f64])> {
        self.names
            .iter()
            .zip(self.columns.iter())
            .map(|(n, c)| (n.as_str(), c.as_slice()))
    }
}

/// One population subgroup. Immutable after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Stratum {
    name: String,
    index: TimeIndex,
    outcome: Vec<f64>,
    denominator: Option<Vec<f64>>,
    covariates: CovariateSet,
}

impl Stratum {
    /// Build a stratum from independently supplied series.
    ///
    /// Rejects misaligned indices, duplicate covariate names, non-monotonic or
    /// gapped timestamps, and outcome values that are not non-negative finite
    /// counts. Missing values are not imputed.
    pub fn from_series(
        name: impl Into<String>,
        periodicity: Periodicity,
        outcome: TimeIndexedSeries,
        denominator: Option<TimeIndexedSeries>,
        covariates: Vec<TimeIndexedSeries>,
    ) -> Result<Self, AppError> {
        let name = name.into();
        check_lengths(&name, &outcome)?;
        let index = TimeIndex::new(outcome.dates.clone(), periodicity)
            .map_err(|e| AppError::malformed(format!("stratum '{name}': {e}")))?;

        for (i, &v) in outcome.values.iter().enumerate() {
            if !(v.is_finite() && v >= 0.0) {
                return Err(AppError::malformed(format!(
                    "stratum '{name}': outcome '{}' has invalid count {v} at {}",
                    outcome.name,
                    index.dates()[i]
                )));
            }
        }

        let denominator = match denominator {
            Some(series) => {
                check_aligned(&name, &index, &series)?;
                if series.values.iter().any(|v| !(v.is_finite() && *v > 0.0)) {
                    return Err(AppError::malformed(format!(
                        "stratum '{name}': denominator '{}' must be positive",
                        series.name
                    )));
                }
                Some(series.values)
            }
            None => None,
        };

        let mut seen = HashSet::new();
        let mut set = CovariateSet::default();
        for series in covariates {
            if !seen.insert(series.name.clone()) {
                return Err(AppError::malformed(format!(
                    "stratum '{name}': duplicate covariate name '{}'",
                    series.name
                )));
            }
            check_aligned(&name, &index, &series)?;
            set.names.push(series.name);
            set.columns.push(series.values);
        }

        Ok(Self {
            name,
            index,
            outcome: outcome.values,
            denominator,
            covariates: set,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> &TimeIndex {
        &self.index
    }

    pub fn dates(&self) -> &[NaiveDate] {
        self.index.dates()
    }

    pub fn outcome(&self) -> &[f64] {
        &self.outcome
    }

    pub fn denominator(&self) -> Option<&[f64]> {
        self.denominator.as_deref()
    }

    pub fn covariates(&self) -> &CovariateSet {
        &self.covariates
    }

    pub fn len(&self) -> usize {
        self.outcome.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcome.is_empty()
    }

    /// `log(denominator)` when available, otherwise zeros.
    pub fn log_offset(&self) -> Vec<f64> {
        match &self.denominator {
            Some(d) => d.iter().map(|v| v.ln()).collect(),
            None => vec![0.0; self.len()],
        }
    }
}

fn check_lengths(stratum: &str, series: &TimeIndexedSeries) -> Result<(), AppError> {
    if series.dates.len() != series.values.len() {
        return Err(AppError::malformed(format!(
            "stratum '{stratum}': series '{}' has {} timestamps but {} values",
            series.name,
            series.dates.len(),
            series.values.len()
        )));
    }
    Ok(())
}

fn check_aligned(stratum: &str, index: &TimeIndex, series: &TimeIndexedSeries) -> Result<(), AppError> {
    check_lengths(stratum, series)?;
    if series.dates != index.dates() {
        return Err(AppError::malformed(format!(
            "stratum '{stratum}': series '{}' is not aligned with the outcome time index",
            series.name
        )));
    }
    Ok(())
}

/// All strata of a run, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct SeriesRegistry {
    strata: BTreeMap<String, Stratum>,
}

impl SeriesRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, stratum: Stratum) -> Result<(), AppError> {
        if self.strata.contains_key(stratum.name()) {
            return Err(AppError::malformed(format!(
                "duplicate stratum '{}'",
                stratum.name()
            )));
        }
        self.strata.insert(stratum.name().to_string(), stratum);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Stratum> {
        self.strata.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Stratum> {
        self.strata.values()
    }

    pub fn len(&self) -> usize {
        self.strata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strata.is_empty()
    }

    /// Check every stratum against the run's boundaries before any fit starts.
    pub fn validate_boundaries(&self, boundaries: &PeriodBoundaries) -> Result<(), AppError> {
        if self.strata.is_empty() {
            return Err(AppError::malformed("no strata to analyze"));
        }
        for stratum in self.strata.values() {
            let last = stratum.index().last();
            let end = boundaries.eval_end.unwrap_or(last);
            if end > last {
                return Err(AppError::malformed(format!(
                    "stratum '{}': evaluation end {end} is after the last observation {last}",
                    stratum.name()
                )));
            }
            if boundaries.intervention <= stratum.index().first() {
                return Err(AppError::malformed(format!(
                    "stratum '{}': no observations before the intervention date {}",
                    stratum.name(),
                    boundaries.intervention
                )));
            }
        }
        Ok(())
    }
}
