//! Design matrices for every count-regression variant.
//!
//! All variants share the same primitive operations:
//! - validate and transform a raw covariate (`prepare_covariate`)
//! - lay out intercept, seasonal indicators, trend, intervention terms and
//!   covariates as columns (`build_design`)
//!
//! Rows always cover the full time range; fitting code slices the rows it needs.

use std::ops::Range;

use chrono::{Datelike, NaiveDate};
use nalgebra::DMatrix;

use crate::domain::Periodicity;
use crate::error::AppError;
use crate::math::stats::{mean, std_dev};

/// Standard deviations below this (over the fitting window) mark a covariate constant.
const MIN_COVARIATE_SD: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Intercept,
    Season,
    Trend,
    PostLevel,
    PostSlope,
    Covariate,
}

#[derive(Debug, Clone)]
pub struct Design {
    pub matrix: DMatrix<f64>,
    pub names: Vec<String>,
    pub kinds: Vec<ColumnKind>,
}

impl Design {
    pub fn n_cols(&self) -> usize {
        self.names.len()
    }

    /// Copy of the rows in `range`.
    pub fn rows(&self, range: Range<usize>) -> DMatrix<f64> {
        self.matrix.rows(range.start, range.len()).clone_owned()
    }

    pub fn columns_of(&self, kind: ColumnKind) -> Vec<usize> {
        self.kinds
            .iter()
            .enumerate()
            .filter_map(|(j, k)| (*k == kind).then_some(j))
            .collect()
    }

    /// The design with the intervention terms set to zero.
    pub fn without_intervention(&self) -> DMatrix<f64> {
        let mut m = self.matrix.clone();
        for (j, kind) in self.kinds.iter().enumerate() {
            if matches!(kind, ColumnKind::PostLevel | ColumnKind::PostSlope) {
                m.column_mut(j).fill(0.0);
            }
        }
        m
    }
}

/// A validated covariate, standardized on the fitting window.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedCovariate {
    pub name: String,
    pub values: Vec<f64>,
}

/// Segmented-regression terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterventionTerms {
    pub post_start: usize,
    pub level_change: bool,
}

#[derive(Debug, Clone)]
pub struct DesignSpec<'a> {
    pub n: usize,
    pub season_count: usize,
    /// Season of row 0.
    pub season_phase: usize,
    pub steps_per_year: usize,
    /// Linear trend in years, centred at `trend_center` (a row position).
    pub trend: bool,
    pub trend_center: f64,
    pub intervention: Option<InterventionTerms>,
    pub covariates: &'a [PreparedCovariate],
}

/// Season of the first observation when the season count matches the calendar.
///
/// For any other season count the seasons are counted from the first row.
pub fn season_phase(first: NaiveDate, periodicity: Periodicity, season_count: usize) -> usize {
    if season_count == periodicity.steps_per_year() {
        (first.month0() / periodicity.months_per_step()) as usize
    } else {
        0
    }
}

pub fn build_design(spec: &DesignSpec<'_>) -> Design {
    let n = spec.n;
    let mut names = vec!["(intercept)".to_string()];
    let mut kinds = vec![ColumnKind::Intercept];
    let mut columns: Vec<Vec<f64>> = vec![vec![1.0; n]];

    if spec.season_count >= 2 {
        for s in 1..spec.season_count {
            names.push(format!("season_{}", s + 1));
            kinds.push(ColumnKind::Season);
            columns.push(
                (0..n)
                    .map(|i| f64::from(u8::from((spec.season_phase + i) % spec.season_count == s)))
                    .collect(),
            );
        }
    }

    let per_year = spec.steps_per_year.max(1) as f64;
    if spec.trend {
        names.push("trend".to_string());
        kinds.push(ColumnKind::Trend);
        columns.push((0..n).map(|i| (i as f64 - spec.trend_center) / per_year).collect());
    }

    if let Some(terms) = spec.intervention {
        if terms.level_change {
            names.push("post_level".to_string());
            kinds.push(ColumnKind::PostLevel);
            columns.push((0..n).map(|i| f64::from(u8::from(i >= terms.post_start))).collect());
        }
        names.push("post_slope".to_string());
        kinds.push(ColumnKind::PostSlope);
        columns.push(
            (0..n)
                .map(|i| {
                    if i >= terms.post_start {
                        (i - terms.post_start) as f64 / per_year
                    } else {
                        0.0
                    }
                })
                .collect(),
        );
    }

    for cov in spec.covariates {
        names.push(cov.name.clone());
        kinds.push(ColumnKind::Covariate);
        columns.push(cov.values.clone());
    }

    let matrix = DMatrix::from_fn(n, columns.len(), |i, j| columns[j][i]);
    Design {
        matrix,
        names,
        kinds,
    }
}

/// Apply the configured log transform, rejecting values it cannot handle.
pub fn transform_covariate(
    name: &str,
    raw: &[f64],
    log: bool,
    offset: f64,
) -> Result<Vec<f64>, AppError> {
    if raw.iter().any(|v| !v.is_finite()) {
        return Err(AppError::degenerate(name, "contains non-finite values"));
    }
    if raw.iter().all(|v| *v == 0.0) {
        return Err(AppError::degenerate(name, "all values are zero"));
    }
    if !log {
        return Ok(raw.to_vec());
    }
    if raw.iter().any(|v| v + offset <= 0.0) {
        return Err(AppError::degenerate(
            name,
            "non-positive value under the log transform",
        ));
    }
    Ok(raw.iter().map(|v| (v + offset).ln()).collect())
}

/// Transform and standardize a covariate using statistics of `reference` rows.
pub fn prepare_covariate(
    name: &str,
    raw: &[f64],
    log: bool,
    offset: f64,
    reference: Range<usize>,
) -> Result<PreparedCovariate, AppError> {
    let transformed = transform_covariate(name, raw, log, offset)?;
    standardize(name, &transformed, reference)
}

/// Centre and scale already-transformed values on the `reference` rows.
pub fn standardize(
    name: &str,
    values: &[f64],
    reference: Range<usize>,
) -> Result<PreparedCovariate, AppError> {
    let window = &values[reference];
    if window.iter().all(|v| *v == 0.0) {
        return Err(AppError::degenerate(name, "all zero over the fitting window"));
    }
    let m = mean(window);
    let sd = std_dev(window);
    if !(sd.is_finite() && sd > MIN_COVARIATE_SD) {
        return Err(AppError::degenerate(name, "constant over the fitting window"));
    }
    Ok(PreparedCovariate {
        name: name.to_string(),
        values: values.iter().map(|v| (v - m) / sd).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seasonal_indicators_follow_phase() {
        let spec = DesignSpec {
            n: 24,
            season_count: 12,
            season_phase: 3,
            steps_per_year: 12,
            trend: true,
            trend_center: 0.0,
            intervention: None,
            covariates: &[],
        };
        let d = build_design(&spec);
        assert_eq!(d.n_cols(), 1 + 11 + 1);
        // Row 0 is season index 3 -> column "season_4".
        let col = d.names.iter().position(|n| n == "season_4").unwrap();
        assert_eq!(d.matrix[(0, col)], 1.0);
        assert_eq!(d.matrix[(12, col)], 1.0);
        // Season index 0 is the baseline: row 9 has no active indicator.
        let active: f64 = d.columns_of(ColumnKind::Season).iter().map(|&j| d.matrix[(9, j)]).sum();
        assert_eq!(active, 0.0);
        let trend = d.columns_of(ColumnKind::Trend)[0];
        assert!((d.matrix[(12, trend)] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn intervention_terms_and_counterfactual() {
        let spec = DesignSpec {
            n: 10,
            season_count: 1,
            season_phase: 0,
            steps_per_year: 1,
            trend: true,
            trend_center: 0.0,
            intervention: Some(InterventionTerms {
                post_start: 6,
                level_change: true,
            }),
            covariates: &[],
        };
        let d = build_design(&spec);
        let level = d.columns_of(ColumnKind::PostLevel)[0];
        let slope = d.columns_of(ColumnKind::PostSlope)[0];
        assert_eq!(d.matrix[(5, level)], 0.0);
        assert_eq!(d.matrix[(6, level)], 1.0);
        assert_eq!(d.matrix[(9, slope)], 3.0);
        let cf = d.without_intervention();
        assert_eq!(cf[(9, slope)], 0.0);
        assert_eq!(cf[(9, level)], 0.0);
    }

    #[test]
    fn degenerate_covariates_are_rejected() {
        let zeros = vec![0.0; 12];
        assert!(prepare_covariate("z", &zeros, true, 0.5, 0..12).is_err());
        let constant = vec![4.0; 12];
        let err = prepare_covariate("c", &constant, true, 0.5, 0..12).unwrap_err();
        assert!(err.to_string().contains("constant"));
        let negative = vec![-2.0, 1.0, 3.0];
        assert!(prepare_covariate("n", &negative, true, 0.5, 0..3).is_err());
    }

    #[test]
    fn standardization_uses_reference_rows() {
        let raw = vec![1.0, 3.0, 100.0];
        let c = prepare_covariate("x", &raw, false, 0.0, 0..2).unwrap();
        assert!((c.values[0] + 0.7071067811865475).abs() < 1e-12);
        assert!((c.values[1] - 0.7071067811865475).abs() < 1e-12);
    }

    #[test]
    fn quarterly_phase_from_month() {
        let d = NaiveDate::from_ymd_opt(2004, 7, 1).unwrap();
        assert_eq!(season_phase(d, Periodicity::Quarterly, 4), 2);
        assert_eq!(season_phase(d, Periodicity::Monthly, 12), 6);
        assert_eq!(season_phase(d, Periodicity::Monthly, 4), 0);
    }
}
