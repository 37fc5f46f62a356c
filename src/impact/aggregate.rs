//! Draw-level aggregation of counterfactuals against observed counts.
//!
//! When the counterfactual carries simulated draws, every sum is taken per draw
//! and only then summarized. Without draws, interval bounds are summed instead.

use chrono::{Datelike, NaiveDate};
use serde::Serialize;

use crate::domain::{DatedEstimate, IntervalEstimate};
use crate::error::AppError;
use crate::fit::variants::Counterfactual;
use crate::math::stats::{count_ratio, summarize};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnnualAggregate {
    /// Year label: the calendar year in which the aggregation year starts.
    pub year: i32,
    pub start: NaiveDate,
    pub periods: usize,
    pub observed: f64,
    pub counterfactual: IntervalEstimate,
    pub rate_ratio: IntervalEstimate,
}

/// Running sums of `counterfactual − observed` from a start index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CumulativePrevented {
    pub start_date: NaiveDate,
    pub estimates: Vec<DatedEstimate>,
    #[serde(skip)]
    pub paths: Option<Vec<Vec<f64>>>,
    #[serde(skip)]
    first_observed: NaiveDate,
    #[serde(skip)]
    last_observed: NaiveDate,
}

impl CumulativePrevented {
    pub fn compute(
        counterfactual: &Counterfactual,
        observed: &[f64],
        start: usize,
        lower_p: f64,
        upper_p: f64,
    ) -> Result<Self, AppError> {
        let dates = &counterfactual.dates;
        let (Some(&first), Some(&last)) = (dates.first(), dates.last()) else {
            return Err(AppError::InvalidAggregation("empty counterfactual".to_string()));
        };
        if observed.len() != dates.len() {
            return Err(AppError::InvalidAggregation(
                "observed and counterfactual lengths differ".to_string(),
            ));
        }
        let start = start.min(dates.len());
        let start_date = dates.get(start).copied().unwrap_or(last);

        let (estimates, paths) = match &counterfactual.draws {
            Some(draws) => {
                let paths: Vec<Vec<f64>> = draws
                    .iter()
                    .map(|draw| running_sum((start..dates.len()).map(|t| draw[t] - observed[t])))
                    .collect();
                let estimates = (0..dates.len() - start)
                    .map(|k| {
                        let column: Vec<f64> = paths.iter().map(|p| p[k]).collect();
                        DatedEstimate {
                            date: dates[start + k],
                            estimate: summarize(&column, lower_p, upper_p),
                        }
                    })
                    .collect();
                (estimates, Some(paths))
            }
            None => {
                let sum_of = |series: &[f64]| {
                    running_sum((start..dates.len()).map(|t| series[t] - observed[t]))
                };
                let (m, lo, hi) = (
                    sum_of(&counterfactual.median),
                    sum_of(&counterfactual.lower),
                    sum_of(&counterfactual.upper),
                );
                let estimates = (0..dates.len() - start)
                    .map(|k| DatedEstimate {
                        date: dates[start + k],
                        estimate: IntervalEstimate::new(m[k], lo[k], hi[k]),
                    })
                    .collect();
                (estimates, None)
            }
        };

        Ok(Self {
            start_date,
            estimates,
            paths,
            first_observed: first,
            last_observed: last,
        })
    }

    /// Cumulative prevented cases up to and including `end`.
    ///
    /// Ends before the start give zero with a zero-width interval; ends outside
    /// the observed range are rejected.
    pub fn at(&self, end: NaiveDate) -> Result<IntervalEstimate, AppError> {
        if end < self.first_observed || end > self.last_observed {
            return Err(AppError::InvalidAggregation(format!(
                "end point {end} is outside the observed range {}..={}",
                self.first_observed, self.last_observed
            )));
        }
        let k = self.estimates.partition_point(|e| e.date <= end);
        match k.checked_sub(1) {
            Some(i) => Ok(self.estimates[i].estimate),
            None => Ok(IntervalEstimate::zero()),
        }
    }
}

fn running_sum(terms: impl Iterator<Item = f64>) -> Vec<f64> {
    let mut acc = 0.0;
    terms
        .map(|v| {
            acc += v;
            acc
        })
        .collect()
}

/// Per-time-point `observed / counterfactual`.
///
/// The ratio is decreasing in the counterfactual, so its upper quantile maps to
/// the lower bound and vice versa.
pub fn period_rate_ratios(counterfactual: &Counterfactual, observed: &[f64]) -> Vec<DatedEstimate> {
    counterfactual
        .dates
        .iter()
        .enumerate()
        .map(|(t, &date)| DatedEstimate {
            date,
            estimate: IntervalEstimate::new(
                count_ratio(observed[t], counterfactual.median[t]),
                count_ratio(observed[t], counterfactual.upper[t]),
                count_ratio(observed[t], counterfactual.lower[t]),
            ),
        })
        .collect()
}

/// Summed counterfactual and rate ratio over the index set `rows`.
fn window_totals(
    counterfactual: &Counterfactual,
    observed: &[f64],
    rows: &[usize],
    lower_p: f64,
    upper_p: f64,
) -> (f64, IntervalEstimate, IntervalEstimate) {
    let obs: f64 = rows.iter().map(|&t| observed[t]).sum();
    match &counterfactual.draws {
        Some(draws) => {
            let sums: Vec<f64> = draws
                .iter()
                .map(|d| rows.iter().map(|&t| d[t]).sum::<f64>())
                .collect();
            let ratios: Vec<f64> = sums.iter().map(|&s| count_ratio(obs, s)).collect();
            (
                obs,
                summarize(&sums, lower_p, upper_p),
                summarize(&ratios, lower_p, upper_p),
            )
        }
        None => {
            let total = |series: &[f64]| rows.iter().map(|&t| series[t]).sum::<f64>();
            let (m, lo, hi) = (
                total(&counterfactual.median),
                total(&counterfactual.lower),
                total(&counterfactual.upper),
            );
            (
                obs,
                IntervalEstimate::new(m, lo, hi),
                IntervalEstimate::new(count_ratio(obs, m), count_ratio(obs, hi), count_ratio(obs, lo)),
            )
        }
    }
}

/// Rate ratio of the summed counts over `range`.
pub fn rate_ratio_over(
    counterfactual: &Counterfactual,
    observed: &[f64],
    range: std::ops::Range<usize>,
    lower_p: f64,
    upper_p: f64,
) -> IntervalEstimate {
    let rows: Vec<usize> = range.collect();
    window_totals(counterfactual, observed, &rows, lower_p, upper_p).2
}

/// Label of the aggregation year containing `date`.
pub fn aggregation_year(date: NaiveDate, year_start_month: u32) -> i32 {
    if date.month() >= year_start_month {
        date.year()
    } else {
        date.year() - 1
    }
}

pub fn annual_aggregates(
    counterfactual: &Counterfactual,
    observed: &[f64],
    year_start_month: u32,
    lower_p: f64,
    upper_p: f64,
) -> Vec<AnnualAggregate> {
    let mut groups: Vec<(i32, NaiveDate, Vec<usize>)> = Vec::new();
    for (t, &date) in counterfactual.dates.iter().enumerate() {
        let year = aggregation_year(date, year_start_month);
        match groups.last_mut() {
            Some((y, _, rows)) if *y == year => rows.push(t),
            _ => groups.push((year, date, vec![t])),
        }
    }

    groups
        .into_iter()
        .map(|(year, start, rows)| {
            let (observed, cf, rr) = window_totals(counterfactual, observed, &rows, lower_p, upper_p);
            AnnualAggregate {
                year,
                start,
                periods: rows.len(),
                observed,
                counterfactual: cf,
                rate_ratio: rr,
            }
        })
        .collect()
}
