//! Impact summaries derived from a fitted counterfactual.
//!
//! An `ImpactSummary` is never stored independently: it is recomputed from a
//! `FittedModel` and the observed series whenever it is needed.

pub mod aggregate;

use chrono::NaiveDate;
use serde::Serialize;

use crate::data::windows::AnalysisWindows;
use crate::domain::{AnalysisConfig, DatedEstimate, IntervalEstimate, ModelVariant};
use crate::error::AppError;
use crate::fit::variants::FittedModel;

pub use aggregate::{
    AnnualAggregate, CumulativePrevented, aggregation_year, annual_aggregates, period_rate_ratios,
    rate_ratio_over,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImpactSummary {
    pub stratum: String,
    pub variant: ModelVariant,
    /// Observed / counterfactual at every time point.
    pub rate_ratios: Vec<DatedEstimate>,
    /// Rate ratio of the evaluation window totals.
    pub eval_rate_ratio: IntervalEstimate,
    pub annual: Vec<AnnualAggregate>,
    pub cumulative_prevented: CumulativePrevented,
    /// Cumulative prevented cases at the end of the evaluation window.
    pub prevented_total: IntervalEstimate,
}

impl ImpactSummary {
    /// Cumulative prevented cases at an arbitrary end point.
    pub fn prevented_at(&self, end: NaiveDate) -> Result<IntervalEstimate, AppError> {
        self.cumulative_prevented.at(end)
    }
}

pub fn summarize_impact(
    model: &FittedModel,
    observed: &[f64],
    windows: &AnalysisWindows,
    config: &AnalysisConfig,
) -> Result<ImpactSummary, AppError> {
    let cf = &model.counterfactual;
    if cf.len() != observed.len() || cf.len() != windows.len {
        return Err(AppError::InvalidAggregation(format!(
            "counterfactual covers {} periods but {} were observed",
            cf.len(),
            observed.len()
        )));
    }
    let (lower_p, upper_p) = config.interval_probs();

    let cumulative_prevented =
        CumulativePrevented::compute(cf, observed, windows.prevented_start, lower_p, upper_p)?;
    let prevented_total = cumulative_prevented.at(cf.dates[windows.eval_end])?;

    Ok(ImpactSummary {
        stratum: model.stratum.clone(),
        variant: model.variant,
        rate_ratios: period_rate_ratios(cf, observed),
        eval_rate_ratio: rate_ratio_over(cf, observed, windows.eval(), lower_p, upper_p),
        annual: annual_aggregates(cf, observed, config.year_start_month, lower_p, upper_p),
        cumulative_prevented,
        prevented_total,
    })
}
