//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable so they can be:
//!
//! - passed as an immutable context to every fit
//! - exported to JSON alongside the results
//! - reconstructed in tests without touching the CLI layer

use std::time::Duration;

use chrono::{Months, NaiveDate};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Sampling step of every series in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Periodicity {
    Monthly,
    Quarterly,
}

impl Periodicity {
    /// Calendar months between two consecutive observations.
    pub fn months_per_step(self) -> u32 {
        match self {
            Periodicity::Monthly => 1,
            Periodicity::Quarterly => 3,
        }
    }

    /// The timestamp one step after `date`.
    pub fn next(self, date: NaiveDate) -> Option<NaiveDate> {
        date.checked_add_months(Months::new(self.months_per_step()))
    }

    /// Observations per calendar year.
    pub fn steps_per_year(self) -> usize {
        (12 / self.months_per_step()) as usize
    }
}

/// Error distribution for the count outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Poisson,
    /// Negative binomial with an explicit size (overdispersion) parameter.
    #[value(name = "negbin")]
    #[serde(rename = "negbin")]
    NegativeBinomial,
}

/// Counterfactual model variants.
///
/// The order of the variants is the order used in reports.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ModelVariant {
    /// All usable control covariates.
    Full,
    /// Spike-and-slab selected covariates.
    Best,
    /// STL+PCA synthetic controls.
    Pca,
    /// Seasonal terms plus a time trend, no covariates.
    Time,
    /// Classical segmented regression (interrupted time series).
    Its,
}

impl ModelVariant {
    pub const ALL: [ModelVariant; 5] = [
        ModelVariant::Full,
        ModelVariant::Best,
        ModelVariant::Pca,
        ModelVariant::Time,
        ModelVariant::Its,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ModelVariant::Full => "full",
            ModelVariant::Best => "best",
            ModelVariant::Pca => "pca",
            ModelVariant::Time => "time",
            ModelVariant::Its => "its",
        }
    }
}

impl std::fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Seasonal smoothing window for STL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeasonalWindow {
    /// Seasonal component is the mean of each cycle-subseries.
    Periodic,
    /// Odd loess span (in periods) for the cycle-subseries smoother.
    Span(usize),
}

/// How many principal components to keep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PcaRetention {
    /// Always keep the leading `k` components (bounded by the number available).
    Fixed(usize),
    /// Keep the smallest number of leading components whose cumulative explained
    /// variance reaches `threshold`, capped at `max_components`.
    VarianceExplained { threshold: f64, max_components: usize },
}

/// Intervention and evaluation boundaries shared by all strata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodBoundaries {
    pub intervention: NaiveDate,
    pub eval_start: NaiveDate,
    /// `None` means "through the last observation".
    pub eval_end: Option<NaiveDate>,
}

impl PeriodBoundaries {
    /// Check `intervention <= eval_start <= eval_end`.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.eval_start < self.intervention {
            return Err(AppError::config(format!(
                "evaluation start {} precedes intervention date {}",
                self.eval_start, self.intervention
            )));
        }
        if let Some(end) = self.eval_end {
            if end < self.eval_start {
                return Err(AppError::config(format!(
                    "evaluation end {end} precedes evaluation start {}",
                    self.eval_start
                )));
            }
        }
        Ok(())
    }
}

/// Settings of the Markov-chain sampler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerConfig {
    pub burn_in: usize,
    /// Retained draws per chain.
    pub draws: usize,
    pub chains: usize,
    pub seed: u64,
    /// Wall-clock budget for a single (stratum, variant) fit.
    pub timeout: Option<Duration>,
    /// Split-R̂ above this value flags the fit as unreliable.
    pub rhat_threshold: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            burn_in: 2_000,
            draws: 2_000,
            chains: 2,
            seed: 42,
            timeout: None,
            rhat_threshold: 1.1,
        }
    }
}

/// Prior settings for coefficients on standardized covariates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionPriors {
    /// Prior sd of an included covariate (also the prior of every "full" covariate).
    pub slab_sd: f64,
    /// Prior sd of an excluded covariate in the spike-and-slab mixture.
    pub spike_sd: f64,
    /// Prior inclusion probability.
    pub inclusion_prob: f64,
    /// Prior sd of intercept, seasonal and trend terms.
    pub baseline_sd: f64,
}

impl Default for SelectionPriors {
    fn default() -> Self {
        Self {
            slab_sd: 1.0,
            spike_sd: 0.02,
            inclusion_prob: 0.5,
            baseline_sd: 5.0,
        }
    }
}

/// STL+PCA reduction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcaConfig {
    pub seasonal_window: SeasonalWindow,
    /// Bisquare robustness iterations of STL (0 disables).
    pub robust_iterations: usize,
    pub retention: PcaRetention,
}

impl Default for PcaConfig {
    fn default() -> Self {
        Self {
            seasonal_window: SeasonalWindow::Periodic,
            robust_iterations: 0,
            retention: PcaRetention::VarianceExplained {
                threshold: 0.9,
                max_components: 3,
            },
        }
    }
}

/// A full run's configuration as understood by the engine.
///
/// Passed by reference to every component; never mutated during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub group_field: String,
    pub time_field: String,
    pub outcome_field: String,
    pub denominator_field: Option<String>,
    /// Empty means "every remaining numeric column".
    pub covariate_fields: Vec<String>,

    pub periodicity: Periodicity,
    pub season_count: usize,
    pub log_covariates: bool,
    /// Added before taking logarithms of covariates (guards `ln(0)`).
    pub log_offset: f64,
    pub family: Family,

    pub boundaries: PeriodBoundaries,
    pub sampler: SamplerConfig,
    pub priors: SelectionPriors,
    pub pca: PcaConfig,

    /// Variants to fit for every stratum.
    pub variants: Vec<ModelVariant>,
    /// Ordered preference used to pick each stratum's headline result.
    pub fallback_order: Vec<ModelVariant>,
    /// Include a level change at the intervention in the ITS model.
    pub its_level_change: bool,

    /// First month (1-12) of the aggregation year; 1 is the calendar year.
    pub year_start_month: u32,
    /// Start of the cumulative prevented-cases sum (defaults to the intervention).
    pub prevented_start: Option<NaiveDate>,
    /// Central probability mass of every reported interval.
    pub interval_level: f64,
}

impl AnalysisConfig {
    /// A configuration with the default numerical settings.
    pub fn new(outcome_field: impl Into<String>, boundaries: PeriodBoundaries) -> Self {
        Self {
            group_field: "age_group".to_string(),
            time_field: "date".to_string(),
            outcome_field: outcome_field.into(),
            denominator_field: None,
            covariate_fields: Vec::new(),
            periodicity: Periodicity::Monthly,
            season_count: 12,
            log_covariates: true,
            log_offset: 0.5,
            family: Family::NegativeBinomial,
            boundaries,
            sampler: SamplerConfig::default(),
            priors: SelectionPriors::default(),
            pca: PcaConfig::default(),
            variants: ModelVariant::ALL.to_vec(),
            fallback_order: vec![ModelVariant::Full, ModelVariant::Pca, ModelVariant::Time],
            its_level_change: true,
            year_start_month: 1,
            prevented_start: None,
            interval_level: 0.95,
        }
    }

    /// Validate process-wide settings. Failure is fatal to the whole run.
    pub fn validate(&self) -> Result<(), AppError> {
        self.boundaries.validate()?;

        if self.season_count == 0 {
            return Err(AppError::config("season count must be >= 1"));
        }
        if !(self.log_offset.is_finite() && self.log_offset >= 0.0) {
            return Err(AppError::config("log offset must be finite and >= 0"));
        }
        if self.sampler.draws < 10 {
            return Err(AppError::config("sampler draws must be >= 10"));
        }
        if self.sampler.chains == 0 {
            return Err(AppError::config("sampler chains must be >= 1"));
        }
        if !(self.sampler.rhat_threshold.is_finite() && self.sampler.rhat_threshold > 1.0) {
            return Err(AppError::config("R-hat threshold must be > 1"));
        }

        let p = &self.priors;
        if !(p.slab_sd.is_finite() && p.spike_sd.is_finite() && p.baseline_sd.is_finite()) {
            return Err(AppError::config("prior scales must be finite"));
        }
        if !(p.spike_sd > 0.0 && p.slab_sd > p.spike_sd && p.baseline_sd > 0.0) {
            return Err(AppError::config("prior scales must satisfy 0 < spike_sd < slab_sd"));
        }
        if !(p.inclusion_prob > 0.0 && p.inclusion_prob < 1.0) {
            return Err(AppError::config("prior inclusion probability must lie in (0, 1)"));
        }

        match self.pca.retention {
            PcaRetention::Fixed(0) => {
                return Err(AppError::config("PCA must retain at least one component"));
            }
            PcaRetention::VarianceExplained {
                threshold,
                max_components,
            } => {
                if !(threshold > 0.0 && threshold <= 1.0) || max_components == 0 {
                    return Err(AppError::config(
                        "PCA variance threshold must be in (0, 1] with at least one component",
                    ));
                }
            }
            PcaRetention::Fixed(_) => {}
        }
        if let SeasonalWindow::Span(span) = self.pca.seasonal_window {
            if span < 3 || span % 2 == 0 {
                return Err(AppError::config("STL seasonal span must be odd and >= 3"));
            }
        }

        if self.variants.is_empty() {
            return Err(AppError::config("at least one model variant must be enabled"));
        }
        if self.fallback_order.is_empty() {
            return Err(AppError::config("fallback order must name at least one variant"));
        }
        if !(1..=12).contains(&self.year_start_month) {
            return Err(AppError::config("year start month must be in 1..=12"));
        }
        if !(self.interval_level > 0.0 && self.interval_level < 1.0) {
            return Err(AppError::config("interval level must lie in (0, 1)"));
        }
        if let Some(start) = self.prevented_start {
            if start < self.boundaries.intervention {
                return Err(AppError::config(
                    "cumulative prevented start precedes the intervention date",
                ));
            }
        }
        Ok(())
    }

    /// Lower and upper quantile probabilities for the configured interval level.
    pub fn interval_probs(&self) -> (f64, f64) {
        let tail = (1.0 - self.interval_level) / 2.0;
        (tail, 1.0 - tail)
    }

    pub fn variant_enabled(&self, variant: ModelVariant) -> bool {
        self.variants.contains(&variant)
    }
}

/// A candidate covariate left out of a fit, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludedCovariate {
    pub name: String,
    pub reason: String,
}

impl ExcludedCovariate {
    /// Build from a `DegenerateCovariate` error, or any error under `name`.
    pub fn from_error(name: &str, err: &AppError) -> Self {
        match err {
            AppError::DegenerateCovariate { name, reason } => Self {
                name: name.clone(),
                reason: reason.clone(),
            },
            other => Self {
                name: name.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

/// Point estimate with an interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntervalEstimate {
    pub median: f64,
    pub lower: f64,
    pub upper: f64,
}

impl IntervalEstimate {
    pub fn new(median: f64, lower: f64, upper: f64) -> Self {
        Self {
            median,
            lower,
            upper,
        }
    }

    /// Zero with a zero-width interval.
    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }
}

/// An interval estimate attached to a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DatedEstimate {
    pub date: NaiveDate,
    #[serde(flatten)]
    pub estimate: IntervalEstimate,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, 1).unwrap()
    }

    fn boundaries() -> PeriodBoundaries {
        PeriodBoundaries {
            intervention: date(2010, 1),
            eval_start: date(2011, 1),
            eval_end: Some(date(2012, 12)),
        }
    }

    #[test]
    fn default_config_is_valid() {
        AnalysisConfig::new("deaths", boundaries()).validate().unwrap();
    }

    #[test]
    fn rejects_eval_start_before_intervention() {
        let mut b = boundaries();
        b.eval_start = date(2009, 6);
        let err = AnalysisConfig::new("deaths", b).validate().unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn rejects_inverted_priors() {
        let mut config = AnalysisConfig::new("deaths", boundaries());
        config.priors.spike_sd = 2.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn quarterly_steps_three_months() {
        let next = Periodicity::Quarterly.next(date(2010, 11)).unwrap();
        assert_eq!(next, date(2011, 2));
        assert_eq!(Periodicity::Quarterly.steps_per_year(), 4);
    }

    #[test]
    fn interval_probs_are_symmetric() {
        let config = AnalysisConfig::new("deaths", boundaries());
        let (lo, hi) = config.interval_probs();
        assert!((lo - 0.025).abs() < 1e-12);
        assert!((hi - 0.975).abs() < 1e-12);
    }
}
