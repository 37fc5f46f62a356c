//! Synthetic stratum generation for demonstrations and tests.
//!
//! Every stratum shares one latent seasonal log-rate process. Control
//! covariates load on that process with decreasing weight (the first control
//! tracks it exactly, the last ones are pure noise) and the outcome is a Poisson
//! draw from the same process, multiplied by `effect` from the intervention on.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::{Normal, Poisson};

use crate::data::registry::{SeriesRegistry, Stratum, TimeIndexedSeries};
use crate::domain::{AnalysisConfig, PeriodBoundaries, Periodicity};
use crate::error::AppError;
use crate::fit::sampler::derive_seed;

/// Name of the all-zero control added by `SyntheticSpec::degenerate_control`.
pub const ZERO_CONTROL: &str = "zero_control";

#[derive(Debug, Clone)]
pub struct SyntheticSpec {
    pub strata: Vec<String>,
    pub start: NaiveDate,
    pub periodicity: Periodicity,
    pub pre_periods: usize,
    pub post_periods: usize,
    /// Evaluation starts this many periods after the intervention.
    pub eval_delay: usize,
    /// Mean outcome count per period before the intervention.
    pub baseline: f64,
    /// Multiplicative change of the outcome rate from the intervention on.
    pub effect: f64,
    /// Amplitude of the seasonal wave on the log scale.
    pub seasonal_amplitude: f64,
    /// Number of control covariates.
    pub controls: usize,
    /// Mean count of the control series (larger means less sampling noise).
    pub control_scale: f64,
    /// Add an all-zero control named [`ZERO_CONTROL`].
    pub degenerate_control: bool,
    /// Population denominator per stratum; `None` omits the column.
    pub population: Option<f64>,
    pub seed: u64,
}

impl Default for SyntheticSpec {
    fn default() -> Self {
        Self {
            strata: vec!["under_5".to_string(), "over_65".to_string()],
            start: NaiveDate::from_ymd_opt(2003, 1, 1).unwrap_or(NaiveDate::MIN),
            periodicity: Periodicity::Monthly,
            pre_periods: 60,
            post_periods: 24,
            eval_delay: 0,
            baseline: 60.0,
            effect: 0.5,
            seasonal_amplitude: 0.35,
            controls: 3,
            control_scale: 400.0,
            degenerate_control: false,
            population: None,
            seed: 7,
        }
    }
}

impl SyntheticSpec {
    pub fn len(&self) -> usize {
        self.pre_periods + self.post_periods
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn control_names(&self) -> Vec<String> {
        let mut names: Vec<String> = (1..=self.controls).map(|k| format!("control_{k}")).collect();
        if self.degenerate_control {
            names.push(ZERO_CONTROL.to_string());
        }
        names
    }

    /// Weight of the shared latent process in control `k` (zero-based).
    pub fn control_loading(&self, k: usize) -> f64 {
        match k {
            0 => 1.0,
            1 => 0.7,
            _ => 0.0,
        }
    }

    pub fn dates(&self) -> Result<Vec<NaiveDate>, AppError> {
        let mut dates = Vec::with_capacity(self.len());
        let mut d = self.start;
        for _ in 0..self.len() {
            dates.push(d);
            d = self
                .periodicity
                .next(d)
                .ok_or_else(|| AppError::config("synthetic date range overflows the calendar"))?;
        }
        Ok(dates)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.strata.is_empty() {
            return Err(AppError::config("synthetic data needs at least one stratum"));
        }
        if self.pre_periods < 2 * self.periodicity.steps_per_year() || self.post_periods == 0 {
            return Err(AppError::config(
                "synthetic data needs two pre-intervention years and a post period",
            ));
        }
        if self.eval_delay >= self.post_periods {
            return Err(AppError::config("evaluation delay leaves no evaluation periods"));
        }
        if !(self.baseline > 0.0 && self.control_scale > 0.0 && self.effect > 0.0) {
            return Err(AppError::config("synthetic rates and effect must be positive"));
        }
        if !self.seasonal_amplitude.is_finite() {
            return Err(AppError::config("seasonal amplitude must be finite"));
        }
        Ok(())
    }
}

/// Generate a registry and a matching configuration.
///
/// The same spec (including seed) always yields the same data.
pub fn synthetic_registry(spec: &SyntheticSpec) -> Result<(SeriesRegistry, AnalysisConfig), AppError> {
    spec.validate()?;
    let dates = spec.dates()?;

    let mut registry = SeriesRegistry::new();
    for name in &spec.strata {
        let (stratum, _) = synthetic_stratum(spec, name, &dates)?;
        registry.insert(stratum)?;
    }

    let boundaries = PeriodBoundaries {
        intervention: dates[spec.pre_periods],
        eval_start: dates[spec.pre_periods + spec.eval_delay],
        eval_end: None,
    };
    let mut config = AnalysisConfig::new("outcome", boundaries);
    config.group_field = "stratum".to_string();
    config.periodicity = spec.periodicity;
    config.season_count = spec.periodicity.steps_per_year();
    config.covariate_fields = spec.control_names();
    if spec.population.is_some() {
        config.denominator_field = Some("population".to_string());
    }
    config.sampler.seed = spec.seed;
    Ok((registry, config))
}

/// Expected outcome counts without the intervention effect, per stratum.
///
/// These are the true counterfactual means behind `synthetic_registry(spec)`.
pub fn expected_counts(spec: &SyntheticSpec) -> Result<BTreeMap<String, Vec<f64>>, AppError> {
    spec.validate()?;
    let dates = spec.dates()?;
    let mut out = BTreeMap::new();
    for name in &spec.strata {
        let (_, expected) = synthetic_stratum(spec, name, &dates)?;
        out.insert(name.clone(), expected);
    }
    Ok(out)
}

fn synthetic_stratum(
    spec: &SyntheticSpec,
    name: &str,
    dates: &[NaiveDate],
) -> Result<(Stratum, Vec<f64>), AppError> {
    let mut rng = StdRng::seed_from_u64(derive_seed(spec.seed, name));
    let noise = Normal::new(0.0, 0.05).map_err(|e| AppError::numerical(format!("noise distribution: {e}")))?;
    let n = dates.len();
    let per_year = spec.periodicity.steps_per_year() as f64;

    let latent = ar_noise(&mut rng, &noise, n, 0.6)
        .into_iter()
        .enumerate()
        .map(|(t, e)| {
            let phase = std::f64::consts::TAU * t as f64 / per_year;
            spec.seasonal_amplitude * phase.cos() + 0.05 * t as f64 / per_year + e
        })
        .collect::<Vec<_>>();
    let mean_rate = latent.iter().map(|l| l.exp()).sum::<f64>() / n as f64;

    let mut covariates = Vec::with_capacity(spec.controls + 1);
    for k in 0..spec.controls {
        let w = spec.control_loading(k);
        let own = ar_noise(&mut rng, &noise, n, 0.9);
        let values = (0..n)
            .map(|t| {
                let log_rate = w * latent[t] + (1.0 - w) * 4.0 * own[t];
                poisson(&mut rng, spec.control_scale * log_rate.exp())
            })
            .collect::<Result<Vec<_>, _>>()?;
        covariates.push(TimeIndexedSeries::new(format!("control_{}", k + 1), dates.to_vec(), values));
    }
    if spec.degenerate_control {
        covariates.push(TimeIndexedSeries::new(ZERO_CONTROL, dates.to_vec(), vec![0.0; n]));
    }

    let denominator = spec
        .population
        .map(|p| TimeIndexedSeries::new("population", dates.to_vec(), vec![p; n]));

    let expected: Vec<f64> = latent.iter().map(|l| spec.baseline * l.exp() / mean_rate).collect();
    let outcome = expected
        .iter()
        .enumerate()
        .map(|(t, &mu)| {
            let effect = if t >= spec.pre_periods { spec.effect } else { 1.0 };
            poisson(&mut rng, mu * effect)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let stratum = Stratum::from_series(
        name,
        spec.periodicity,
        TimeIndexedSeries::new("outcome", dates.to_vec(), outcome),
        denominator,
        covariates,
    )?;
    Ok((stratum, expected))
}

/// Stationary AR(1) noise.
fn ar_noise(rng: &mut StdRng, noise: &Normal<f64>, n: usize, phi: f64) -> Vec<f64> {
    let mut state = 0.0;
    (0..n)
        .map(|_| {
            state = phi * state + noise.sample(rng);
            state
        })
        .collect()
}

fn poisson(rng: &mut StdRng, mean: f64) -> Result<f64, AppError> {
    if mean <= 0.0 {
        return Ok(0.0);
    }
    let dist = Poisson::new(mean).map_err(|e| AppError::numerical(format!("Poisson({mean}): {e}")))?;
    Ok(dist.sample(rng))
}
