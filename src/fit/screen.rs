//! Single-covariate screening regressions.
//!
//! For every (stratum, candidate covariate) pair we fit, on the pre-intervention
//! window only:
//!
//! `log μ_t = α + season(t) + β · g(x_t) [+ log denominator_t]`
//!
//! where `g` is the configured transform (log with additive offset by default).
//! Candidates are ranked by AIC. The ranking is diagnostic; the model variants do
//! not depend on it.

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::data::registry::{SeriesRegistry, Stratum};
use crate::data::windows::AnalysisWindows;
use crate::domain::{AnalysisConfig, ExcludedCovariate, IntervalEstimate};
use crate::error::AppError;
use crate::math::glm::{GlmProblem, fit_glm};
use crate::math::stats::normal_quantile;
use crate::models::design::{
    DesignSpec, PreparedCovariate, build_design, season_phase, standardize, transform_covariate,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ScreenEntry {
    Fitted {
        covariate: String,
        /// `exp(β)` per unit of the transformed covariate, with a Wald interval.
        rate_ratio: IntervalEstimate,
        aic: f64,
        theta: Option<f64>,
    },
    Excluded {
        covariate: String,
        reason: String,
    },
}

impl ScreenEntry {
    pub fn covariate(&self) -> &str {
        match self {
            ScreenEntry::Fitted { covariate, .. } | ScreenEntry::Excluded { covariate, .. } => {
                covariate
            }
        }
    }

    pub fn aic(&self) -> Option<f64> {
        match self {
            ScreenEntry::Fitted { aic, .. } => Some(*aic),
            ScreenEntry::Excluded { .. } => None,
        }
    }
}

/// Ranked screening results of one stratum: fitted entries by ascending AIC,
/// then the excluded candidates in input order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScreeningReport {
    pub stratum: String,
    pub entries: Vec<ScreenEntry>,
}

impl ScreeningReport {
    fn from_entries(stratum: &str, entries: Vec<ScreenEntry>) -> Self {
        let (mut fitted, excluded): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|e| e.aic().is_some());
        fitted.sort_by(|a, b| {
            let (a, b) = (a.aic().unwrap_or(f64::INFINITY), b.aic().unwrap_or(f64::INFINITY));
            a.total_cmp(&b)
        });
        fitted.extend(excluded);
        Self {
            stratum: stratum.to_string(),
            entries: fitted,
        }
    }

    pub fn excluded(&self) -> Vec<ExcludedCovariate> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                ScreenEntry::Excluded { covariate, reason } => Some(ExcludedCovariate {
                    name: covariate.clone(),
                    reason: reason.clone(),
                }),
                ScreenEntry::Fitted { .. } => None,
            })
            .collect()
    }
}

/// Fit the screening regression for one covariate.
pub fn screen_covariate(
    stratum: &Stratum,
    covariate: &str,
    raw: &[f64],
    windows: &AnalysisWindows,
    config: &AnalysisConfig,
) -> ScreenEntry {
    match fit_screen(stratum, covariate, raw, windows, config) {
        Ok(entry) => entry,
        Err(err) => {
            let excluded = ExcludedCovariate::from_error(covariate, &err);
            warn!(
                stratum = stratum.name(),
                covariate,
                reason = %excluded.reason,
                "covariate excluded from screening"
            );
            ScreenEntry::Excluded {
                covariate: excluded.name,
                reason: excluded.reason,
            }
        }
    }
}

fn fit_screen(
    stratum: &Stratum,
    covariate: &str,
    raw: &[f64],
    windows: &AnalysisWindows,
    config: &AnalysisConfig,
) -> Result<ScreenEntry, AppError> {
    let pre = windows.pre();
    let values = transform_covariate(covariate, raw, config.log_covariates, config.log_offset)?;
    // Degeneracy check only; the regression uses the unstandardized scale.
    standardize(covariate, &values, pre.clone())?;

    let column = [PreparedCovariate {
        name: covariate.to_string(),
        values,
    }];
    let design = build_design(&DesignSpec {
        n: stratum.len(),
        season_count: config.season_count,
        season_phase: season_phase(stratum.index().first(), config.periodicity, config.season_count),
        steps_per_year: config.periodicity.steps_per_year(),
        trend: false,
        trend_center: 0.0,
        intervention: None,
        covariates: &column,
    });
    let x = design.rows(pre.clone());
    let offset = &stratum.log_offset()[pre.clone()];
    let penalty = vec![(0.0, 0.0); design.n_cols()];
    let fit = fit_glm(&GlmProblem {
        x: &x,
        y: &stratum.outcome()[pre],
        offset,
        family: config.family,
        penalty: &penalty,
    })
    .map_err(|e| AppError::degenerate(covariate, e.to_string()))?;

    let j = design.n_cols() - 1;
    let (_, upper_p) = config.interval_probs();
    let z = normal_quantile(upper_p);
    let (b, se) = (fit.beta[j], fit.std_error(j));
    Ok(ScreenEntry::Fitted {
        covariate: covariate.to_string(),
        rate_ratio: IntervalEstimate::new(b.exp(), (b - z * se).exp(), (b + z * se).exp()),
        aic: fit.aic(),
        theta: fit.theta,
    })
}

/// Screen every candidate covariate of every stratum.
///
/// The (stratum, covariate) jobs run in parallel; results are keyed by stratum
/// name so completion order does not matter.
pub fn screen_registry(
    registry: &SeriesRegistry,
    config: &AnalysisConfig,
) -> Result<BTreeMap<String, ScreeningReport>, AppError> {
    let mut windows = BTreeMap::new();
    for stratum in registry.iter() {
        let w = AnalysisWindows::resolve(stratum.index(), &config.boundaries, config.prevented_start)?;
        windows.insert(stratum.name().to_string(), w);
    }

    let jobs: Vec<(&Stratum, usize, &str, &[f64])> = registry
        .iter()
        .flat_map(|s| {
            s.covariates()
                .iter()
                .enumerate()
                .map(move |(i, (name, raw))| (s, i, name, raw))
        })
        .collect();

    let mut results: Vec<(String, usize, ScreenEntry)> = jobs
        .par_iter()
        .filter_map(|&(stratum, i, name, raw)| {
            let w = windows.get(stratum.name())?;
            Some((
                stratum.name().to_string(),
                i,
                screen_covariate(stratum, name, raw, w, config),
            ))
        })
        .collect();
    results.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));

    let mut grouped: BTreeMap<String, Vec<ScreenEntry>> = registry
        .iter()
        .map(|s| (s.name().to_string(), Vec::new()))
        .collect();
    for (stratum, _, entry) in results {
        grouped.entry(stratum).or_default().push(entry);
    }

    let reports: BTreeMap<String, ScreeningReport> = grouped
        .into_iter()
        .map(|(name, entries)| {
            let report = ScreeningReport::from_entries(&name, entries);
            (name, report)
        })
        .collect();
    info!(strata = reports.len(), jobs = jobs.len(), "screening complete");
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::registry::TimeIndexedSeries;
    use crate::domain::{Family, PeriodBoundaries, Periodicity};
    use chrono::NaiveDate;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Poisson};

    fn dates(n: usize) -> Vec<NaiveDate> {
        let mut d = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap();
        (0..n)
            .map(|_| {
                let out = d;
                d = Periodicity::Monthly.next(d).unwrap();
                out
            })
            .collect()
    }

    fn registry() -> (SeriesRegistry, AnalysisConfig) {
        let n = 72;
        let d = dates(n);
        let mut rng = StdRng::seed_from_u64(8);
        let driver: Vec<f64> = (0..n)
            .map(|i| 50.0 * (1.0 + 0.4 * (i as f64 * 0.45).sin()))
            .collect();
        let outcome: Vec<f64> = driver
            .iter()
            .map(|&c| Poisson::new(c * 0.8).unwrap().sample(&mut rng))
            .collect();
        let noise: Vec<f64> = (0..n).map(|i| 30.0 + ((i * 7) % 11) as f64).collect();

        let stratum = Stratum::from_series(
            "adults",
            Periodicity::Monthly,
            TimeIndexedSeries::new("deaths", d.clone(), outcome),
            None,
            vec![
                TimeIndexedSeries::new("flat", d.clone(), vec![3.0; n]),
                TimeIndexedSeries::new("noise", d.clone(), noise),
                TimeIndexedSeries::new("driver", d.clone(), driver),
            ],
        )
        .unwrap();
        let mut registry = SeriesRegistry::new();
        registry.insert(stratum).unwrap();

        let mut config = AnalysisConfig::new(
            "deaths",
            PeriodBoundaries {
                intervention: d[60],
                eval_start: d[60],
                eval_end: None,
            },
        );
        config.family = Family::Poisson;
        (registry, config)
    }

    #[test]
    fn informative_covariate_ranks_first() {
        let (registry, config) = registry();
        let reports = screen_registry(&registry, &config).unwrap();
        let report = &reports["adults"];
        assert_eq!(report.entries.len(), 3);
        assert_eq!(report.entries[0].covariate(), "driver");
        assert_eq!(report.entries[1].covariate(), "noise");
        assert!(matches!(report.entries[2], ScreenEntry::Excluded { .. }));
        assert_eq!(report.excluded()[0].name, "flat");

        let ScreenEntry::Fitted { rate_ratio, .. } = &report.entries[0] else {
            panic!("driver should be fitted");
        };
        // Outcome is proportional to the driver: elasticity near 1.
        assert!((rate_ratio.median.ln() - 1.0).abs() < 0.3, "{rate_ratio:?}");
        assert!(rate_ratio.lower < rate_ratio.median && rate_ratio.median < rate_ratio.upper);
    }

    #[test]
    fn stratum_without_covariates_has_empty_report() {
        let d = dates(36);
        let stratum = Stratum::from_series(
            "kids",
            Periodicity::Monthly,
            TimeIndexedSeries::new("deaths", d.clone(), vec![4.0; 36]),
            None,
            Vec::new(),
        )
        .unwrap();
        let mut registry = SeriesRegistry::new();
        registry.insert(stratum).unwrap();
        let config = AnalysisConfig::new(
            "deaths",
            PeriodBoundaries {
                intervention: d[24],
                eval_start: d[24],
                eval_end: None,
            },
        );
        let reports = screen_registry(&registry, &config).unwrap();
        assert!(reports["kids"].entries.is_empty());
    }
}
