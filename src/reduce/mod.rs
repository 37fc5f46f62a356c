//! Covariate reduction: STL trend extraction followed by principal components.
//!
//! Each covariate is transformed (log with offset when configured), decomposed
//! with STL using the configured season count as the period, and its trend kept.
//! The trends of all usable covariates are then reduced to a few orthogonal
//! synthetic-control series. PCA is computed over the full time range.

pub mod pca;
pub mod stl;

use serde::Serialize;
use tracing::{debug, warn};

use crate::data::registry::Stratum;
use crate::domain::{AnalysisConfig, ExcludedCovariate};
use crate::error::AppError;
use crate::math::stats::std_dev;
use crate::models::design::transform_covariate;

pub use pca::{PcaResult, PrincipalComponent, principal_components};
pub use stl::{StlDecomposition, StlParams, stl};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReducedCovariates {
    pub components: Vec<PrincipalComponent>,
    pub explained_ratios: Vec<f64>,
    pub excluded: Vec<ExcludedCovariate>,
    /// `false` when the series was too short (or the season count too small)
    /// for STL, in which case the transformed covariates were used directly.
    pub decomposed: bool,
}

impl ReducedCovariates {
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

/// Trend component of a single (already transformed) series.
///
/// Returns `None` when STL cannot run on this series length.
pub fn trend_component(values: &[f64], config: &AnalysisConfig) -> Result<Option<Vec<f64>>, AppError> {
    let period = config.season_count;
    if period < 2 || values.len() <= 2 * period {
        return Ok(None);
    }
    let params = StlParams::new(
        values.len(),
        period,
        config.pca.seasonal_window,
        config.pca.robust_iterations,
    );
    Ok(Some(stl(values, &params)?.trend))
}

pub fn reduce_covariates(
    stratum: &Stratum,
    config: &AnalysisConfig,
) -> Result<ReducedCovariates, AppError> {
    let mut excluded = Vec::new();
    let mut trends: Vec<(String, Vec<f64>)> = Vec::new();
    let mut decomposed = true;

    for (name, raw) in stratum.covariates().iter() {
        let transformed = match transform_covariate(
            name,
            raw,
            config.log_covariates,
            config.log_offset,
        ) {
            Ok(v) => v,
            Err(err) => {
                warn!(stratum = stratum.name(), covariate = name, %err, "excluded from reduction");
                excluded.push(ExcludedCovariate::from_error(name, &err));
                continue;
            }
        };
        let trend = match trend_component(&transformed, config)? {
            Some(trend) => trend,
            None => {
                decomposed = false;
                transformed
            }
        };
        if !(std_dev(&trend) > 1e-10) {
            excluded.push(ExcludedCovariate {
                name: name.to_string(),
                reason: "trend component is constant".to_string(),
            });
            continue;
        }
        trends.push((name.to_string(), trend));
    }

    if trends.is_empty() {
        debug!(stratum = stratum.name(), "no usable covariates for reduction");
        return Ok(ReducedCovariates {
            components: Vec::new(),
            explained_ratios: Vec::new(),
            excluded,
            decomposed,
        });
    }

    let PcaResult {
        components,
        explained_ratios,
    } = principal_components(&trends, config.pca.retention)?;
    debug!(
        stratum = stratum.name(),
        inputs = trends.len(),
        retained = components.len(),
        leading_ratio = explained_ratios.first().copied().unwrap_or(0.0),
        "covariates reduced"
    );

    Ok(ReducedCovariates {
        components,
        explained_ratios,
        excluded,
        decomposed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::registry::TimeIndexedSeries;
    use crate::domain::{Periodicity, PeriodBoundaries};
    use chrono::NaiveDate;

    fn dates(n: usize) -> Vec<NaiveDate> {
        let mut d = NaiveDate::from_ymd_opt(2003, 1, 1).unwrap();
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(d);
            d = Periodicity::Monthly.next(d).unwrap();
        }
        out
    }

    fn config() -> AnalysisConfig {
        let d = dates(84);
        AnalysisConfig::new(
            "deaths",
            PeriodBoundaries {
                intervention: d[60],
                eval_start: d[72],
                eval_end: None,
            },
        )
    }

    fn stratum(covariates: Vec<TimeIndexedSeries>) -> Stratum {
        let d = dates(84);
        let outcome = TimeIndexedSeries::new("deaths", d.clone(), vec![20.0; 84]);
        Stratum::from_series("all", Periodicity::Monthly, outcome, None, covariates).unwrap()
    }

    fn seasonal(n: usize, level: f64, slope: f64) -> Vec<f64> {
        (0..n)
            .map(|i| {
                let season = (2.0 * std::f64::consts::PI * i as f64 / 12.0).sin();
                level * (1.0 + slope * i as f64) * (1.0 + 0.2 * season)
            })
            .collect()
    }

    #[test]
    fn scaled_covariates_share_one_component() {
        let d = dates(84);
        let a = seasonal(84, 40.0, 0.01);
        let b: Vec<f64> = a.iter().map(|v| v * 3.0).collect();
        let s = stratum(vec![
            TimeIndexedSeries::new("a", d.clone(), a),
            TimeIndexedSeries::new("b", d, b),
        ]);
        let mut cfg = config();
        // Without the log transform a scale factor leaves the trends proportional.
        cfg.log_covariates = false;
        let reduced = reduce_covariates(&s, &cfg).unwrap();
        assert!(reduced.decomposed);
        assert_eq!(reduced.components.len(), 1);
        assert!(reduced.explained_ratios[0] > 0.999);
    }

    #[test]
    fn degenerate_covariates_are_listed() {
        let d = dates(84);
        let s = stratum(vec![
            TimeIndexedSeries::new("zero", d.clone(), vec![0.0; 84]),
            TimeIndexedSeries::new("flat", d.clone(), vec![5.0; 84]),
            TimeIndexedSeries::new("ok", d, seasonal(84, 30.0, 0.005)),
        ]);
        let reduced = reduce_covariates(&s, &config()).unwrap();
        let names: Vec<&str> = reduced.excluded.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["zero", "flat"]);
        assert_eq!(reduced.components.len(), 1);
    }

    #[test]
    fn no_covariates_gives_empty_reduction() {
        let reduced = reduce_covariates(&stratum(Vec::new()), &config()).unwrap();
        assert!(reduced.is_empty());
    }
}
