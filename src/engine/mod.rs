//! Batch runner over strata × variants.
//!
//! A run is:
//!
//! 1. validate the configuration and every stratum's period boundaries (fatal)
//! 2. screen all (stratum, covariate) pairs
//! 3. reduce each stratum's covariates with STL+PCA
//! 4. fit every enabled (stratum, variant) pair and summarize its impact
//! 5. pick each stratum's preferred variant
//!
//! Steps 2-4 run on the rayon pool. A failing (stratum, variant) fit is recorded
//! as `Failed` and never aborts its siblings.

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, info_span, warn};

use crate::data::registry::{SeriesRegistry, Stratum};
use crate::data::windows::AnalysisWindows;
use crate::domain::{AnalysisConfig, ExcludedCovariate, ModelVariant};
use crate::error::AppError;
use crate::fit::budget::{CancelToken, FitBudget};
use crate::fit::screen::{ScreeningReport, screen_registry};
use crate::fit::selection::{Candidates, PreferredVariant, select_preferred};
use crate::fit::variants::{FitContext, FittedModel, fit_variant};
use crate::impact::{ImpactSummary, summarize_impact};
use crate::reduce::{ReducedCovariates, reduce_covariates};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum VariantOutcome {
    Fitted {
        model: Box<FittedModel>,
        impact: Box<ImpactSummary>,
    },
    Failed {
        reason: String,
    },
}

impl VariantOutcome {
    pub fn fitted(&self) -> Option<(&FittedModel, &ImpactSummary)> {
        match self {
            VariantOutcome::Fitted { model, impact } => Some((model, impact)),
            VariantOutcome::Failed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StratumResult {
    pub stratum: String,
    pub variants: BTreeMap<ModelVariant, VariantOutcome>,
    pub preferred: Option<PreferredVariant>,
    pub reduction: Option<ReducedCovariates>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reduction_error: Option<String>,
    /// Candidates excluded by the screener.
    pub excluded_covariates: Vec<ExcludedCovariate>,
}

impl StratumResult {
    pub fn outcome(&self, variant: ModelVariant) -> Option<&VariantOutcome> {
        self.variants.get(&variant)
    }

    pub fn preferred_fit(&self) -> Option<(&FittedModel, &ImpactSummary)> {
        let variant = self.preferred.as_ref()?.variant;
        self.outcome(variant)?.fitted()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisOutput {
    pub config: AnalysisConfig,
    pub strata: BTreeMap<String, StratumResult>,
    pub screening: BTreeMap<String, ScreeningReport>,
}

/// Run the whole analysis. Only bad configuration or input is a fatal error.
pub fn run_analysis(
    registry: &SeriesRegistry,
    config: &AnalysisConfig,
    cancel: &CancelToken,
) -> Result<AnalysisOutput, AppError> {
    let _span = info_span!("analysis", strata = registry.len()).entered();
    config.validate()?;
    if registry.is_empty() {
        return Err(AppError::malformed("no strata to analyse"));
    }
    registry.validate_boundaries(&config.boundaries)?;

    let mut windows: BTreeMap<&str, AnalysisWindows> = BTreeMap::new();
    for stratum in registry.iter() {
        let w = AnalysisWindows::resolve(stratum.index(), &config.boundaries, config.prevented_start)?;
        if w.n_pre() <= config.season_count {
            return Err(AppError::malformed(format!(
                "stratum '{}' has {} pre-intervention periods; more than {} are required",
                stratum.name(),
                w.n_pre(),
                config.season_count
            )));
        }
        windows.insert(stratum.name(), w);
    }

    let screening = screen_registry(registry, config)?;

    let reductions: BTreeMap<&str, Result<ReducedCovariates, AppError>> =
        if config.variant_enabled(ModelVariant::Pca) {
            registry
                .iter()
                .collect::<Vec<_>>()
                .par_iter()
                .map(|&s| (s.name(), reduce_covariates(s, config)))
                .collect::<Vec<_>>()
                .into_iter()
                .collect()
        } else {
            BTreeMap::new()
        };

    let jobs: Vec<(&Stratum, ModelVariant)> = registry
        .iter()
        .flat_map(|s| config.variants.iter().map(move |&v| (s, v)))
        .collect();
    info!(jobs = jobs.len(), "fitting variants");

    let outcomes: Vec<((String, ModelVariant), VariantOutcome)> = jobs
        .par_iter()
        .map(|&(stratum, variant)| {
            let outcome = match windows.get(stratum.name()) {
                Some(&w) => run_job(stratum, variant, w, config, cancel, reductions.get(stratum.name())),
                None => VariantOutcome::Failed {
                    reason: "period boundaries were not resolved".to_string(),
                },
            };
            ((stratum.name().to_string(), variant), outcome)
        })
        .collect();

    let mut strata: BTreeMap<String, StratumResult> = BTreeMap::new();
    for stratum in registry.iter() {
        let (reduction, reduction_error) = match reductions.get(stratum.name()) {
            Some(Ok(r)) => (Some(r.clone()), None),
            Some(Err(e)) => (None, Some(e.to_string())),
            None => (None, None),
        };
        strata.insert(
            stratum.name().to_string(),
            StratumResult {
                stratum: stratum.name().to_string(),
                variants: BTreeMap::new(),
                preferred: None,
                reduction,
                reduction_error,
                excluded_covariates: screening
                    .get(stratum.name())
                    .map(ScreeningReport::excluded)
                    .unwrap_or_default(),
            },
        );
    }
    for ((name, variant), outcome) in outcomes {
        if let Some(result) = strata.get_mut(&name) {
            result.variants.insert(variant, outcome);
        }
    }
    for result in strata.values_mut() {
        let fitted: Candidates<'_> = result
            .variants
            .iter()
            .map(|(&v, o)| {
                let candidate = match o {
                    VariantOutcome::Fitted { model, .. } => Ok(model.as_ref()),
                    VariantOutcome::Failed { reason } => Err(reason.as_str()),
                };
                (v, candidate)
            })
            .collect();
        result.preferred = select_preferred(&config.fallback_order, &fitted);
        match &result.preferred {
            Some(p) => info!(stratum = %result.stratum, preferred = p.variant.name(), "stratum complete"),
            None => warn!(stratum = %result.stratum, "no eligible variant in the fallback order"),
        }
    }

    Ok(AnalysisOutput {
        config: config.clone(),
        strata,
        screening,
    })
}

fn run_job(
    stratum: &Stratum,
    variant: ModelVariant,
    windows: AnalysisWindows,
    config: &AnalysisConfig,
    cancel: &CancelToken,
    reduction: Option<&Result<ReducedCovariates, AppError>>,
) -> VariantOutcome {
    let reduced = match reduction {
        Some(Ok(r)) => Some(r),
        Some(Err(e)) if variant == ModelVariant::Pca => {
            return VariantOutcome::Failed {
                reason: format!("covariate reduction failed: {e}"),
            };
        }
        _ => None,
    };
    let ctx = FitContext {
        stratum,
        windows,
        config,
        budget: FitBudget::new(cancel.clone(), config.sampler.timeout),
    };
    let result = fit_variant(variant, &ctx, reduced).and_then(|model| {
        let impact = summarize_impact(&model, stratum.outcome(), &windows, config)?;
        Ok((model, impact))
    });
    match result {
        Ok((model, impact)) => VariantOutcome::Fitted {
            model: Box::new(model),
            impact: Box::new(impact),
        },
        Err(err) => {
            warn!(stratum = stratum.name(), variant = variant.name(), %err, "variant failed");
            VariantOutcome::Failed {
                reason: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::sample::{SyntheticSpec, synthetic_registry};
    use crate::domain::SamplerConfig;

    fn quick(config: &mut AnalysisConfig) {
        config.sampler = SamplerConfig {
            burn_in: 200,
            draws: 200,
            chains: 2,
            ..SamplerConfig::default()
        };
    }

    #[test]
    fn every_enabled_variant_is_reported() {
        let (registry, mut config) = synthetic_registry(&SyntheticSpec::default()).unwrap();
        quick(&mut config);
        let output = run_analysis(&registry, &config, &CancelToken::new()).unwrap();
        assert_eq!(output.strata.len(), registry.len());
        for result in output.strata.values() {
            assert_eq!(result.variants.len(), ModelVariant::ALL.len());
            assert!(result.preferred.is_some());
            assert!(result.preferred_fit().is_some());
        }
    }

    #[test]
    fn cancelled_run_reports_failures_without_aborting() {
        let (registry, mut config) = synthetic_registry(&SyntheticSpec::default()).unwrap();
        quick(&mut config);
        config.variants = vec![ModelVariant::Time, ModelVariant::Full];
        let cancel = CancelToken::new();
        cancel.cancel();
        let output = run_analysis(&registry, &config, &cancel).unwrap();
        for result in output.strata.values() {
            for outcome in result.variants.values() {
                assert!(matches!(outcome, VariantOutcome::Failed { reason } if reason.contains("cancelled")));
            }
            assert!(result.preferred.is_none());
        }
    }

    #[test]
    fn invalid_config_is_fatal() {
        let (registry, mut config) = synthetic_registry(&SyntheticSpec::default()).unwrap();
        config.variants.clear();
        assert!(run_analysis(&registry, &config, &CancelToken::new()).is_err());
    }
}
