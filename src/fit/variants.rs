//! The counterfactual model variants.
//!
//! Every variant produces the same `FittedModel` shape so the aggregator never
//! branches on the variant:
//!
//! - `full`: all usable covariates, Gaussian slab priors, MCMC
//! - `best`: spike-and-slab selection over the same covariates, MCMC
//! - `pca`: STL+PCA synthetic-control components as covariates, MCMC
//! - `time`: seasonal terms and a linear trend only, MCMC
//! - `its`: segmented regression on the full series by maximum likelihood, with
//!   parametric coefficient draws for the counterfactual
//!
//! Covariate variants without usable covariates (and `best` when nothing is
//! retained) return the `time` fit, relabelled and flagged with a fallback record.

use chrono::NaiveDate;
use nalgebra::{Cholesky, DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::data::registry::Stratum;
use crate::data::windows::AnalysisWindows;
use crate::domain::{AnalysisConfig, ExcludedCovariate, Family, IntervalEstimate, ModelVariant};
use crate::error::AppError;
use crate::fit::budget::FitBudget;
use crate::fit::sampler::{
    CoefPrior, ConvergenceReport, SamplerInput, derive_seed, posterior_predictive,
    predictive_count, sample_posterior,
};
use crate::math::glm::{GlmProblem, fit_glm, mean_response};
use crate::math::stats::{normal_quantile, summarize};
use crate::models::design::{
    ColumnKind, Design, DesignSpec, InterventionTerms, PreparedCovariate, build_design,
    prepare_covariate, season_phase, standardize,
};
use crate::reduce::ReducedCovariates;

/// Inclusion probability above which a covariate counts as retained.
pub const RETENTION_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoefficientSummary {
    pub name: String,
    pub estimate: IntervalEstimate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inclusion_prob: Option<f64>,
}

/// Counterfactual predictions over the full time range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Counterfactual {
    pub dates: Vec<NaiveDate>,
    pub median: Vec<f64>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
    /// Simulated count series, one per draw.
    #[serde(skip)]
    pub draws: Option<Vec<Vec<f64>>>,
}

impl Counterfactual {
    pub fn from_draws(dates: Vec<NaiveDate>, draws: Vec<Vec<f64>>, lower_p: f64, upper_p: f64) -> Self {
        let n = dates.len();
        let mut median = Vec::with_capacity(n);
        let mut lower = Vec::with_capacity(n);
        let mut upper = Vec::with_capacity(n);
        for t in 0..n {
            let column: Vec<f64> = draws.iter().map(|d| d[t]).collect();
            let s = summarize(&column, lower_p, upper_p);
            median.push(s.median);
            lower.push(s.lower);
            upper.push(s.upper);
        }
        Self {
            dates,
            median,
            lower,
            upper,
            draws: Some(draws),
        }
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackRecord {
    pub requested: ModelVariant,
    pub used: ModelVariant,
    pub reason: String,
}

/// One fitted variant for one stratum. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FittedModel {
    pub stratum: String,
    pub variant: ModelVariant,
    pub coefficients: Vec<CoefficientSummary>,
    /// AIC of the mode (MAP for sampled variants, MLE for `its`).
    pub aic: f64,
    /// Negative binomial size.
    pub dispersion: Option<IntervalEstimate>,
    pub counterfactual: Counterfactual,
    pub selected_covariates: Vec<String>,
    pub excluded_covariates: Vec<ExcludedCovariate>,
    pub convergence: Option<ConvergenceReport>,
    pub warnings: Vec<String>,
    pub fallback: Option<FallbackRecord>,
    /// `its` only: post-intervention change in the annual trend, as a rate ratio.
    pub trend_change: Option<IntervalEstimate>,
    /// `its` only: immediate level change at the intervention, as a rate ratio.
    pub level_change: Option<IntervalEstimate>,
}

impl FittedModel {
    pub fn is_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}

/// Everything a single (stratum, variant) fit reads.
#[derive(Debug, Clone)]
pub struct FitContext<'a> {
    pub stratum: &'a Stratum,
    pub windows: AnalysisWindows,
    pub config: &'a AnalysisConfig,
    pub budget: FitBudget,
}

impl FitContext<'_> {
    fn seed(&self, variant: ModelVariant) -> u64 {
        derive_seed(self.config.sampler.seed, &(self.stratum.name(), variant.name()))
    }

    fn design(&self, trend: bool, intervention: Option<InterventionTerms>, covariates: &[PreparedCovariate]) -> Design {
        let config = self.config;
        build_design(&DesignSpec {
            n: self.stratum.len(),
            season_count: config.season_count,
            season_phase: season_phase(
                self.stratum.index().first(),
                config.periodicity,
                config.season_count,
            ),
            steps_per_year: config.periodicity.steps_per_year(),
            trend,
            trend_center: (self.windows.n_pre() as f64 - 1.0) / 2.0,
            intervention,
            covariates,
        })
    }
}

/// Fit one variant.
pub fn fit_variant(
    variant: ModelVariant,
    ctx: &FitContext<'_>,
    reduced: Option<&ReducedCovariates>,
) -> Result<FittedModel, AppError> {
    let model = match variant {
        ModelVariant::Time => fit_time(ctx)?,
        ModelVariant::Its => fit_its(ctx)?,
        ModelVariant::Full | ModelVariant::Best => {
            let (covariates, excluded) = prepare_raw_covariates(ctx);
            if covariates.is_empty() {
                return fallback_to_time(ctx, variant, "no usable covariates", excluded);
            }
            let selection = variant == ModelVariant::Best;
            let mut model = fit_sampled(ctx, variant, &covariates, selection)?;
            model.excluded_covariates = excluded;
            if selection && model.selected_covariates.is_empty() {
                let excluded = model.excluded_covariates;
                return fallback_to_time(ctx, variant, "selection retained no covariates", excluded);
            }
            model
        }
        ModelVariant::Pca => {
            let Some(reduced) = reduced.filter(|r| !r.is_empty()) else {
                let excluded = reduced.map(|r| r.excluded.clone()).unwrap_or_default();
                return fallback_to_time(ctx, variant, "no synthetic-control components", excluded);
            };
            let mut components = Vec::with_capacity(reduced.components.len());
            for pc in &reduced.components {
                match standardize(&pc.name, &pc.scores, ctx.windows.pre()) {
                    Ok(c) => components.push(c),
                    Err(err) => warn!(stratum = ctx.stratum.name(), component = %pc.name, %err, "component dropped"),
                }
            }
            if components.is_empty() {
                return fallback_to_time(
                    ctx,
                    variant,
                    "synthetic-control components are constant before the intervention",
                    reduced.excluded.clone(),
                );
            }
            let mut model = fit_sampled(ctx, variant, &components, false)?;
            model.excluded_covariates = reduced.excluded.clone();
            model
        }
    };
    info!(
        stratum = ctx.stratum.name(),
        variant = variant.name(),
        aic = model.aic,
        warnings = model.warnings.len(),
        "variant fitted"
    );
    Ok(model)
}

fn prepare_raw_covariates(ctx: &FitContext<'_>) -> (Vec<PreparedCovariate>, Vec<ExcludedCovariate>) {
    let mut prepared = Vec::new();
    let mut excluded = Vec::new();
    for (name, raw) in ctx.stratum.covariates().iter() {
        match prepare_covariate(
            name,
            raw,
            ctx.config.log_covariates,
            ctx.config.log_offset,
            ctx.windows.pre(),
        ) {
            Ok(c) => prepared.push(c),
            Err(err) => excluded.push(ExcludedCovariate::from_error(name, &err)),
        }
    }
    (prepared, excluded)
}

fn fit_time(ctx: &FitContext<'_>) -> Result<FittedModel, AppError> {
    fit_sampled(ctx, ModelVariant::Time, &[], false)
}

fn fallback_to_time(
    ctx: &FitContext<'_>,
    requested: ModelVariant,
    reason: &str,
    excluded: Vec<ExcludedCovariate>,
) -> Result<FittedModel, AppError> {
    warn!(
        stratum = ctx.stratum.name(),
        variant = requested.name(),
        reason,
        "falling back to the trend-only model"
    );
    let mut model = fit_time(ctx)?;
    model.variant = requested;
    model.excluded_covariates = excluded;
    model.fallback = Some(FallbackRecord {
        requested,
        used: ModelVariant::Time,
        reason: reason.to_string(),
    });
    Ok(model)
}

fn column_priors(design: &Design, config: &AnalysisConfig, selection: bool) -> Vec<CoefPrior> {
    let priors = &config.priors;
    design
        .kinds
        .iter()
        .map(|kind| match kind {
            ColumnKind::Intercept => CoefPrior::Flat,
            ColumnKind::Covariate if selection => CoefPrior::SpikeSlab {
                spike_sd: priors.spike_sd,
                slab_sd: priors.slab_sd,
                inclusion_prob: priors.inclusion_prob,
            },
            ColumnKind::Covariate => CoefPrior::Normal { sd: priors.slab_sd },
            _ => CoefPrior::Normal {
                sd: priors.baseline_sd,
            },
        })
        .collect()
}

fn fit_sampled(
    ctx: &FitContext<'_>,
    variant: ModelVariant,
    covariates: &[PreparedCovariate],
    selection: bool,
) -> Result<FittedModel, AppError> {
    let config = ctx.config;
    let design = ctx.design(variant == ModelVariant::Time, None, covariates);
    let pre = ctx.windows.pre();
    let x_pre = design.rows(pre.clone());
    let offset = ctx.stratum.log_offset();
    let priors = column_priors(&design, config, selection);
    let seed = ctx.seed(variant);

    let draws = sample_posterior(
        &SamplerInput {
            x: &x_pre,
            y: &ctx.stratum.outcome()[pre.clone()],
            offset: &offset[pre],
            family: config.family,
            priors: &priors,
        },
        &config.sampler,
        seed,
        &ctx.budget,
    )?;
    let simulated = posterior_predictive(
        &design.matrix,
        &offset,
        &draws,
        derive_seed(seed, "predictive"),
        &ctx.budget,
    )?;

    let (lower_p, upper_p) = config.interval_probs();
    let coefficients: Vec<CoefficientSummary> = design
        .names
        .iter()
        .enumerate()
        .map(|(j, name)| CoefficientSummary {
            name: name.clone(),
            estimate: summarize(&draws.coefficient(j), lower_p, upper_p),
            inclusion_prob: draws.inclusion[j],
        })
        .collect();
    let selected_covariates: Vec<String> = design
        .columns_of(ColumnKind::Covariate)
        .into_iter()
        .filter(|&j| draws.inclusion[j].is_none_or(|p| p > RETENTION_THRESHOLD))
        .map(|j| design.names[j].clone())
        .collect();
    let dispersion = (config.family == Family::NegativeBinomial && !draws.theta.is_empty())
        .then(|| summarize(&draws.theta, lower_p, upper_p));

    let mut warnings = Vec::new();
    let report = &draws.convergence;
    if report.max_rhat > config.sampler.rhat_threshold {
        warnings.push(format!(
            "split R-hat {:.3} exceeds {:.2}",
            report.max_rhat, config.sampler.rhat_threshold
        ));
    }
    if !report.converged && report.max_rhat <= config.sampler.rhat_threshold {
        warnings.push(format!("low acceptance rate {:.3}", report.acceptance));
    }
    if !draws.map.converged {
        warnings.push("posterior mode search did not converge".to_string());
    }
    for w in &warnings {
        warn!(stratum = ctx.stratum.name(), variant = variant.name(), warning = %w, "unreliable fit");
    }

    Ok(FittedModel {
        stratum: ctx.stratum.name().to_string(),
        variant,
        coefficients,
        aic: draws.map.aic(),
        dispersion,
        counterfactual: Counterfactual::from_draws(
            ctx.stratum.dates().to_vec(),
            simulated,
            lower_p,
            upper_p,
        ),
        selected_covariates,
        excluded_covariates: Vec::new(),
        convergence: Some(draws.convergence),
        warnings,
        fallback: None,
        trend_change: None,
        level_change: None,
    })
}

fn wald(beta: f64, se: f64, z: f64) -> IntervalEstimate {
    IntervalEstimate::new(beta, beta - z * se, beta + z * se)
}

fn rate_ratio(beta: f64, se: f64, z: f64) -> IntervalEstimate {
    IntervalEstimate::new(beta.exp(), (beta - z * se).exp(), (beta + z * se).exp())
}

fn fit_its(ctx: &FitContext<'_>) -> Result<FittedModel, AppError> {
    let config = ctx.config;
    let terms = InterventionTerms {
        post_start: ctx.windows.post_start,
        level_change: config.its_level_change,
    };
    let design = ctx.design(true, Some(terms), &[]);
    let offset = ctx.stratum.log_offset();
    let penalty = vec![(0.0, 0.0); design.n_cols()];
    let fit = fit_glm(&GlmProblem {
        x: &design.matrix,
        y: ctx.stratum.outcome(),
        offset: &offset,
        family: config.family,
        penalty: &penalty,
    })?;
    ctx.budget.check()?;

    let (lower_p, upper_p) = config.interval_probs();
    let z = normal_quantile(upper_p);
    let coefficients: Vec<CoefficientSummary> = design
        .names
        .iter()
        .enumerate()
        .map(|(j, name)| CoefficientSummary {
            name: name.clone(),
            estimate: wald(fit.beta[j], fit.std_error(j), z),
            inclusion_prob: None,
        })
        .collect();
    let effect = |kind: ColumnKind| {
        design
            .columns_of(kind)
            .first()
            .map(|&j| rate_ratio(fit.beta[j], fit.std_error(j), z))
    };
    let trend_change = effect(ColumnKind::PostSlope);
    let level_change = effect(ColumnKind::PostLevel);

    let counterfactual_x = design.without_intervention();
    let lower = match Cholesky::new(fit.covariance.clone()) {
        Some(chol) => chol.l(),
        None => DMatrix::from_diagonal(&fit.covariance.diagonal().map(|v| v.max(0.0).sqrt())),
    };
    let n_draws = config.sampler.chains * config.sampler.draws;
    let seed = ctx.seed(ModelVariant::Its);
    let simulated: Vec<Vec<f64>> = (0..n_draws)
        .into_par_iter()
        .map(|d| -> Result<Vec<f64>, AppError> {
            if d % 64 == 0 {
                ctx.budget.check()?;
            }
            let mut rng = StdRng::seed_from_u64(derive_seed(seed, &d));
            let z = DVector::from_fn(fit.beta.len(), |_, _| rng.sample::<f64, _>(StandardNormal));
            let beta = &fit.beta + &lower * z;
            let mu = mean_response(&counterfactual_x, &beta, &offset);
            Ok(mu.iter().map(|&m| predictive_count(&mut rng, m, fit.theta)).collect())
        })
        .collect::<Result<Vec<_>, AppError>>()?;

    let mut warnings = Vec::new();
    if !fit.converged {
        warnings.push("maximum-likelihood fit did not converge".to_string());
        warn!(stratum = ctx.stratum.name(), "segmented regression did not converge");
    }

    Ok(FittedModel {
        stratum: ctx.stratum.name().to_string(),
        variant: ModelVariant::Its,
        coefficients,
        aic: fit.aic(),
        dispersion: fit.theta.map(|t| IntervalEstimate::new(t, t, t)),
        counterfactual: Counterfactual::from_draws(
            ctx.stratum.dates().to_vec(),
            simulated,
            lower_p,
            upper_p,
        ),
        selected_covariates: Vec::new(),
        excluded_covariates: Vec::new(),
        convergence: None,
        warnings,
        fallback: None,
        trend_change,
        level_change,
    })
}
