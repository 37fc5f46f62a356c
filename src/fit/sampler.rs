//! Markov-chain Monte Carlo for the log-link count regressions.
//!
//! Every chain starts near the maximum-a-posteriori fit (IRLS with the priors
//! as ridge penalties) and, per iteration:
//!
//! - moves the always-included coefficients as a block, using a mixture of a
//!   multivariate-t independence proposal centred at the mode and an adaptive
//!   random walk
//! - for spike-and-slab coefficients, Gibbs-updates the inclusion indicator and
//!   then takes a single-site random-walk step
//! - for the negative binomial, takes a random-walk step on `ln θ`, bounded to
//!   the same range the maximum-likelihood search uses
//!
//! Proposal scales adapt during burn-in only. A chain is a pure function of its
//! inputs and seed; chains run on the rayon pool.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use nalgebra::{Cholesky, DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{ChiSquared, Distribution, Gamma, Poisson, StandardNormal};
use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;

use crate::domain::{Family, SamplerConfig};
use crate::error::AppError;
use crate::fit::budget::FitBudget;
use crate::math::glm::{
    ETA_CLAMP, GlmFit, GlmProblem, LN_THETA_MAX, LN_THETA_MIN, fit_glm, mean_response, nb_log_pmf,
    poisson_log_pmf,
};
use crate::math::stats::{mean, std_dev};

/// Degrees of freedom of the independence proposal.
const T_DOF: f64 = 5.0;
/// Share of block moves drawn from the independence proposal.
const INDEPENDENCE_PROB: f64 = 0.3;
const ADAPT_WINDOW: usize = 50;
const BUDGET_CHECK_EVERY: usize = 64;
const MIN_ACCEPTANCE: f64 = 0.05;
/// `ln θ ~ N(3, 2²)` restricted to `[LN_THETA_MIN, LN_THETA_MAX]`.
const LN_THETA_PRIOR_MEAN: f64 = 3.0;
const LN_THETA_PRIOR_SD: f64 = 2.0;
/// Random-walk steps on `ln θ` per iteration.
const THETA_STEPS: usize = 3;
const BLOCK_TARGET: f64 = 0.234;
const SITE_TARGET: f64 = 0.44;

/// Prior on a single coefficient.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CoefPrior {
    Flat,
    Normal {
        sd: f64,
    },
    /// Continuous spike-and-slab: `β | γ ~ N(0, (γ ? slab : spike)²)`, `γ ~ Bernoulli(p)`.
    SpikeSlab {
        spike_sd: f64,
        slab_sd: f64,
        inclusion_prob: f64,
    },
}

impl CoefPrior {
    /// Ridge penalty `(precision, mean)` used for the mode.
    fn map_penalty(self) -> (f64, f64) {
        match self {
            CoefPrior::Flat => (0.0, 0.0),
            CoefPrior::Normal { sd } => (1.0 / (sd * sd), 0.0),
            CoefPrior::SpikeSlab { slab_sd, .. } => (1.0 / (slab_sd * slab_sd), 0.0),
        }
    }

    fn is_selectable(self) -> bool {
        matches!(self, CoefPrior::SpikeSlab { .. })
    }

    fn log_density(self, b: f64, included: bool) -> f64 {
        match self {
            CoefPrior::Flat => 0.0,
            CoefPrior::Normal { sd } => normal_log_density(b, sd),
            CoefPrior::SpikeSlab {
                spike_sd, slab_sd, ..
            } => normal_log_density(b, if included { slab_sd } else { spike_sd }),
        }
    }
}

/// Log normal density without the `√(2π)` constant.
fn normal_log_density(x: f64, sd: f64) -> f64 {
    let z = x / sd;
    -0.5 * z * z - sd.ln()
}

#[derive(Debug, Clone, Copy)]
pub struct SamplerInput<'a> {
    /// Design rows of the fitting window.
    pub x: &'a DMatrix<f64>,
    pub y: &'a [f64],
    pub offset: &'a [f64],
    pub family: Family,
    pub priors: &'a [CoefPrior],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConvergenceReport {
    pub chains: usize,
    pub draws_per_chain: usize,
    /// Split-R̂ per coefficient.
    pub rhat: Vec<f64>,
    pub rhat_theta: Option<f64>,
    pub max_rhat: f64,
    /// Acceptance rate of the block move after burn-in.
    pub acceptance: f64,
    pub converged: bool,
}

#[derive(Debug, Clone)]
pub struct PosteriorDraws {
    /// Retained coefficient draws of all chains, chain-major.
    pub beta: Vec<DVector<f64>>,
    /// Negative binomial size per draw; empty for Poisson.
    pub theta: Vec<f64>,
    /// Posterior inclusion probability of each spike-and-slab coefficient.
    pub inclusion: Vec<Option<f64>>,
    pub convergence: ConvergenceReport,
    pub map: GlmFit,
}

impl PosteriorDraws {
    pub fn len(&self) -> usize {
        self.beta.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beta.is_empty()
    }

    /// Draws of a single coefficient.
    pub fn coefficient(&self, j: usize) -> Vec<f64> {
        self.beta.iter().map(|b| b[j]).collect()
    }
}

/// Hash `key` together with a base seed.
pub fn derive_seed<H: Hash + ?Sized>(base: u64, key: &H) -> u64 {
    let mut hasher = DefaultHasher::new();
    base.hash(&mut hasher);
    key.hash(&mut hasher);
    hasher.finish()
}

pub fn sample_posterior(
    input: &SamplerInput<'_>,
    config: &SamplerConfig,
    seed: u64,
    budget: &FitBudget,
) -> Result<PosteriorDraws, AppError> {
    if input.priors.len() != input.x.ncols() {
        return Err(AppError::numerical("one prior per coefficient is required"));
    }
    if config.chains == 0 || config.draws == 0 {
        return Err(AppError::config("sampler needs at least one chain and one draw"));
    }

    let penalty: Vec<(f64, f64)> = input.priors.iter().map(|p| p.map_penalty()).collect();
    let map = fit_glm(&GlmProblem {
        x: input.x,
        y: input.y,
        offset: input.offset,
        family: input.family,
        penalty: &penalty,
    })?;
    budget.check()?;
    let proposal = BlockProposal::new(&map, input.priors)?;

    let chains: Vec<ChainOutput> = (0..config.chains)
        .into_par_iter()
        .map(|c| run_chain(input, &map, &proposal, config, derive_seed(seed, &c), budget))
        .collect::<Result<Vec<_>, _>>()?;

    let p = input.x.ncols();
    let rhat: Vec<f64> = (0..p)
        .map(|j| {
            let per_chain: Vec<Vec<f64>> = chains
                .iter()
                .map(|c| c.beta.iter().map(|b| b[j]).collect())
                .collect();
            split_rhat(&per_chain)
        })
        .collect();
    let rhat_theta = (input.family == Family::NegativeBinomial).then(|| {
        let per_chain: Vec<Vec<f64>> = chains
            .iter()
            .map(|c| c.theta.iter().map(|t| t.ln()).collect())
            .collect();
        split_rhat(&per_chain)
    });
    let max_rhat = rhat
        .iter()
        .chain(rhat_theta.iter())
        .copied()
        .filter(|r| !r.is_nan())
        .fold(1.0_f64, f64::max);

    let (accepted, tried) = chains
        .iter()
        .fold((0usize, 0usize), |(a, t), c| (a + c.accepted, t + c.tried));
    let acceptance = if tried > 0 { accepted as f64 / tried as f64 } else { 1.0 };

    let total_draws: usize = chains.iter().map(|c| c.beta.len()).sum();
    let inclusion: Vec<Option<f64>> = (0..p)
        .map(|j| {
            input.priors[j].is_selectable().then(|| {
                chains.iter().map(|c| c.inclusion_sum[j]).sum::<f64>() / total_draws.max(1) as f64
            })
        })
        .collect();

    let convergence = ConvergenceReport {
        chains: config.chains,
        draws_per_chain: config.draws,
        rhat,
        rhat_theta,
        max_rhat,
        acceptance,
        converged: max_rhat <= config.rhat_threshold && acceptance >= MIN_ACCEPTANCE,
    };
    debug!(
        max_rhat,
        acceptance,
        converged = convergence.converged,
        "sampling finished"
    );

    let mut beta = Vec::with_capacity(total_draws);
    let mut theta = Vec::new();
    for chain in chains {
        beta.extend(chain.beta);
        theta.extend(chain.theta);
    }

    Ok(PosteriorDraws {
        beta,
        theta,
        inclusion,
        convergence,
        map,
    })
}

/// One simulated count series per posterior draw, over the rows of `x`.
pub fn posterior_predictive(
    x: &DMatrix<f64>,
    offset: &[f64],
    draws: &PosteriorDraws,
    seed: u64,
    budget: &FitBudget,
) -> Result<Vec<Vec<f64>>, AppError> {
    (0..draws.len())
        .into_par_iter()
        .map(|d| -> Result<Vec<f64>, AppError> {
            if d % BUDGET_CHECK_EVERY == 0 {
                budget.check()?;
            }
            let mut rng = StdRng::seed_from_u64(derive_seed(seed, &d));
            let mu = mean_response(x, &draws.beta[d], offset);
            let theta = draws.theta.get(d).copied();
            Ok(mu.iter().map(|&m| predictive_count(&mut rng, m, theta)).collect())
        })
        .collect()
}

/// A Poisson count, or a gamma-Poisson count when `theta` is set.
pub fn predictive_count<R: Rng + ?Sized>(rng: &mut R, mu: f64, theta: Option<f64>) -> f64 {
    let rate = match theta {
        Some(t) => match Gamma::new(t, mu / t) {
            Ok(g) => g.sample(rng),
            Err(_) => mu,
        },
        None => mu,
    };
    if !(rate.is_finite() && rate > 0.0) {
        return 0.0;
    }
    match Poisson::new(rate) {
        Ok(p) => p.sample(rng),
        Err(_) => rate.round(),
    }
}

/// Split-R̂ (Gelman et al.) over chains of equal length.
pub fn split_rhat(chains: &[Vec<f64>]) -> f64 {
    let Some(shortest) = chains.iter().map(Vec::len).min() else {
        return f64::NAN;
    };
    let half = shortest / 2;
    if half < 2 {
        return f64::NAN;
    }
    let sequences: Vec<&[f64]> = chains
        .iter()
        .flat_map(|c| [&c[..half], &c[half..2 * half]])
        .collect();
    let n = half as f64;
    let means: Vec<f64> = sequences.iter().map(|s| mean(s)).collect();
    let within = mean(
        &sequences
            .iter()
            .map(|s| std_dev(s).powi(2))
            .collect::<Vec<_>>(),
    );
    let between = n * std_dev(&means).powi(2);
    if !(within > 0.0) {
        return if between > 0.0 { f64::INFINITY } else { 1.0 };
    }
    let var_plus = (n - 1.0) / n * within + between / n;
    (var_plus / within).sqrt()
}

/// Proposal distributions for the block of always-included coefficients.
#[derive(Debug, Clone)]
struct BlockProposal {
    block: Vec<usize>,
    selectable: Vec<usize>,
    lower: DMatrix<f64>,
    precision: DMatrix<f64>,
    chi: ChiSquared<f64>,
}

impl BlockProposal {
    fn new(map: &GlmFit, priors: &[CoefPrior]) -> Result<Self, AppError> {
        let (selectable, block): (Vec<usize>, Vec<usize>) =
            (0..priors.len()).partition(|&j| priors[j].is_selectable());
        let k = block.len();
        let sub = DMatrix::from_fn(k, k, |a, b| map.covariance[(block[a], block[b])]);

        let (lower, precision) = match Cholesky::new(sub.clone()) {
            Some(chol) => (chol.l(), chol.inverse()),
            None => {
                let var = DVector::from_fn(k, |i, _| sub[(i, i)].max(1e-12));
                (
                    DMatrix::from_diagonal(&var.map(f64::sqrt)),
                    DMatrix::from_diagonal(&var.map(|v| 1.0 / v)),
                )
            }
        };
        let chi = ChiSquared::new(T_DOF)
            .map_err(|e| AppError::numerical(format!("invalid proposal: {e}")))?;
        Ok(Self {
            block,
            selectable,
            lower,
            precision,
            chi,
        })
    }

    fn gaussian_step(&self, rng: &mut StdRng) -> DVector<f64> {
        let z = DVector::from_fn(self.block.len(), |_, _| rng.sample::<f64, _>(StandardNormal));
        &self.lower * z
    }

    fn t_step(&self, rng: &mut StdRng) -> DVector<f64> {
        let w = self.chi.sample(rng).max(1e-12);
        self.gaussian_step(rng) * (T_DOF / w).sqrt()
    }

    /// Unnormalized log density of the independence proposal.
    fn t_log_density(&self, deviation: &DVector<f64>) -> f64 {
        let q = deviation.dot(&(&self.precision * deviation));
        -0.5 * (T_DOF + self.block.len() as f64) * (1.0 + q / T_DOF).ln()
    }
}

#[derive(Debug)]
struct ChainOutput {
    beta: Vec<DVector<f64>>,
    theta: Vec<f64>,
    inclusion_sum: Vec<f64>,
    accepted: usize,
    tried: usize,
}

fn log_lik(input: &SamplerInput<'_>, eta: &DVector<f64>, theta: Option<f64>) -> f64 {
    input
        .y
        .iter()
        .zip(eta.iter())
        .zip(input.offset)
        .map(|((&y, &e), &o)| {
            let mu = (e + o).clamp(-ETA_CLAMP, ETA_CLAMP).exp();
            match theta {
                Some(t) => nb_log_pmf(y, mu, t),
                None => poisson_log_pmf(y, mu),
            }
        })
        .sum()
}

/// Multiply the scale up or down depending on the window acceptance rate.
fn adapt(scale: &mut f64, accepted: usize, tried: usize, target: f64) {
    if tried == 0 {
        return;
    }
    let rate = accepted as f64 / tried as f64;
    *scale *= if rate > target { 1.25 } else { 0.8 };
    *scale = scale.clamp(1e-4, 1e2);
}

fn accept(rng: &mut StdRng, log_alpha: f64) -> bool {
    log_alpha >= 0.0 || rng.r#gen::<f64>().ln() < log_alpha
}

fn run_chain(
    input: &SamplerInput<'_>,
    map: &GlmFit,
    proposal: &BlockProposal,
    config: &SamplerConfig,
    seed: u64,
    budget: &FitBudget,
) -> Result<ChainOutput, AppError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let p = input.x.ncols();
    let negbin = input.family == Family::NegativeBinomial;

    // Overdispersed start around the mode.
    let mut beta = map.beta.clone();
    for j in 0..p {
        beta[j] += 0.5 * map.std_error(j) * rng.sample::<f64, _>(StandardNormal);
    }
    let mut ln_theta = map
        .theta
        .map_or(LN_THETA_PRIOR_MEAN, f64::ln)
        .clamp(LN_THETA_MIN, LN_THETA_MAX);
    let theta_of = |s: f64| negbin.then(|| s.exp());
    let mut included: Vec<bool> = input.priors.iter().map(|pr| pr.is_selectable()).collect();
    let mut eta = input.x * &beta;
    let mut ll = log_lik(input, &eta, theta_of(ln_theta));

    let mut rw_scale = 2.38 / (proposal.block.len().max(1) as f64).sqrt();
    let mut site_scale: Vec<f64> = (0..p).map(|j| map.std_error(j).max(1e-3)).collect();
    let mut theta_scale = 0.3;
    let (mut rw_acc, mut rw_try) = (0usize, 0usize);
    let mut site_acc = vec![0usize; p];
    let mut site_try = vec![0usize; p];
    let (mut theta_acc, mut theta_try) = (0usize, 0usize);

    let mut out = ChainOutput {
        beta: Vec::with_capacity(config.draws),
        theta: Vec::new(),
        inclusion_sum: vec![0.0; p],
        accepted: 0,
        tried: 0,
    };

    let total = config.burn_in + config.draws;
    for iter in 0..total {
        if iter % BUDGET_CHECK_EVERY == 0 {
            budget.check()?;
        }
        let burning = iter < config.burn_in;

        if !proposal.block.is_empty() {
            let independence = rng.r#gen::<f64>() < INDEPENDENCE_PROB;
            let step = if independence {
                proposal.t_step(&mut rng)
            } else {
                proposal.gaussian_step(&mut rng) * rw_scale
            };
            let mut candidate = beta.clone();
            for (a, &j) in proposal.block.iter().enumerate() {
                candidate[j] = if independence { map.beta[j] + step[a] } else { beta[j] + step[a] };
            }
            let cand_eta = input.x * &candidate;
            let cand_ll = log_lik(input, &cand_eta, theta_of(ln_theta));
            let prior_delta: f64 = proposal
                .block
                .iter()
                .map(|&j| {
                    input.priors[j].log_density(candidate[j], true)
                        - input.priors[j].log_density(beta[j], true)
                })
                .sum();
            let mut log_alpha = cand_ll - ll + prior_delta;
            if independence {
                let dev_of = |b: &DVector<f64>| {
                    DVector::from_iterator(
                        proposal.block.len(),
                        proposal.block.iter().map(|&j| b[j] - map.beta[j]),
                    )
                };
                log_alpha += proposal.t_log_density(&dev_of(&beta))
                    - proposal.t_log_density(&dev_of(&candidate));
            }
            let ok = cand_ll.is_finite() && accept(&mut rng, log_alpha);
            if ok {
                beta = candidate;
                eta = cand_eta;
                ll = cand_ll;
            }
            if burning {
                if !independence {
                    rw_try += 1;
                    rw_acc += usize::from(ok);
                }
            } else {
                out.tried += 1;
                out.accepted += usize::from(ok);
            }
        }

        for &j in &proposal.selectable {
            let CoefPrior::SpikeSlab {
                spike_sd,
                slab_sd,
                inclusion_prob,
            } = input.priors[j]
            else {
                continue;
            };
            let log_in = inclusion_prob.ln() + normal_log_density(beta[j], slab_sd);
            let log_out = (1.0 - inclusion_prob).ln() + normal_log_density(beta[j], spike_sd);
            let p_in = 1.0 / (1.0 + (log_out - log_in).exp());
            included[j] = rng.r#gen::<f64>() < p_in;
            if !burning {
                out.inclusion_sum[j] += p_in;
            }

            let prior_sd = if included[j] { slab_sd } else { spike_sd };
            let delta = site_scale[j].min(2.4 * prior_sd) * rng.sample::<f64, _>(StandardNormal);
            let cand_eta = &eta + input.x.column(j) * delta;
            let cand_ll = log_lik(input, &cand_eta, theta_of(ln_theta));
            let log_alpha = cand_ll - ll
                + input.priors[j].log_density(beta[j] + delta, included[j])
                - input.priors[j].log_density(beta[j], included[j]);
            let ok = cand_ll.is_finite() && accept(&mut rng, log_alpha);
            if ok {
                beta[j] += delta;
                eta = cand_eta;
                ll = cand_ll;
            }
            if burning {
                site_try[j] += 1;
                site_acc[j] += usize::from(ok);
            } else if proposal.block.is_empty() {
                out.tried += 1;
                out.accepted += usize::from(ok);
            }
        }

        if negbin {
            for _ in 0..THETA_STEPS {
                let cand = ln_theta + theta_scale * rng.sample::<f64, _>(StandardNormal);
                let ok = (LN_THETA_MIN..=LN_THETA_MAX).contains(&cand) && {
                    let cand_ll = log_lik(input, &eta, theta_of(cand));
                    let log_alpha = cand_ll - ll
                        + normal_log_density(cand - LN_THETA_PRIOR_MEAN, LN_THETA_PRIOR_SD)
                        - normal_log_density(ln_theta - LN_THETA_PRIOR_MEAN, LN_THETA_PRIOR_SD);
                    let ok = cand_ll.is_finite() && accept(&mut rng, log_alpha);
                    if ok {
                        ll = cand_ll;
                    }
                    ok
                };
                if ok {
                    ln_theta = cand;
                }
                if burning {
                    theta_try += 1;
                    theta_acc += usize::from(ok);
                }
            }
        }

        if burning && (iter + 1) % ADAPT_WINDOW == 0 {
            adapt(&mut rw_scale, rw_acc, rw_try, BLOCK_TARGET);
            for &j in &proposal.selectable {
                adapt(&mut site_scale[j], site_acc[j], site_try[j], SITE_TARGET);
                site_acc[j] = 0;
                site_try[j] = 0;
            }
            adapt(&mut theta_scale, theta_acc, theta_try, SITE_TARGET);
            (rw_acc, rw_try, theta_acc, theta_try) = (0, 0, 0, 0);
        }

        if !burning {
            out.beta.push(beta.clone());
            if negbin {
                out.theta.push(ln_theta.exp());
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::budget::CancelToken;

    fn simulated(n: usize, slopes: &[f64], seed: u64) -> (DMatrix<f64>, Vec<f64>) {
        simulated_counts(n, slopes, None, seed)
    }

    fn simulated_counts(
        n: usize,
        slopes: &[f64],
        theta: Option<f64>,
        seed: u64,
    ) -> (DMatrix<f64>, Vec<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let p = slopes.len() + 1;
        let x = DMatrix::from_fn(n, p, |i, j| match j {
            0 => 1.0,
            1 => (i as f64 * 0.37).sin() * 1.4,
            _ => (i as f64 * 1.91 + j as f64).cos() * 1.4,
        });
        let y = (0..n)
            .map(|i| {
                let eta = 2.5 + (0..slopes.len()).map(|k| slopes[k] * x[(i, k + 1)]).sum::<f64>();
                predictive_count(&mut rng, eta.exp(), theta)
            })
            .collect();
        (x, y)
    }

    fn small_config() -> SamplerConfig {
        SamplerConfig {
            burn_in: 600,
            draws: 600,
            chains: 2,
            ..SamplerConfig::default()
        }
    }

    #[test]
    fn poisson_posterior_centres_on_truth() {
        let (x, y) = simulated(80, &[0.4], 1);
        let offset = vec![0.0; 80];
        let priors = [CoefPrior::Flat, CoefPrior::Normal { sd: 2.0 }];
        let input = SamplerInput {
            x: &x,
            y: &y,
            offset: &offset,
            family: Family::Poisson,
            priors: &priors,
        };
        let draws = sample_posterior(&input, &small_config(), 7, &FitBudget::unlimited()).unwrap();
        assert_eq!(draws.len(), 1200);
        let slope = mean(&draws.coefficient(1));
        assert!((slope - 0.4).abs() < 0.1, "slope {slope}");
        assert!(draws.convergence.max_rhat < 1.1, "{:?}", draws.convergence);
        assert!(draws.convergence.acceptance > 0.05);
        assert!(draws.theta.is_empty());
    }

    fn negative_binomial_draws(y_theta: Option<f64>, seed: u64) -> PosteriorDraws {
        let (x, y) = simulated_counts(120, &[0.4], y_theta, seed);
        let offset = vec![0.0; 120];
        let priors = [CoefPrior::Flat, CoefPrior::Normal { sd: 2.0 }];
        let input = SamplerInput {
            x: &x,
            y: &y,
            offset: &offset,
            family: Family::NegativeBinomial,
            priors: &priors,
        };
        sample_posterior(&input, &small_config(), 7, &FitBudget::unlimited()).unwrap()
    }

    #[test]
    fn negative_binomial_posterior_recovers_overdispersion() {
        let draws = negative_binomial_draws(Some(4.0), 13);
        let slope = mean(&draws.coefficient(1));
        assert!((slope - 0.4).abs() < 0.15, "slope {slope}");
        assert!(draws.convergence.max_rhat < 1.1, "{:?}", draws.convergence);
        assert!(draws.convergence.rhat_theta.is_some());
        assert_eq!(draws.theta.len(), 1200);
        let ln_theta: Vec<f64> = draws.theta.iter().map(|t| t.ln()).collect();
        let centre = mean(&ln_theta).exp();
        assert!(centre > 1.5 && centre < 12.0, "theta {centre}");
    }

    #[test]
    fn negative_binomial_on_poisson_counts_stays_bounded() {
        let draws = negative_binomial_draws(None, 17);
        let slope = mean(&draws.coefficient(1));
        assert!((slope - 0.4).abs() < 0.1, "slope {slope}");
        assert!(draws.convergence.max_rhat < 1.1, "{:?}", draws.convergence);
        assert!(draws.convergence.converged);
        let (lo, hi) = (LN_THETA_MIN.exp(), LN_THETA_MAX.exp());
        assert!(draws.theta.iter().all(|&t| t >= lo && t <= hi));
        let ln_theta: Vec<f64> = draws.theta.iter().map(|t| t.ln()).collect();
        assert!(mean(&ln_theta) > 2.0, "ln theta {}", mean(&ln_theta));
    }

    #[test]
    fn spike_and_slab_separates_signal_from_noise() {
        let (x, y) = simulated(100, &[0.5, 0.0], 3);
        let offset = vec![0.0; 100];
        let ss = CoefPrior::SpikeSlab {
            spike_sd: 0.02,
            slab_sd: 1.0,
            inclusion_prob: 0.5,
        };
        let priors = [CoefPrior::Flat, ss, ss];
        let input = SamplerInput {
            x: &x,
            y: &y,
            offset: &offset,
            family: Family::Poisson,
            priors: &priors,
        };
        let draws = sample_posterior(&input, &small_config(), 11, &FitBudget::unlimited()).unwrap();
        assert!(draws.inclusion[0].is_none());
        assert!(draws.inclusion[1].unwrap() > 0.9);
        assert!(draws.inclusion[2].unwrap() < 0.5);
    }

    #[test]
    fn same_seed_same_draws() {
        let (x, y) = simulated(60, &[0.3], 5);
        let offset = vec![0.0; 60];
        let priors = [CoefPrior::Flat, CoefPrior::Normal { sd: 1.0 }];
        let input = SamplerInput {
            x: &x,
            y: &y,
            offset: &offset,
            family: Family::NegativeBinomial,
            priors: &priors,
        };
        let config = SamplerConfig {
            burn_in: 100,
            draws: 100,
            ..SamplerConfig::default()
        };
        let a = sample_posterior(&input, &config, 99, &FitBudget::unlimited()).unwrap();
        let b = sample_posterior(&input, &config, 99, &FitBudget::unlimited()).unwrap();
        assert_eq!(a.beta, b.beta);
        assert_eq!(a.theta, b.theta);
        assert_eq!(a.theta.len(), 200);
    }

    #[test]
    fn cancelled_budget_stops_sampling() {
        let (x, y) = simulated(40, &[0.3], 2);
        let offset = vec![0.0; 40];
        let priors = [CoefPrior::Flat, CoefPrior::Normal { sd: 1.0 }];
        let input = SamplerInput {
            x: &x,
            y: &y,
            offset: &offset,
            family: Family::Poisson,
            priors: &priors,
        };
        let token = CancelToken::new();
        token.cancel();
        let budget = FitBudget::new(token, None);
        let err = sample_posterior(&input, &small_config(), 1, &budget).unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
    }

    #[test]
    fn rhat_flags_disagreeing_chains() {
        let a: Vec<f64> = (0..200).map(|i| (i as f64 * 0.7).sin()).collect();
        let b: Vec<f64> = a.iter().map(|v| v + 5.0).collect();
        assert!(split_rhat(&[a.clone(), a.clone()]) < 1.05);
        assert!(split_rhat(&[a, b]) > 1.5);
    }

    #[test]
    fn predictive_counts_are_non_negative_integers() {
        let mut rng = StdRng::seed_from_u64(4);
        for _ in 0..200 {
            let c = predictive_count(&mut rng, 12.0, Some(3.0));
            assert!(c >= 0.0 && c.fract() == 0.0);
        }
        assert_eq!(predictive_count(&mut rng, 0.0, None), 0.0);
    }
}
