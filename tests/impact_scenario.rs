//! End-to-end scenarios on seeded synthetic data.

use chrono::NaiveDate;
use impact_curves::data::registry::{Stratum, TimeIndexedSeries};
use impact_curves::data::sample::{SyntheticSpec, expected_counts, synthetic_registry};
use impact_curves::domain::{
    AnalysisConfig, PcaRetention, PeriodBoundaries, Periodicity, SamplerConfig, ModelVariant,
};
use impact_curves::engine::{AnalysisOutput, VariantOutcome, run_analysis};
use impact_curves::error::AppError;
use impact_curves::fit::budget::CancelToken;
use impact_curves::reduce::reduce_covariates;

fn quick(config: &mut AnalysisConfig) {
    config.sampler = SamplerConfig {
        burn_in: 500,
        draws: 500,
        chains: 2,
        seed: 11,
        ..SamplerConfig::default()
    };
}

fn one_stratum(controls: usize, degenerate: bool) -> SyntheticSpec {
    SyntheticSpec {
        strata: vec!["under_5".to_string()],
        controls,
        degenerate_control: degenerate,
        ..SyntheticSpec::default()
    }
}

fn run(spec: &SyntheticSpec, variants: &[ModelVariant]) -> (AnalysisOutput, AnalysisConfig) {
    let (registry, mut config) = synthetic_registry(spec).unwrap();
    quick(&mut config);
    config.variants = variants.to_vec();
    let output = run_analysis(&registry, &config, &CancelToken::new()).unwrap();
    (output, config)
}

fn fitted(output: &AnalysisOutput, variant: ModelVariant) -> &VariantOutcome {
    output.strata["under_5"].outcome(variant).unwrap()
}

#[test]
fn halved_rate_is_recovered_with_a_tracking_control() {
    // 60 pre + 24 post months, the rate halves at the intervention and one
    // control follows the same latent process.
    let spec = one_stratum(1, false);
    let (output, _) = run(&spec, &[ModelVariant::Full, ModelVariant::Time]);
    let result = &output.strata["under_5"];
    assert_eq!(result.preferred.as_ref().unwrap().variant, ModelVariant::Full);

    let (model, impact) = fitted(&output, ModelVariant::Full).fitted().unwrap();
    assert!(!model.is_fallback());
    assert!(model.convergence.as_ref().unwrap().max_rhat < 1.2);

    let rr = impact.eval_rate_ratio;
    assert!((rr.median - 0.5).abs() < 0.1, "rate ratio {rr:?}");

    let (registry, _) = synthetic_registry(&spec).unwrap();
    let observed = registry.get("under_5").unwrap().outcome();
    let expected = &expected_counts(&spec).unwrap()["under_5"];
    let truth: f64 = (60..84).map(|t| expected[t] - observed[t]).sum();

    let prevented = impact.prevented_total;
    assert!(
        (prevented.median - truth).abs() < 0.15 * truth,
        "prevented {prevented:?}, truth {truth}"
    );
    assert!(prevented.contains(truth), "prevented {prevented:?}, truth {truth}");
}

#[test]
fn counterfactual_matches_the_fitting_window() {
    let spec = one_stratum(2, false);
    let (output, _) = run(&spec, &[ModelVariant::Full, ModelVariant::Time]);
    let (registry, _) = synthetic_registry(&spec).unwrap();
    let observed = registry.get("under_5").unwrap().outcome();
    let pre_observed: f64 = observed[..60].iter().sum();

    for variant in [ModelVariant::Full, ModelVariant::Time] {
        let (model, _) = fitted(&output, variant).fitted().unwrap();
        let pre_cf: f64 = model.counterfactual.median[..60].iter().sum();
        let bias = (pre_cf - pre_observed).abs() / pre_observed;
        assert!(bias < 0.05, "{variant}: relative pre-period bias {bias}");
    }
}

#[test]
fn identical_inputs_give_identical_outputs() {
    let spec = one_stratum(2, true);
    let variants = [ModelVariant::Best, ModelVariant::Time, ModelVariant::Its];
    let (a, _) = run(&spec, &variants);
    let (b, _) = run(&spec, &variants);
    assert_eq!(
        serde_json::to_string(&a).unwrap(),
        serde_json::to_string(&b).unwrap()
    );
    assert_eq!(a.strata, b.strata);
}

#[test]
fn cumulative_prevented_adds_single_period_terms_per_draw() {
    let spec = one_stratum(1, false);
    let (output, _) = run(&spec, &[ModelVariant::Time]);
    let (registry, _) = synthetic_registry(&spec).unwrap();
    let observed = registry.get("under_5").unwrap().outcome();

    let (model, impact) = fitted(&output, ModelVariant::Time).fitted().unwrap();
    let draws = model.counterfactual.draws.as_ref().unwrap();
    let paths = impact.cumulative_prevented.paths.as_ref().unwrap();
    assert_eq!(draws.len(), paths.len());
    for (draw, path) in draws.iter().zip(paths).take(50) {
        for k in 1..path.len() {
            let t = 60 + k;
            let step = path[k] - path[k - 1];
            assert!((step - (draw[t] - observed[t])).abs() < 1e-9);
        }
    }
}

#[test]
fn only_degenerate_covariates_fall_back_to_time() {
    let spec = one_stratum(0, true);
    let (output, _) = run(
        &spec,
        &[ModelVariant::Full, ModelVariant::Best, ModelVariant::Pca, ModelVariant::Time],
    );
    let result = &output.strata["under_5"];
    let (time, time_impact) = fitted(&output, ModelVariant::Time).fitted().unwrap();

    for variant in [ModelVariant::Full, ModelVariant::Best, ModelVariant::Pca] {
        let (model, impact) = fitted(&output, variant).fitted().unwrap();
        let fallback = model.fallback.as_ref().unwrap();
        assert_eq!(fallback.used, ModelVariant::Time);
        assert_eq!(model.counterfactual, time.counterfactual);
        assert_eq!(impact.prevented_total, time_impact.prevented_total);
    }
    assert_eq!(result.preferred.as_ref().unwrap().variant, ModelVariant::Time);
    assert!(result.excluded_covariates.iter().any(|e| e.name == "zero_control"));
}

#[test]
fn prevented_cases_before_the_start_are_zero() {
    let spec = one_stratum(1, false);
    let (output, _) = run(&spec, &[ModelVariant::Its]);
    let (_, impact) = fitted(&output, ModelVariant::Its).fitted().unwrap();

    let before = NaiveDate::from_ymd_opt(2005, 6, 1).unwrap();
    let zero = impact.prevented_at(before).unwrap();
    assert_eq!((zero.median, zero.lower, zero.upper), (0.0, 0.0, 0.0));

    let after = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
    assert!(matches!(
        impact.prevented_at(after),
        Err(AppError::InvalidAggregation(_))
    ));
}

#[test]
fn proportional_covariates_reduce_to_one_component() {
    let mut dates = Vec::new();
    let mut d = NaiveDate::from_ymd_opt(2004, 1, 1).unwrap();
    for _ in 0..72 {
        dates.push(d);
        d = Periodicity::Monthly.next(d).unwrap();
    }
    let base: Vec<f64> = (0..72)
        .map(|t| 100.0 + 20.0 * (t as f64 * std::f64::consts::TAU / 12.0).sin() + t as f64)
        .collect();
    let covariates: Vec<TimeIndexedSeries> = [1.0, 2.5, 7.0, 0.3]
        .iter()
        .enumerate()
        .map(|(k, scale)| {
            TimeIndexedSeries::new(
                format!("c{k}"),
                dates.clone(),
                base.iter().map(|v| v * scale).collect(),
            )
        })
        .collect();
    let stratum = Stratum::from_series(
        "s",
        Periodicity::Monthly,
        TimeIndexedSeries::new("y", dates.clone(), vec![10.0; 72]),
        None,
        covariates,
    )
    .unwrap();

    let mut config = AnalysisConfig::new(
        "y",
        PeriodBoundaries {
            intervention: dates[48],
            eval_start: dates[48],
            eval_end: None,
        },
    );
    config.log_covariates = false;
    config.pca.retention = PcaRetention::VarianceExplained {
        threshold: 0.9,
        max_components: 3,
    };

    let reduced = reduce_covariates(&stratum, &config).unwrap();
    assert!(reduced.decomposed);
    assert_eq!(reduced.components.len(), 1);
    assert!(reduced.explained_ratios[0] >= 0.99);
}

#[test]
fn boundary_errors_are_fatal() {
    let spec = one_stratum(1, false);
    let (registry, mut config) = synthetic_registry(&spec).unwrap();
    config.boundaries.eval_end = Some(NaiveDate::from_ymd_opt(2030, 1, 1).unwrap());
    let err = run_analysis(&registry, &config, &CancelToken::new()).unwrap_err();
    assert_eq!(err.exit_code(), 2);
}
