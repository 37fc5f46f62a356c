//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - parses CLI arguments and installs logging
//! - maps flags onto an `AnalysisConfig`
//! - runs the pipeline and prints reports
//! - writes optional exports

use std::time::Duration;

use clap::Parser;
use tracing::info;

use crate::cli::{AnalysisArgs, Cli, Command, RunArgs, ScreenArgs, SimulateArgs};
use crate::data::sample::{SyntheticSpec, synthetic_registry};
use crate::domain::{AnalysisConfig, PcaRetention, PeriodBoundaries, SeasonalWindow};
use crate::error::AppError;
use crate::fit::budget::CancelToken;
use crate::logging::{LogConfig, init_logging};

pub mod pipeline;

/// Entry point for the `impact` binary.
pub fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    init_logging(&LogConfig::from_verbosity(cli.verbose, cli.quiet))?;

    match cli.command {
        Command::Run(args) => handle_run(args),
        Command::Screen(args) => handle_screen(args),
        Command::Simulate(args) => handle_simulate(args),
    }
}

fn handle_run(args: RunArgs) -> Result<(), AppError> {
    let config = run_config_from_args(&args);
    let run = pipeline::run_file(&args.analysis.input, &config, &CancelToken::new())?;

    println!("{}", crate::report::format_run_summary(&run.output));

    if let Some(path) = &args.export {
        crate::io::export::write_summary_json(path, &run.output)?;
        info!(path = %path.display(), "wrote JSON summary");
    }
    if let Some(path) = &args.export_curves {
        crate::io::export::write_counterfactual_csv(path, &run.output, &run.ingest.registry)?;
        info!(path = %path.display(), "wrote counterfactual curves");
    }
    Ok(())
}

fn handle_screen(args: ScreenArgs) -> Result<(), AppError> {
    let config = analysis_config_from_args(&args.analysis);
    let (_, reports) = pipeline::screen_file(&args.analysis.input, &config)?;
    for report in reports.values() {
        println!("{}", crate::report::format_screening(report, args.top));
    }
    Ok(())
}

fn handle_simulate(args: SimulateArgs) -> Result<(), AppError> {
    let spec = SyntheticSpec {
        strata: args.strata.clone(),
        start: args.start,
        periodicity: args.periodicity,
        pre_periods: args.pre,
        post_periods: args.post,
        baseline: args.baseline,
        effect: args.effect,
        controls: args.controls,
        degenerate_control: args.degenerate,
        population: args.population,
        seed: args.seed,
        ..SyntheticSpec::default()
    };
    let (registry, config) = synthetic_registry(&spec)?;
    crate::io::export::write_long_csv_file(&args.output, &registry, &config)?;
    println!(
        "Wrote {} strata x {} periods to {} (intervention {}, outcome column `{}`, group column `{}`)",
        registry.len(),
        spec.len(),
        args.output.display(),
        config.boundaries.intervention,
        config.outcome_field,
        config.group_field
    );
    Ok(())
}

/// Input layout and model settings; everything else keeps its default.
pub fn analysis_config_from_args(args: &AnalysisArgs) -> AnalysisConfig {
    let boundaries = PeriodBoundaries {
        intervention: args.intervention,
        eval_start: args.eval_start.unwrap_or(args.intervention),
        eval_end: args.eval_end,
    };
    let mut config = AnalysisConfig::new(args.outcome.clone(), boundaries);
    config.group_field = args.group_field.clone();
    config.time_field = args.time_field.clone();
    config.denominator_field = args.denominator.clone();
    config.covariate_fields = args.covariates.clone();
    config.periodicity = args.periodicity;
    config.season_count = args
        .season_count
        .unwrap_or_else(|| args.periodicity.steps_per_year());
    config.log_covariates = !args.no_log;
    config.log_offset = args.log_offset;
    config.family = args.family;
    config
}

pub fn run_config_from_args(args: &RunArgs) -> AnalysisConfig {
    let mut config = analysis_config_from_args(&args.analysis);
    config.variants = args.variants.clone();
    config.fallback_order = args.fallback_order.clone();

    config.sampler.burn_in = args.burn_in;
    config.sampler.draws = args.draws;
    config.sampler.chains = args.chains;
    config.sampler.seed = args.seed;
    config.sampler.timeout = args.timeout_secs.map(Duration::from_secs);
    config.sampler.rhat_threshold = args.rhat_threshold;

    config.priors.slab_sd = args.slab_sd;
    config.priors.spike_sd = args.spike_sd;
    config.priors.inclusion_prob = args.inclusion_prob;

    config.pca.retention = match args.pca_components {
        Some(k) => PcaRetention::Fixed(k),
        None => PcaRetention::VarianceExplained {
            threshold: args.pca_variance,
            max_components: args.pca_max_components,
        },
    };
    config.pca.seasonal_window = match args.stl_seasonal_span {
        Some(span) => SeasonalWindow::Span(span),
        None => SeasonalWindow::Periodic,
    };
    config.pca.robust_iterations = args.stl_robust;

    config.its_level_change = !args.no_its_level;
    config.year_start_month = args.year_start_month;
    config.prevented_start = args.prevented_start;
    config.interval_level = args.interval_level;
    config
}
