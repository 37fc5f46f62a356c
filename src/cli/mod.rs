//! Command-line parsing for the `impact` binary.
//!
//! Argument parsing and command dispatch stay separate from the modeling code:
//! every flag here maps onto a field of `AnalysisConfig` or `SyntheticSpec`.

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};

use crate::domain::{Family, ModelVariant, Periodicity};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(
    name = "impact",
    version,
    about = "Counterfactual impact estimates for vaccine evaluations from count time series"
)]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fit every enabled model variant for every stratum and report impact estimates.
    Run(RunArgs),
    /// Rank candidate covariates by single-covariate fits on the pre-intervention window.
    Screen(ScreenArgs),
    /// Write a seeded synthetic dataset in the long CSV layout.
    Simulate(SimulateArgs),
}

/// Input layout and model settings shared by `run` and `screen`.
#[derive(Debug, Args, Clone)]
pub struct AnalysisArgs {
    /// Long-format CSV: one row per (stratum, timestamp).
    #[arg(short, long, value_name = "CSV")]
    pub input: PathBuf,

    /// Column holding the stratum name.
    #[arg(long, default_value = "age_group")]
    pub group_field: String,

    /// Column holding the timestamp.
    #[arg(long, default_value = "date")]
    pub time_field: String,

    /// Column holding the outcome count.
    #[arg(short, long)]
    pub outcome: String,

    /// Column holding the population denominator.
    #[arg(long)]
    pub denominator: Option<String>,

    /// Candidate covariate columns (comma separated). Default: every other numeric column.
    #[arg(long, value_delimiter = ',')]
    pub covariates: Vec<String>,

    #[arg(long, value_enum, default_value_t = Periodicity::Monthly)]
    pub periodicity: Periodicity,

    /// Seasonal dummies per year; defaults to the periods per year.
    #[arg(long)]
    pub season_count: Option<usize>,

    /// Use covariates on their original scale instead of `ln(x + offset)`.
    #[arg(long)]
    pub no_log: bool,

    #[arg(long, default_value_t = 0.5)]
    pub log_offset: f64,

    #[arg(long, value_enum, default_value_t = Family::NegativeBinomial)]
    pub family: Family,

    /// First period affected by the intervention (YYYY-MM-DD).
    #[arg(long)]
    pub intervention: NaiveDate,

    /// Start of the evaluation window. Defaults to the intervention date.
    #[arg(long)]
    pub eval_start: Option<NaiveDate>,

    /// End of the evaluation window (inclusive). Defaults to the last observation.
    #[arg(long)]
    pub eval_end: Option<NaiveDate>,
}

#[derive(Debug, Args, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub analysis: AnalysisArgs,

    /// Model variants to fit (comma separated).
    #[arg(long, value_enum, value_delimiter = ',', default_values_t = ModelVariant::ALL)]
    pub variants: Vec<ModelVariant>,

    /// Preference order for each stratum's headline variant.
    #[arg(long, value_enum, value_delimiter = ',', default_values_t = [ModelVariant::Full, ModelVariant::Pca, ModelVariant::Time])]
    pub fallback_order: Vec<ModelVariant>,

    #[arg(long, default_value_t = 2_000)]
    pub burn_in: usize,

    /// Retained draws per chain.
    #[arg(long, default_value_t = 2_000)]
    pub draws: usize,

    #[arg(long, default_value_t = 2)]
    pub chains: usize,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Wall-clock limit per (stratum, variant) fit, in seconds.
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    #[arg(long, default_value_t = 1.1)]
    pub rhat_threshold: f64,

    /// Prior sd of an included covariate coefficient.
    #[arg(long, default_value_t = 1.0)]
    pub slab_sd: f64,

    /// Prior sd of an excluded covariate coefficient.
    #[arg(long, default_value_t = 0.02)]
    pub spike_sd: f64,

    /// Prior inclusion probability of each covariate.
    #[arg(long, default_value_t = 0.5)]
    pub inclusion_prob: f64,

    /// Keep exactly this many principal components (overrides the variance rule).
    #[arg(long)]
    pub pca_components: Option<usize>,

    /// Cumulative explained variance to retain.
    #[arg(long, default_value_t = 0.9)]
    pub pca_variance: f64,

    /// Upper bound of components under the variance rule.
    #[arg(long, default_value_t = 3)]
    pub pca_max_components: usize,

    /// Odd STL seasonal span; periodic seasonality when omitted.
    #[arg(long)]
    pub stl_seasonal_span: Option<usize>,

    /// Robustness iterations of STL.
    #[arg(long, default_value_t = 0)]
    pub stl_robust: usize,

    /// Fit the ITS model without a level change at the intervention.
    #[arg(long)]
    pub no_its_level: bool,

    /// First month (1-12) of the aggregation year.
    #[arg(long, default_value_t = 1)]
    pub year_start_month: u32,

    /// Start of the cumulative prevented-cases sum. Defaults to the intervention date.
    #[arg(long)]
    pub prevented_start: Option<NaiveDate>,

    /// Central probability of the reported intervals.
    #[arg(long, default_value_t = 0.95)]
    pub interval_level: f64,

    /// Write the full results (configuration included) as JSON.
    #[arg(long, value_name = "JSON")]
    pub export: Option<PathBuf>,

    /// Write per-period counterfactual curves as CSV.
    #[arg(long, value_name = "CSV")]
    pub export_curves: Option<PathBuf>,
}

#[derive(Debug, Args, Clone)]
pub struct ScreenArgs {
    #[command(flatten)]
    pub analysis: AnalysisArgs,

    /// Show the top-N candidates per stratum.
    #[arg(long, default_value_t = 20)]
    pub top: usize,
}

#[derive(Debug, Args, Clone)]
pub struct SimulateArgs {
    /// Destination CSV.
    #[arg(short, long, value_name = "CSV")]
    pub output: PathBuf,

    /// Stratum names (comma separated).
    #[arg(long, value_delimiter = ',', default_values_t = ["under_5".to_string(), "over_65".to_string()])]
    pub strata: Vec<String>,

    /// First timestamp of the series.
    #[arg(long, default_value = "2003-01-01")]
    pub start: NaiveDate,

    #[arg(long, value_enum, default_value_t = Periodicity::Monthly)]
    pub periodicity: Periodicity,

    /// Periods before the intervention.
    #[arg(long, default_value_t = 60)]
    pub pre: usize,

    /// Periods from the intervention on.
    #[arg(long, default_value_t = 24)]
    pub post: usize,

    /// Mean outcome count per period before the intervention.
    #[arg(long, default_value_t = 60.0)]
    pub baseline: f64,

    /// Rate ratio applied to the outcome after the intervention.
    #[arg(long, default_value_t = 0.5)]
    pub effect: f64,

    /// Number of control covariates.
    #[arg(long, default_value_t = 3)]
    pub controls: usize,

    /// Add an all-zero control column.
    #[arg(long)]
    pub degenerate: bool,

    /// Constant population denominator.
    #[arg(long)]
    pub population: Option<f64>,

    #[arg(long, default_value_t = 7)]
    pub seed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_variant_lists() {
        let cli = Cli::parse_from([
            "impact",
            "-vv",
            "run",
            "--input",
            "data.csv",
            "--outcome",
            "J12_18",
            "--intervention",
            "2010-01-01",
            "--variants",
            "time,its",
        ]);
        assert_eq!(cli.verbose, 2);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.variants, [ModelVariant::Time, ModelVariant::Its]);
        assert_eq!(args.fallback_order.len(), 3);
        assert_eq!(args.analysis.family, Family::NegativeBinomial);
    }

    #[test]
    fn simulate_defaults() {
        let cli = Cli::parse_from(["impact", "simulate", "--output", "out.csv"]);
        let Command::Simulate(args) = cli.command else {
            panic!("expected simulate");
        };
        assert_eq!(args.strata, ["under_5", "over_65"]);
        assert_eq!((args.pre, args.post), (60, 24));
    }
}
