//! Formatted terminal output.
//!
//! Formatting lives here so the fitting code stays free of presentation details
//! and output changes stay localized.

use crate::domain::{AnalysisConfig, IntervalEstimate};
use crate::engine::AnalysisOutput;
use crate::fit::screen::{ScreenEntry, ScreeningReport};
use crate::report::comparison_rows;

/// Header, cross-variant comparison, preferred-variant detail and warnings.
pub fn format_run_summary(output: &AnalysisOutput) -> String {
    let config = &output.config;
    let mut out = String::new();

    out.push_str("=== impact - counterfactual impact estimates ===\n");
    out.push_str(&format_settings(config, output.strata.len()));
    out.push('\n');
    out.push_str(&format_comparison(output));
    out.push('\n');
    out.push_str(&format_preferred(output));
    out
}

fn format_settings(config: &AnalysisConfig, strata: usize) -> String {
    let b = &config.boundaries;
    let variants: Vec<&str> = config.variants.iter().map(|v| v.name()).collect();
    let eval_end = b
        .eval_end
        .map(|d| d.to_string())
        .unwrap_or_else(|| "last observation".to_string());
    let mut out = String::new();
    out.push_str(&format!(
        "Strata: {strata} | family: {:?} | variants: {}\n",
        config.family,
        variants.join(", ")
    ));
    out.push_str(&format!(
        "Intervention: {} | evaluation: {} .. {eval_end} | interval: {:.0}%\n",
        b.intervention,
        b.eval_start,
        config.interval_level * 100.0
    ));
    out.push_str(&format!(
        "Sampler: {} chains x {} draws (burn-in {}), seed {}\n",
        config.sampler.chains, config.sampler.draws, config.sampler.burn_in, config.sampler.seed
    ));
    out
}

/// Evaluation-window rate ratios for every variant; `*` marks the preferred one.
pub fn format_comparison(output: &AnalysisOutput) -> String {
    let mut out = String::new();
    out.push_str("Rate ratios over the evaluation window (observed / counterfactual):\n");
    out.push_str(
        format!(
            "  {:<16} {:<6} {:>24} {:>28} {:>10}  {}",
            "stratum", "model", "rate ratio", "prevented", "aic", "note"
        )
        .trim_end(),
    );
    out.push('\n');
    out.push_str(
        format!(
            "  {:-<16} {:-<6} {:-<24} {:-<28} {:-<10}  {:-<4}",
            "", "", "", "", "", ""
        )
        .trim_end(),
    );
    out.push('\n');

    for row in comparison_rows(output) {
        let chosen = if row.preferred { "*" } else { " " };
        let rr = row
            .rate_ratio
            .map(|e| fmt_interval(e, 3))
            .unwrap_or_else(|| "-".to_string());
        let prevented = row
            .prevented
            .map(|e| fmt_interval(e, 0))
            .unwrap_or_else(|| "-".to_string());
        let aic = row.aic.map(|a| format!("{a:.1}")).unwrap_or_else(|| "-".to_string());
        out.push_str(
            format!(
                "{chosen} {:<16} {:<6} {rr:>24} {prevented:>28} {aic:>10}  {}",
                truncate(&row.stratum, 16),
                row.variant.name(),
                row.note
            )
            .trim_end(),
        );
        out.push('\n');
    }
    out
}

/// Annual aggregates and cumulative prevented cases of each stratum's preferred fit.
pub fn format_preferred(output: &AnalysisOutput) -> String {
    let mut out = String::new();
    for (name, result) in &output.strata {
        let Some((model, impact)) = result.preferred_fit() else {
            out.push_str(&format!("{name}: no eligible model\n\n"));
            continue;
        };
        out.push_str(&format!("{name} (preferred: {})\n", model.variant));
        if let Some(p) = &result.preferred {
            for (variant, reason) in &p.skipped {
                out.push_str(&format!("  (skipped {variant}) {reason}\n"));
            }
        }
        if !model.selected_covariates.is_empty() {
            out.push_str(&format!("  covariates: {}\n", model.selected_covariates.join(", ")));
        }
        for excluded in &result.excluded_covariates {
            out.push_str(&format!("  (excluded {}) {}\n", excluded.name, excluded.reason));
        }
        if let Some(last) = impact.cumulative_prevented.estimates.last() {
            out.push_str(&format!(
                "  cumulative prevented {} .. {}: {}\n",
                impact.cumulative_prevented.start_date,
                last.date,
                fmt_interval(last.estimate, 0)
            ));
        }
        out.push_str(&format!(
            "  evaluation window: rate ratio {} | prevented {}\n",
            fmt_interval(impact.eval_rate_ratio, 3),
            fmt_interval(impact.prevented_total, 0)
        ));
        out.push_str(&format!(
            "  {:<6} {:>7} {:>10} {:>26} {:>24}\n",
            "year", "periods", "observed", "expected", "rate ratio"
        ));
        for year in &impact.annual {
            out.push_str(&format!(
                "  {:<6} {:>7} {:>10.0} {:>26} {:>24}\n",
                year.year,
                year.periods,
                year.observed,
                fmt_interval(year.counterfactual, 0),
                fmt_interval(year.rate_ratio, 3)
            ));
        }
        out.push('\n');
    }
    out
}

/// Screening ranking: fitted candidates by AIC, then excluded ones.
pub fn format_screening(report: &ScreeningReport, top_n: usize) -> String {
    let mut out = String::new();
    out.push_str(&format!("Covariate screening for {}:\n", report.stratum));
    out.push_str(&format!(
        "  {:>4} {:<24} {:>10} {:>24} {:>10}\n",
        "rank", "covariate", "aic", "rate ratio", "theta"
    ));
    let mut rank = 0;
    for entry in &report.entries {
        match entry {
            ScreenEntry::Fitted {
                covariate,
                rate_ratio,
                aic,
                theta,
            } => {
                rank += 1;
                if rank > top_n {
                    continue;
                }
                let theta = theta.map(|t| format!("{t:.2}")).unwrap_or_else(|| "-".to_string());
                out.push_str(&format!(
                    "  {rank:>4} {:<24} {aic:>10.1} {:>24} {theta:>10}\n",
                    truncate(covariate, 24),
                    fmt_interval(*rate_ratio, 3)
                ));
            }
            ScreenEntry::Excluded { covariate, reason } => {
                out.push_str(&format!("     - {:<24} excluded: {reason}\n", truncate(covariate, 24)));
            }
        }
    }
    out
}

fn fmt_interval(e: IntervalEstimate, decimals: usize) -> String {
    format!(
        "{:.*} [{:.*}, {:.*}]",
        decimals, e.median, decimals, e.lower, decimals, e.upper
    )
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('.');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::sample::{SyntheticSpec, synthetic_registry};
    use crate::domain::{ModelVariant, SamplerConfig};
    use crate::engine::run_analysis;
    use crate::fit::budget::CancelToken;

    fn small_output() -> AnalysisOutput {
        let spec = SyntheticSpec {
            strata: vec!["only".to_string()],
            degenerate_control: true,
            ..SyntheticSpec::default()
        };
        let (registry, mut config) = synthetic_registry(&spec).unwrap();
        config.variants = vec![ModelVariant::Time, ModelVariant::Its];
        config.sampler = SamplerConfig {
            burn_in: 100,
            draws: 100,
            chains: 1,
            ..SamplerConfig::default()
        };
        run_analysis(&registry, &config, &CancelToken::new()).unwrap()
    }

    #[test]
    fn comparison_marks_preferred_variant() {
        let output = small_output();
        let text = format_comparison(&output);
        let starred: Vec<&str> = text.lines().filter(|l| l.starts_with('*')).collect();
        assert_eq!(starred.len(), 1);
        assert!(starred[0].contains("time"));
        assert!(text.contains("its"));
    }

    #[test]
    fn summary_lists_excluded_covariates_and_years() {
        let text = format_run_summary(&small_output());
        assert!(text.contains("(excluded zero_control)"));
        assert!(text.contains("cumulative prevented"));
        assert!(text.contains("2009"));
    }

    #[test]
    fn screening_ranks_then_lists_exclusions() {
        let output = small_output();
        let report = output.screening.get("only").unwrap();
        let text = format_screening(report, 10);
        let ranked = text.find("   1 ").unwrap();
        let excluded = text.find("excluded").unwrap();
        assert!(ranked < excluded);
    }

    #[test]
    fn truncate_marks_cut_names() {
        assert_eq!(truncate("abcdef", 4), "abc.");
        assert_eq!(truncate("abc", 4), "abc");
    }
}
