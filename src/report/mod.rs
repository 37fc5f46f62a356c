//! Reporting utilities: cross-variant tables and formatted terminal output.

pub mod format;

pub use format::*;

use crate::domain::{IntervalEstimate, ModelVariant};
use crate::engine::{AnalysisOutput, VariantOutcome};

/// One (stratum, variant) line of the cross-model comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonRow {
    pub stratum: String,
    pub variant: ModelVariant,
    pub preferred: bool,
    /// Evaluation-window rate ratio; `None` when the fit failed.
    pub rate_ratio: Option<IntervalEstimate>,
    pub prevented: Option<IntervalEstimate>,
    pub aic: Option<f64>,
    /// Fallback, convergence warning or failure reason.
    pub note: String,
}

/// Rows for every stratum and variant, in stratum then report order.
pub fn comparison_rows(output: &AnalysisOutput) -> Vec<ComparisonRow> {
    let mut rows = Vec::new();
    for (name, result) in &output.strata {
        let preferred = result.preferred.as_ref().map(|p| p.variant);
        for (&variant, outcome) in &result.variants {
            let row = match outcome {
                VariantOutcome::Fitted { model, impact } => {
                    let note = match &model.fallback {
                        Some(fb) => format!("fell back to {}: {}", fb.used, fb.reason),
                        None => model.warnings.join("; "),
                    };
                    ComparisonRow {
                        stratum: name.clone(),
                        variant,
                        preferred: preferred == Some(variant),
                        rate_ratio: Some(impact.eval_rate_ratio),
                        prevented: Some(impact.prevented_total),
                        aic: Some(model.aic),
                        note,
                    }
                }
                VariantOutcome::Failed { reason } => ComparisonRow {
                    stratum: name.clone(),
                    variant,
                    preferred: false,
                    rate_ratio: None,
                    prevented: None,
                    aic: None,
                    note: format!("failed: {reason}"),
                },
            };
            rows.push(row);
        }
    }
    rows
}
