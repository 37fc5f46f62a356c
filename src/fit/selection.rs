//! Preferred-variant selection.
//!
//! Consumers usually want one counterfactual per stratum. The preference is an
//! explicit ordered list (`AnalysisConfig::fallback_order`, default
//! `full → pca → time`); the first eligible variant wins:
//!
//! 1. `full` is eligible when it fitted without fallback and `best` retained at
//!    least one covariate (when `best` was not run, the first condition
//!    suffices; when `best` failed, `full` is not eligible)
//! 2. `best` and `pca` are eligible when they fitted without fallback
//! 3. `time` and `its` are eligible whenever they fitted

use std::collections::BTreeMap;

use serde::Serialize;

use crate::domain::ModelVariant;
use crate::fit::variants::FittedModel;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreferredVariant {
    pub variant: ModelVariant,
    /// Why earlier entries of the order were passed over.
    pub skipped: Vec<(ModelVariant, String)>,
}

/// Outcome of each variant that was run: the model, or the reason it failed.
pub type Candidates<'a> = BTreeMap<ModelVariant, Result<&'a FittedModel, &'a str>>;

pub fn select_preferred(order: &[ModelVariant], fitted: &Candidates<'_>) -> Option<PreferredVariant> {
    let mut skipped = Vec::new();
    for &variant in order {
        match eligibility(variant, fitted) {
            Ok(()) => return Some(PreferredVariant { variant, skipped }),
            Err(reason) => skipped.push((variant, reason)),
        }
    }
    None
}

fn eligibility(variant: ModelVariant, fitted: &Candidates<'_>) -> Result<(), String> {
    let model = match fitted.get(&variant) {
        None => return Err("not fitted".to_string()),
        Some(Err(reason)) => return Err(format!("fit failed: {reason}")),
        Some(Ok(model)) => model,
    };
    match variant {
        ModelVariant::Time | ModelVariant::Its => Ok(()),
        _ if model.is_fallback() => Err("fell back to the trend-only model".to_string()),
        ModelVariant::Full => match fitted.get(&ModelVariant::Best) {
            Some(Err(_)) => Err("covariate selection failed".to_string()),
            Some(Ok(best)) if best.is_fallback() || best.selected_covariates.is_empty() => {
                Err("selection retained no informative covariate".to_string())
            }
            _ => Ok(()),
        },
        ModelVariant::Best | ModelVariant::Pca => Ok(()),
    }
}
