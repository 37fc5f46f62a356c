//! Principal components of standardized covariate trends.

use nalgebra::{DMatrix, SymmetricEigen};
use serde::Serialize;

use crate::domain::PcaRetention;
use crate::error::AppError;
use crate::math::stats::{mean, std_dev};

/// Trends whose standard deviation falls below this are treated as constant.
const MIN_SD: f64 = 1e-10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrincipalComponent {
    pub name: String,
    #[serde(skip)]
    pub scores: Vec<f64>,
    pub explained_ratio: f64,
    pub loadings: Vec<(String, f64)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PcaResult {
    pub components: Vec<PrincipalComponent>,
    /// Explained variance ratio of every component, retained or not.
    pub explained_ratios: Vec<f64>,
}

/// Project the columns onto their leading principal components.
///
/// Columns are centred and scaled to unit variance first, so the decomposition
/// is of the correlation matrix. Each eigenvector is sign-normalized so that its
/// largest-magnitude loading is positive.
pub fn principal_components(
    columns: &[(String, Vec<f64>)],
    retention: PcaRetention,
) -> Result<PcaResult, AppError> {
    let Some((_, first)) = columns.first() else {
        return Err(AppError::numerical("PCA needs at least one column"));
    };
    let n = first.len();
    if n < 3 {
        return Err(AppError::numerical("PCA needs at least three observations"));
    }
    let p = columns.len();

    let mut z = DMatrix::<f64>::zeros(n, p);
    for (j, (name, values)) in columns.iter().enumerate() {
        if values.len() != n {
            return Err(AppError::numerical(format!("column '{name}' has the wrong length")));
        }
        let m = mean(values);
        let sd = std_dev(values);
        if !(sd.is_finite() && sd > MIN_SD) {
            return Err(AppError::degenerate(name.clone(), "trend component is constant"));
        }
        for i in 0..n {
            z[(i, j)] = (values[i] - m) / sd;
        }
    }

    let corr = (z.transpose() * &z) / (n as f64 - 1.0);
    let eigen = SymmetricEigen::new(corr);

    let mut order: Vec<usize> = (0..p).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));
    let values: Vec<f64> = order.iter().map(|&k| eigen.eigenvalues[k].max(0.0)).collect();
    let total: f64 = values.iter().sum();
    if !(total.is_finite() && total > 0.0) {
        return Err(AppError::numerical("covariate trends have no variance"));
    }
    let explained_ratios: Vec<f64> = values.iter().map(|v| v / total).collect();

    let keep = retained_count(&explained_ratios, retention);
    let mut components = Vec::with_capacity(keep);
    for (rank, &k) in order.iter().take(keep).enumerate() {
        let mut v = eigen.eigenvectors.column(k).clone_owned();
        let pivot = v
            .iter()
            .copied()
            .fold(0.0_f64, |acc, x| if x.abs() > acc.abs() { x } else { acc });
        if pivot < 0.0 {
            v = -v;
        }
        let scores = &z * &v;
        components.push(PrincipalComponent {
            name: format!("pc{}", rank + 1),
            scores: scores.iter().copied().collect(),
            explained_ratio: explained_ratios[rank],
            loadings: columns
                .iter()
                .zip(v.iter())
                .map(|((name, _), &l)| (name.clone(), l))
                .collect(),
        });
    }

    Ok(PcaResult {
        components,
        explained_ratios,
    })
}

fn retained_count(ratios: &[f64], retention: PcaRetention) -> usize {
    let available = ratios.len();
    match retention {
        PcaRetention::Fixed(k) => k.clamp(1, available),
        PcaRetention::VarianceExplained {
            threshold,
            max_components,
        } => {
            let mut cumulative = 0.0;
            let mut count = 0;
            for r in ratios {
                cumulative += r;
                count += 1;
                // Tolerance so an exact 1.0 threshold is reachable.
                if cumulative >= threshold - 1e-12 {
                    break;
                }
            }
            count.clamp(1, max_components.min(available))
        }
    }
}
