//! Seasonal-trend decomposition by loess (STL).
//!
//! Follows Cleveland, Cleveland, McRae & Terpenning (1990):
//!
//! - inner loop: detrend, smooth each cycle-subseries (extended one period at
//!   both ends), low-pass filter the result, remove it, then smooth the
//!   deseasonalized series for the trend
//! - optional outer loop: bisquare robustness weights from the remainder
//!
//! Loess fits are evaluated at every point (no jump interpolation); the series
//! handled here are a few hundred points at most.

use crate::domain::SeasonalWindow;
use crate::error::AppError;

#[derive(Debug, Clone, PartialEq)]
pub struct StlDecomposition {
    pub trend: Vec<f64>,
    pub seasonal: Vec<f64>,
    pub remainder: Vec<f64>,
}

/// Smoothing parameters. Spans are in observations and always odd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StlParams {
    pub period: usize,
    pub seasonal_span: usize,
    pub seasonal_degree: usize,
    pub trend_span: usize,
    pub trend_degree: usize,
    pub lowpass_span: usize,
    pub lowpass_degree: usize,
    pub inner: usize,
    pub outer: usize,
    pub periodic: bool,
}

impl StlParams {
    /// Standard defaults for a series of length `n`.
    pub fn new(n: usize, period: usize, window: SeasonalWindow, robust_iterations: usize) -> Self {
        let period = period.max(2);
        let (seasonal_span, periodic) = match window {
            SeasonalWindow::Periodic => (10 * n + 1, true),
            SeasonalWindow::Span(s) => (next_odd(s.max(3) as f64), false),
        };
        let trend_span =
            next_odd((1.5 * period as f64 / (1.0 - 1.5 / seasonal_span as f64)).ceil()).max(3);
        Self {
            period,
            seasonal_span,
            seasonal_degree: 0,
            trend_span,
            trend_degree: 1,
            lowpass_span: next_odd(period as f64).max(3),
            lowpass_degree: 1,
            inner: if robust_iterations > 0 { 1 } else { 2 },
            outer: robust_iterations,
            periodic,
        }
    }
}

fn next_odd(x: f64) -> usize {
    let r = x.round().max(0.0) as usize;
    if r % 2 == 0 { r + 1 } else { r }
}

/// Decompose `y` with the given parameters.
pub fn stl(y: &[f64], params: &StlParams) -> Result<StlDecomposition, AppError> {
    let n = y.len();
    let np = params.period;
    if np < 2 {
        return Err(AppError::numerical("STL period must be at least 2"));
    }
    if n <= 2 * np {
        return Err(AppError::numerical(format!(
            "STL needs more than two periods of data (n={n}, period={np})"
        )));
    }
    if y.iter().any(|v| !v.is_finite()) {
        return Err(AppError::numerical("STL input contains non-finite values"));
    }

    let mut trend = vec![0.0; n];
    let mut seasonal = vec![0.0; n];
    let mut robustness = vec![1.0; n];

    for k in 0..=params.outer {
        let weights = if k > 0 { Some(robustness.as_slice()) } else { None };
        inner_loop(y, params, weights, &mut seasonal, &mut trend);
        if k < params.outer {
            robustness = robustness_weights(y, &seasonal, &trend);
        }
    }

    if params.periodic {
        // Replace the seasonal component by its cycle-position means.
        for j in 0..np {
            let idx: Vec<usize> = (j..n).step_by(np).collect();
            let m = idx.iter().map(|&i| seasonal[i]).sum::<f64>() / idx.len() as f64;
            for i in idx {
                seasonal[i] = m;
            }
        }
    }

    let remainder = (0..n).map(|i| y[i] - seasonal[i] - trend[i]).collect();
    Ok(StlDecomposition {
        trend,
        seasonal,
        remainder,
    })
}

fn inner_loop(
    y: &[f64],
    params: &StlParams,
    weights: Option<&[f64]>,
    seasonal: &mut [f64],
    trend: &mut [f64],
) {
    let n = y.len();
    let np = params.period;

    for _ in 0..params.inner {
        let detrended: Vec<f64> = (0..n).map(|i| y[i] - trend[i]).collect();
        let cycle = cycle_subseries(&detrended, params, weights);
        let low = low_pass(&cycle, np);
        let low = loess_smooth(&low, params.lowpass_span, params.lowpass_degree, None);
        for i in 0..n {
            seasonal[i] = cycle[np + i] - low[i];
        }
        let deseasonalized: Vec<f64> = (0..n).map(|i| y[i] - seasonal[i]).collect();
        let smoothed = loess_smooth(&deseasonalized, params.trend_span, params.trend_degree, weights);
        trend.copy_from_slice(&smoothed);
    }
}

/// Smooth each cycle-subseries and extrapolate one point at both ends.
///
/// Returns a series of length `n + 2·period` whose element `period + i` is the
/// smoothed value at position `i`.
fn cycle_subseries(x: &[f64], params: &StlParams, weights: Option<&[f64]>) -> Vec<f64> {
    let n = x.len();
    let np = params.period;
    let mut out = vec![0.0; n + 2 * np];

    for j in 0..np {
        let sub: Vec<f64> = (j..n).step_by(np).map(|i| x[i]).collect();
        let sub_w: Option<Vec<f64>> = weights.map(|w| (j..n).step_by(np).map(|i| w[i]).collect());
        let k = sub.len();
        let span = params.seasonal_span;
        let deg = params.seasonal_degree;

        let mut smoothed = vec![0.0; k + 2];
        let inner = loess_smooth(&sub, span, deg, sub_w.as_deref());
        smoothed[1..=k].copy_from_slice(&inner);

        // Positions are 1-based inside the subseries; 0 and k+1 are extrapolated.
        let right = span.min(k);
        smoothed[0] = loess_estimate(&sub, span, deg, 0.0, 1, right, sub_w.as_deref())
            .unwrap_or(smoothed[1]);
        let left = if k >= span { k - span + 1 } else { 1 };
        smoothed[k + 1] = loess_estimate(&sub, span, deg, (k + 1) as f64, left, k, sub_w.as_deref())
            .unwrap_or(smoothed[k]);

        for (m, &v) in smoothed.iter().enumerate() {
            let idx = m * np + j;
            if idx < out.len() {
                out[idx] = v;
            }
        }
    }
    out
}

/// Moving averages of length `period`, `period` and 3.
fn low_pass(x: &[f64], period: usize) -> Vec<f64> {
    let a = moving_average(x, period);
    let b = moving_average(&a, period);
    moving_average(&b, 3)
}

fn moving_average(x: &[f64], len: usize) -> Vec<f64> {
    if x.len() < len {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(x.len() - len + 1);
    let mut sum: f64 = x[..len].iter().sum();
    out.push(sum / len as f64);
    for i in len..x.len() {
        sum += x[i] - x[i - len];
        out.push(sum / len as f64);
    }
    out
}

/// Loess smooth evaluated at every position of `y`.
fn loess_smooth(y: &[f64], span: usize, degree: usize, weights: Option<&[f64]>) -> Vec<f64> {
    let n = y.len();
    if n < 2 {
        return y.to_vec();
    }
    let mut out = vec![0.0; n];
    if span >= n {
        for (i, slot) in out.iter_mut().enumerate() {
            let xs = (i + 1) as f64;
            *slot = loess_estimate(y, span, degree, xs, 1, n, weights).unwrap_or(y[i]);
        }
        return out;
    }

    let half = span.div_ceil(2);
    let (mut left, mut right) = (1usize, span);
    for (i, slot) in out.iter_mut().enumerate() {
        let pos = i + 1;
        if pos > half && right != n {
            left += 1;
            right += 1;
        }
        *slot = loess_estimate(y, span, degree, pos as f64, left, right, weights).unwrap_or(y[i]);
    }
    out
}

/// Local (degree 0 or 1) tricube-weighted fit at `xs` over the 1-based
/// neighbourhood `[left, right]`. `None` when every weight vanishes.
fn loess_estimate(
    y: &[f64],
    span: usize,
    degree: usize,
    xs: f64,
    left: usize,
    right: usize,
    weights: Option<&[f64]>,
) -> Option<f64> {
    let n = y.len();
    let range = n as f64 - 1.0;
    let mut h = (xs - left as f64).max(right as f64 - xs);
    if span > n {
        h += ((span - n) / 2) as f64;
    }
    let h9 = 0.999 * h;
    let h1 = 0.001 * h;

    let mut w = vec![0.0; right - left + 1];
    let mut total = 0.0;
    for (slot, j) in w.iter_mut().zip(left..=right) {
        let r = (j as f64 - xs).abs();
        if r <= h9 {
            let mut wj = if r <= h1 {
                1.0
            } else {
                let u = r / h;
                (1.0 - u * u * u).powi(3)
            };
            if let Some(rw) = weights {
                wj *= rw[j - 1];
            }
            *slot = wj;
            total += wj;
        }
    }
    if total <= 0.0 {
        return None;
    }
    for wj in w.iter_mut() {
        *wj /= total;
    }

    if h > 0.0 && degree > 0 {
        let a: f64 = w.iter().zip(left..=right).map(|(wj, j)| wj * j as f64).sum();
        let c: f64 = w
            .iter()
            .zip(left..=right)
            .map(|(wj, j)| wj * (j as f64 - a).powi(2))
            .sum();
        if c.sqrt() > 0.001 * range {
            let b = (xs - a) / c;
            for (wj, j) in w.iter_mut().zip(left..=right) {
                *wj *= b * (j as f64 - a) + 1.0;
            }
        }
    }

    Some(w.iter().zip(left..=right).map(|(wj, j)| wj * y[j - 1]).sum())
}

fn robustness_weights(y: &[f64], seasonal: &[f64], trend: &[f64]) -> Vec<f64> {
    let r: Vec<f64> = (0..y.len())
        .map(|i| (y[i] - seasonal[i] - trend[i]).abs())
        .collect();
    let mut sorted = r.clone();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    let median = if n % 2 == 1 {
        sorted[n / 2]
    } else {
        0.5 * (sorted[n / 2 - 1] + sorted[n / 2])
    };
    let cmad = 6.0 * median;
    let c9 = 0.999 * cmad;
    let c1 = 0.001 * cmad;
    r.iter()
        .map(|&ri| {
            if ri <= c1 {
                1.0
            } else if ri <= c9 {
                let u = ri / cmad;
                (1.0 - u * u).powi(2)
            } else {
                0.0
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seasonal_linear(n: usize, period: usize) -> (Vec<f64>, Vec<f64>) {
        let trend: Vec<f64> = (0..n).map(|i| 10.0 + 0.1 * i as f64).collect();
        let y = (0..n)
            .map(|i| {
                let phase = 2.0 * std::f64::consts::PI * (i % period) as f64 / period as f64;
                trend[i] + 2.0 * phase.sin()
            })
            .collect();
        (y, trend)
    }

    #[test]
    fn periodic_stl_recovers_linear_trend() {
        let (y, trend) = seasonal_linear(96, 12);
        let params = StlParams::new(y.len(), 12, SeasonalWindow::Periodic, 0);
        let d = stl(&y, &params).unwrap();
        // Skip the ends where loess extrapolates.
        for i in 12..84 {
            assert!((d.trend[i] - trend[i]).abs() < 0.2, "i={i}: {} vs {}", d.trend[i], trend[i]);
        }
        for i in 0..96 {
            let sum = d.trend[i] + d.seasonal[i] + d.remainder[i];
            assert!((sum - y[i]).abs() < 1e-9);
        }
    }

    #[test]
    fn periodic_seasonal_repeats_exactly() {
        let (y, _) = seasonal_linear(60, 12);
        let params = StlParams::new(y.len(), 12, SeasonalWindow::Periodic, 0);
        let d = stl(&y, &params).unwrap();
        for i in 12..60 {
            assert!((d.seasonal[i] - d.seasonal[i - 12]).abs() < 1e-12);
        }
    }

    #[test]
    fn constant_series_has_flat_trend() {
        let y = vec![5.0; 48];
        let params = StlParams::new(y.len(), 12, SeasonalWindow::Span(7), 2);
        let d = stl(&y, &params).unwrap();
        assert!(d.trend.iter().all(|t| (t - 5.0).abs() < 1e-9));
        assert!(d.seasonal.iter().all(|s| s.abs() < 1e-9));
    }

    #[test]
    fn short_series_is_rejected() {
        let y = vec![1.0; 20];
        let params = StlParams::new(y.len(), 12, SeasonalWindow::Periodic, 0);
        assert!(stl(&y, &params).is_err());
    }

    #[test]
    fn default_trend_span_matches_reference() {
        // 1.5 * 12 / (1 - 1.5 / 7) = 22.9 -> 23
        let params = StlParams::new(120, 12, SeasonalWindow::Span(7), 0);
        assert_eq!(params.trend_span, 23);
        assert_eq!(params.lowpass_span, 13);
    }
}
