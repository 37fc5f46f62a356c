//! Small summary-statistics helpers shared by the sampler and the aggregator.

use statrs::distribution::{ContinuousCDF, Normal};

use crate::domain::IntervalEstimate;

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n − 1 denominator).
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let ss: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
    (ss / (values.len() as f64 - 1.0)).sqrt()
}

/// Quantile of an ascending slice by linear interpolation between order statistics.
pub fn quantile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let p = p.clamp(0.0, 1.0);
    let h = (sorted.len() as f64 - 1.0) * p;
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let frac = h - lo as f64;
    // Interpolating an infinite bound would give NaN.
    if sorted[hi].is_infinite() || sorted[lo].is_infinite() {
        return if frac < 0.5 { sorted[lo] } else { sorted[hi] };
    }
    sorted[lo] + frac * (sorted[hi] - sorted[lo])
}

/// Median and central interval of unsorted draws. NaN draws are ignored.
pub fn summarize(values: &[f64], lower_p: f64, upper_p: f64) -> IntervalEstimate {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    sorted.sort_by(f64::total_cmp);
    IntervalEstimate::new(
        quantile_sorted(&sorted, 0.5),
        quantile_sorted(&sorted, lower_p),
        quantile_sorted(&sorted, upper_p),
    )
}

/// `observed / counterfactual` with the conventions used for count ratios.
pub fn count_ratio(observed: f64, counterfactual: f64) -> f64 {
    if counterfactual > 0.0 {
        observed / counterfactual
    } else if observed == 0.0 {
        1.0
    } else {
        f64::INFINITY
    }
}

/// Standard normal quantile function.
pub fn normal_quantile(p: f64) -> f64 {
    match Normal::new(0.0, 1.0) {
        Ok(n) => n.inverse_cdf(p),
        Err(_) => f64::NAN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantiles_interpolate() {
        let v = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(quantile_sorted(&v, 0.5), 3.0);
        assert!((quantile_sorted(&v, 0.25) - 2.0).abs() < 1e-12);
        assert!((quantile_sorted(&v, 0.1) - 1.4).abs() < 1e-12);
    }

    #[test]
    fn summarize_ignores_order() {
        let s = summarize(&[5.0, 1.0, 4.0, 2.0, 3.0], 0.0, 1.0);
        assert_eq!(s.median, 3.0);
        assert_eq!(s.lower, 1.0);
        assert_eq!(s.upper, 5.0);
    }

    #[test]
    fn normal_quantile_matches_tables() {
        assert!((normal_quantile(0.975) - 1.959964).abs() < 1e-5);
        assert!((normal_quantile(0.5)).abs() < 1e-9);
        assert!((normal_quantile(0.01) + 2.326348).abs() < 1e-5);
    }

    #[test]
    fn count_ratio_conventions() {
        assert_eq!(count_ratio(5.0, 10.0), 0.5);
        assert_eq!(count_ratio(0.0, 0.0), 1.0);
        assert!(count_ratio(3.0, 0.0).is_infinite());
    }
}
