//! Descriptive and robust statistics over `f64` slices.
//!
//! Conventions follow the usual dataframe defaults: medians average the two
//! middle values, standard deviations are sample (n − 1) deviations, and
//! rolling windows are trailing with a minimum size of one.

use std::cmp::Ordering;

/// Additive guard for ratios whose denominator may be zero.
pub const EPSILON: f64 = 1e-6;

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Median; 0 for an empty slice.
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Median absolute deviation from the median (unscaled).
pub fn mad(values: &[f64]) -> f64 {
    let m = median(values);
    let deviations: Vec<f64> = values.iter().map(|x| (x - m).abs()).collect();
    median(&deviations)
}

/// Sample standard deviation; 0 when fewer than two values exist.
pub fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let ss: f64 = values.iter().map(|x| (x - m).powi(2)).sum();
    (ss / (values.len() - 1) as f64).sqrt()
}

/// Population standard deviation (n denominator); 0 for an empty slice.
pub fn population_std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|x| (x - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Ordinary least-squares slope of `values` against positions `0..n`.
///
/// 0 when fewer than two points are available.
pub fn ols_slope(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let x_mean = (n - 1) as f64 / 2.0;
    let y_mean = mean(values);
    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - x_mean;
        num += dx * (y - y_mean);
        den += dx * dx;
    }
    num / den
}

/// Apply `f` to each trailing window of at most `width` values.
///
/// Output has one entry per input value; the first windows are shorter
/// (minimum one value).
pub fn rolling<F>(values: &[f64], width: usize, f: F) -> Vec<f64>
where
    F: Fn(&[f64]) -> f64,
{
    let width = width.max(1);
    (0..values.len())
        .map(|i| {
            let start = (i + 1).saturating_sub(width);
            f(&values[start..=i])
        })
        .collect()
}

/// Percentile rank of each value within the slice, ties averaged.
///
/// Ranks are 1-based and divided by the count, so the largest value is 1.0.
pub fn percentile_ranks(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0; n];
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && values[order[j + 1]].total_cmp(&values[order[i]]) == Ordering::Equal {
            j += 1;
        }
        // Positions i..=j share the average of ranks i+1..=j+1.
        let avg_rank = (i + j + 2) as f64 / 2.0;
        for &idx in &order[i..=j] {
            ranks[idx] = avg_rank / n as f64;
        }
        i = j + 1;
    }
    ranks
}

/// Percentile with linear interpolation between closest ranks.
///
/// `q` is on a 0–100 scale. 0 for an empty slice.
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let pos = (q.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Replace NaN and ±inf with zero.
pub fn finite_or_zero(x: f64) -> f64 {
    if x.is_finite() { x } else { 0.0 }
}
