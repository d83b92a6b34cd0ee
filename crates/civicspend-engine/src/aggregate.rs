//! Monthly vendor aggregation.

use std::collections::BTreeMap;

use civicspend_core::stats::{mean, median, rolling};
use civicspend_core::{MonthlyAggregate, YearMonth};
use civicspend_store::DuckStore;
use tracing::{info, warn};

use crate::EngineError;

/// Trailing window width for the rolling aggregates.
pub const ROLLING_WINDOW: usize = 3;

/// Buckets resolved awards into (vendor, month) totals with rolling stats.
pub struct TimeSeriesAggregator<'a> {
    store: &'a DuckStore,
}

impl<'a> TimeSeriesAggregator<'a> {
    pub fn new(store: &'a DuckStore) -> Self {
        Self { store }
    }

    /// Aggregate a run's mapped awards and upsert one row per (vendor, month).
    ///
    /// Awards without a parseable action date are left out. Re-running
    /// replaces rows rather than duplicating them. Returns the row count.
    pub fn aggregate_run(&self, run_id: &str) -> Result<usize, EngineError> {
        let awards = self.store.mapped_awards(run_id)?;

        // (vendor, month) → (sum, count); BTreeMap keeps months ascending per vendor.
        let mut buckets: BTreeMap<(String, YearMonth), (f64, u32)> = BTreeMap::new();
        let mut undated = 0usize;
        for (vendor_id, award) in awards {
            let Some(month) = award.month() else {
                undated += 1;
                continue;
            };
            let entry = buckets.entry((vendor_id, month)).or_insert((0.0, 0));
            entry.0 += award.obligation_amount;
            entry.1 += 1;
        }
        if undated > 0 {
            warn!(run_id, undated, "awards without a usable action date excluded");
        }

        let mut by_vendor: BTreeMap<String, Vec<(YearMonth, f64, u32)>> = BTreeMap::new();
        for ((vendor_id, month), (sum, count)) in buckets {
            by_vendor.entry(vendor_id).or_default().push((month, sum, count));
        }

        let mut rows = Vec::new();
        for (vendor_id, series) in &by_vendor {
            rows.extend(vendor_rows(run_id, vendor_id, series));
        }

        let written = self.store.upsert_monthly(&rows)?;
        info!(run_id, vendors = by_vendor.len(), rows = written, "aggregated monthly spend");
        Ok(written)
    }
}

/// Rows for one vendor's month-ordered series.
fn vendor_rows(
    run_id: &str,
    vendor_id: &str,
    series: &[(YearMonth, f64, u32)],
) -> Vec<MonthlyAggregate> {
    let sums: Vec<f64> = series.iter().map(|(_, sum, _)| *sum).collect();
    let rolling_mean = rolling(&sums, ROLLING_WINDOW, mean);
    let rolling_mad = rolling_mad_residual(&sums, ROLLING_WINDOW);

    series
        .iter()
        .enumerate()
        .map(|(i, &(year_month, sum, count))| MonthlyAggregate {
            run_id: run_id.to_string(),
            vendor_id: vendor_id.to_string(),
            year_month,
            obligation_sum: sum,
            award_count: count,
            avg_award_size: sum / count.max(1) as f64,
            rolling_3m_mean: rolling_mean[i],
            rolling_3m_mad: rolling_mad[i],
        })
        .collect()
}

/// Rolling median of |x − rolling median(x)|, both over trailing windows.
pub fn rolling_mad_residual(values: &[f64], width: usize) -> Vec<f64> {
    let centre = rolling(values, width, median);
    let residuals: Vec<f64> = values
        .iter()
        .zip(&centre)
        .map(|(x, m)| (x - m).abs())
        .collect();
    rolling(&residuals, width, median)
}
