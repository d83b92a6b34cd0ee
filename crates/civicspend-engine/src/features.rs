//! Feature engineering over monthly aggregates.
//!
//! Produces the single feature contract both detectors read. Vendor-level
//! statistics use the vendor's whole history within the run; rolling ones use
//! the same trailing three-month window as aggregation.

use std::f64::consts::PI;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, StringArray, UInt32Array};
use arrow::record_batch::RecordBatch;
use civicspend_core::MonthlyAggregate;
use civicspend_core::features::{FEATURE_COLUMNS, feature_table_schema};
use civicspend_core::stats::{
    EPSILON, finite_or_zero, mean, median, ols_slope, percentile_ranks, rolling, sample_std,
};
use civicspend_store::DuckStore;
use tracing::info;

use crate::EngineError;
use crate::aggregate::ROLLING_WINDOW;

pub const FEATURE_COUNT: usize = FEATURE_COLUMNS.len();

/// One (vendor, month) with its engineered feature vector.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub aggregate: MonthlyAggregate,
    pub vendor_name: String,
    pub log_obligation: f64,
    pub log_award_count: f64,
    pub log_avg_size: f64,
    pub log_rolling_3m_mean: f64,
    pub log_rolling_3m_mad: f64,
    pub mom_pct_change: f64,
    pub month_sin: f64,
    pub month_cos: f64,
    pub vendor_tenure: f64,
    pub deviation_from_median: f64,
    pub cv: f64,
    pub size_concentration: f64,
    pub rolling_trend: f64,
    pub volatility: f64,
    pub percentile_rank: f64,
    pub z_score_vendor: f64,
}

impl FeatureRow {
    /// Feature values in [`FEATURE_COLUMNS`] order.
    pub fn vector(&self) -> [f64; FEATURE_COUNT] {
        [
            self.log_obligation,
            self.log_award_count,
            self.log_avg_size,
            self.log_rolling_3m_mean,
            self.log_rolling_3m_mad,
            self.mom_pct_change,
            self.month_sin,
            self.month_cos,
            self.vendor_tenure,
            self.deviation_from_median,
            self.cv,
            self.size_concentration,
            self.rolling_trend,
            self.volatility,
            self.percentile_rank,
            self.z_score_vendor,
        ]
    }
}

/// Engineered rows for a run, ordered by vendor then month.
#[derive(Debug, Clone, Default)]
pub struct FeatureTable {
    pub run_id: String,
    pub rows: Vec<FeatureRow>,
}

impl FeatureTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Row-major feature matrix, every value finite.
    pub fn matrix(&self) -> Vec<Vec<f64>> {
        self.rows.iter().map(|r| r.vector().to_vec()).collect()
    }

    /// Rows belonging to one vendor, in month order.
    pub fn vendor_rows<'t>(&'t self, vendor_id: &'t str) -> impl Iterator<Item = &'t FeatureRow> + 't {
        self.rows
            .iter()
            .filter(move |r| r.aggregate.vendor_id == vendor_id)
    }

    /// Convert to an Arrow batch with the fixed feature-table schema.
    pub fn to_record_batch(&self) -> Result<RecordBatch, EngineError> {
        let str_col = |f: fn(&FeatureRow) -> String| -> ArrayRef {
            Arc::new(StringArray::from(self.rows.iter().map(f).collect::<Vec<_>>()))
        };
        let f64_col = |f: &dyn Fn(&FeatureRow) -> f64| -> ArrayRef {
            Arc::new(Float64Array::from(self.rows.iter().map(f).collect::<Vec<_>>()))
        };

        let mut columns: Vec<ArrayRef> = vec![
            str_col(|r: &FeatureRow| r.aggregate.vendor_id.clone()),
            str_col(|r: &FeatureRow| r.vendor_name.clone()),
            str_col(|r: &FeatureRow| r.aggregate.year_month.to_string()),
            f64_col(&|r: &FeatureRow| r.aggregate.obligation_sum),
            Arc::new(UInt32Array::from(
                self.rows
                    .iter()
                    .map(|r| r.aggregate.award_count)
                    .collect::<Vec<_>>(),
            )),
            f64_col(&|r: &FeatureRow| r.aggregate.avg_award_size),
            f64_col(&|r: &FeatureRow| r.aggregate.rolling_3m_mean),
            f64_col(&|r: &FeatureRow| r.aggregate.rolling_3m_mad),
        ];
        for i in 0..FEATURE_COUNT {
            columns.push(f64_col(&|r: &FeatureRow| r.vector()[i]));
        }

        Ok(RecordBatch::try_new(Arc::new(feature_table_schema()), columns)?)
    }
}

/// Sign-preserving `log1p`, so de-obligations do not produce NaN.
fn signed_log1p(x: f64) -> f64 {
    x.signum() * x.abs().ln_1p()
}

pub struct FeatureEngineer<'a> {
    store: &'a DuckStore,
}

impl<'a> FeatureEngineer<'a> {
    pub fn new(store: &'a DuckStore) -> Self {
        Self { store }
    }

    /// Build the feature table for a run from its stored monthly rows.
    /// An unaggregated run yields an empty table.
    pub fn engineer_features(&self, run_id: &str) -> Result<FeatureTable, EngineError> {
        let monthly = self.store.monthly_rows(run_id)?;

        let mut rows = Vec::with_capacity(monthly.len());
        let mut start = 0;
        while start < monthly.len() {
            let vendor_id = &monthly[start].0.vendor_id;
            let end = monthly[start..]
                .iter()
                .position(|(m, _)| &m.vendor_id != vendor_id)
                .map_or(monthly.len(), |off| start + off);
            rows.extend(vendor_features(&monthly[start..end]));
            start = end;
        }

        info!(run_id, rows = rows.len(), "engineered features");
        Ok(FeatureTable {
            run_id: run_id.to_string(),
            rows,
        })
    }
}

/// Features for one vendor's month-ordered rows.
fn vendor_features(series: &[(MonthlyAggregate, String)]) -> Vec<FeatureRow> {
    let sums: Vec<f64> = series.iter().map(|(m, _)| m.obligation_sum).collect();

    let v_median = median(&sums);
    let v_mean = mean(&sums);
    let v_std = sample_std(&sums);
    let cv = v_std / (v_mean + EPSILON);
    let trend = rolling(&sums, ROLLING_WINDOW, ols_slope);
    let volatility = rolling(&sums, ROLLING_WINDOW, sample_std);
    let ranks = percentile_ranks(&sums);

    series
        .iter()
        .enumerate()
        .map(|(i, (agg, name))| {
            let x = agg.obligation_sum;
            let mom = if i == 0 {
                0.0
            } else {
                (x - sums[i - 1]) / sums[i - 1]
            };
            let angle = 2.0 * PI * f64::from(agg.year_month.month()) / 12.0;

            FeatureRow {
                aggregate: agg.clone(),
                vendor_name: name.clone(),
                log_obligation: finite_or_zero(signed_log1p(x)),
                log_award_count: finite_or_zero(signed_log1p(f64::from(agg.award_count))),
                log_avg_size: finite_or_zero(signed_log1p(agg.avg_award_size)),
                log_rolling_3m_mean: finite_or_zero(signed_log1p(agg.rolling_3m_mean)),
                log_rolling_3m_mad: finite_or_zero(signed_log1p(agg.rolling_3m_mad)),
                mom_pct_change: finite_or_zero(mom),
                month_sin: angle.sin(),
                month_cos: angle.cos(),
                vendor_tenure: (i + 1) as f64,
                deviation_from_median: finite_or_zero((x - v_median) / (v_std + EPSILON)),
                cv: finite_or_zero(cv),
                size_concentration: finite_or_zero(agg.avg_award_size / (x + EPSILON)),
                rolling_trend: finite_or_zero(trend[i]),
                volatility: finite_or_zero(volatility[i]),
                percentile_rank: ranks[i],
                z_score_vendor: finite_or_zero((x - v_mean) / (v_std + EPSILON)),
            }
        })
        .collect()
}
