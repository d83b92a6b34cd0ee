//! Median/MAD modified z-score detector.

use civicspend_core::stats::{mad, median};
use civicspend_core::{Anomaly, DetectorKind, RobustConfig};
use civicspend_store::DuckStore;
use tracing::{debug, info};

use super::Detector;
use crate::EngineError;
use crate::features::{FeatureEngineer, FeatureRow, FeatureTable};

/// Scales MAD to be consistent with the standard deviation under normality.
pub const MODIFIED_Z_FACTOR: f64 = 0.6745;

/// `0.6745 · (x − median) / MAD` for each value.
///
/// A series with zero MAD scores all zeros, however large its values.
pub fn modified_z_scores(values: &[f64]) -> Vec<f64> {
    let m = median(values);
    let spread = mad(values);
    if spread == 0.0 {
        return vec![0.0; values.len()];
    }
    values
        .iter()
        .map(|x| MODIFIED_Z_FACTOR * (x - m) / spread)
        .collect()
}

pub struct RobustStatisticalDetector<'a> {
    store: &'a DuckStore,
    config: RobustConfig,
}

impl<'a> RobustStatisticalDetector<'a> {
    pub fn new(store: &'a DuckStore, config: RobustConfig) -> Self {
        Self { store, config }
    }

    /// Engineer features for a run and flag months whose |z| exceeds the
    /// threshold. Vendors with fewer than `min_months` months are skipped.
    pub fn detect_run(&self, run_id: &str) -> Result<Vec<Anomaly>, EngineError> {
        let table = FeatureEngineer::new(self.store).engineer_features(run_id)?;
        self.detect(&table)
    }

    fn detect_vendor(&self, run_id: &str, rows: &[&FeatureRow], out: &mut Vec<Anomaly>) {
        let sums: Vec<f64> = rows.iter().map(|r| r.aggregate.obligation_sum).collect();
        for (row, z) in rows.iter().zip(modified_z_scores(&sums)) {
            if z.abs() > self.config.z_threshold {
                out.push(Anomaly {
                    run_id: run_id.to_string(),
                    vendor_id: row.aggregate.vendor_id.clone(),
                    vendor_name: Some(row.vendor_name.clone()),
                    year_month: row.aggregate.year_month,
                    detector: DetectorKind::Statistical,
                    severity: self.config.severity.classify(z.abs()),
                    score: z,
                    value: row.aggregate.obligation_sum,
                    award_count: row.aggregate.award_count,
                });
            }
        }
    }
}

impl Detector for RobustStatisticalDetector<'_> {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Statistical
    }

    fn detect(&self, table: &FeatureTable) -> Result<Vec<Anomaly>, EngineError> {
        let mut anomalies = Vec::new();
        let mut skipped = 0usize;

        // Rows arrive grouped by vendor, months ascending.
        let mut start = 0;
        while start < table.rows.len() {
            let vendor_id = &table.rows[start].aggregate.vendor_id;
            let group: Vec<&FeatureRow> = table.rows[start..]
                .iter()
                .take_while(|r| &r.aggregate.vendor_id == vendor_id)
                .collect();
            start += group.len();

            if group.len() < self.config.min_months {
                debug!(vendor_id = %vendor_id, months = group.len(), "too few months, skipped");
                skipped += 1;
                continue;
            }
            self.detect_vendor(&table.run_id, &group, &mut anomalies);
        }

        info!(
            run_id = %table.run_id,
            anomalies = anomalies.len(),
            skipped_vendors = skipped,
            "statistical detection complete"
        );
        Ok(anomalies)
    }
}
