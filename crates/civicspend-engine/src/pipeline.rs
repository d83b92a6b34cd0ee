//! Stage orchestration for one run: resolve → aggregate → detect.
//!
//! Each stage completes before the next starts. Detector output is written
//! back to the store so evidence can be assembled in a later invocation.

use civicspend_core::{Anomaly, DetectorKind, PipelineConfig, RunStatus};
use civicspend_store::{DuckStore, StoreError};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::detect::{Detector, MlDetector, RobustStatisticalDetector};
use crate::evidence::{AnomalyReport, EvidenceAssembler};
use crate::features::FeatureEngineer;
use crate::{EngineError, TimeSeriesAggregator, VendorResolver};

/// Which detectors a detection pass runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectMethod {
    Statistical,
    Ml,
    Both,
}

impl DetectMethod {
    pub fn includes(&self, kind: DetectorKind) -> bool {
        matches!(
            (self, kind),
            (Self::Both, _)
                | (Self::Statistical, DetectorKind::Statistical)
                | (Self::Ml, DetectorKind::Ml)
        )
    }
}

/// Counts produced by a full pipeline pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub raw_awards: usize,
    pub vendors: usize,
    pub monthly_rows: usize,
    pub statistical_anomalies: usize,
    /// `None` when the ml detector did not run (not requested, or skipped
    /// for lack of training data).
    pub ml_anomalies: Option<usize>,
}

pub struct Pipeline<'a> {
    store: &'a DuckStore,
    config: PipelineConfig,
}

impl<'a> Pipeline<'a> {
    pub fn new(store: &'a DuckStore, config: PipelineConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn resolve(&self, run_id: &str) -> Result<usize, EngineError> {
        VendorResolver::new(self.store, self.config.fuzzy_threshold).resolve_run(run_id)
    }

    pub fn aggregate(&self, run_id: &str) -> Result<usize, EngineError> {
        TimeSeriesAggregator::new(self.store).aggregate_run(run_id)
    }

    /// Train the outlier model on a run and persist it under that run.
    pub fn train(&self, run_id: &str) -> Result<usize, EngineError> {
        let mut ml = MlDetector::new(self.store, self.config.ml.clone());
        let samples = ml.train(run_id)?;
        ml.save(run_id)?;
        Ok(samples)
    }

    /// Run the requested detectors and store their anomalies.
    ///
    /// The ml detector uses the model saved under `model_run` (defaulting to
    /// `run_id`) and fails with [`EngineError::ModelNotTrained`] if none exists.
    pub fn detect(
        &self,
        run_id: &str,
        method: DetectMethod,
        model_run: Option<&str>,
    ) -> Result<Vec<Anomaly>, EngineError> {
        let table = FeatureEngineer::new(self.store).engineer_features(run_id)?;
        let mut all = Vec::new();

        if method.includes(DetectorKind::Statistical) {
            let robust = RobustStatisticalDetector::new(self.store, self.config.robust.clone());
            all.extend(self.detect_and_store(&robust, &table)?);
        }
        if method.includes(DetectorKind::Ml) {
            let mut ml = MlDetector::new(self.store, self.config.ml.clone());
            ml.load(model_run.unwrap_or(run_id))?;
            all.extend(self.detect_and_store(&ml, &table)?);
        }
        Ok(all)
    }

    fn detect_and_store(
        &self,
        detector: &dyn Detector,
        table: &crate::FeatureTable,
    ) -> Result<Vec<Anomaly>, EngineError> {
        let found = detector.detect(table)?;
        self.store
            .replace_anomalies(&table.run_id, detector.kind(), &found)?;
        Ok(found)
    }

    /// Full pass over a run, tracking status in the run manifest.
    ///
    /// When the ml detector is requested it is trained on this same run; a
    /// run too small to train on skips the ml stage instead of failing.
    /// A run that already completed or failed is refused untouched.
    pub fn run(&self, run_id: &str, method: DetectMethod) -> Result<RunSummary, EngineError> {
        match self.store.run(run_id)? {
            None => {
                self.store.create_run(run_id)?;
            }
            Some(run) if run.status.is_terminal() => {
                return Err(StoreError::RunFinalized {
                    run_id: run.run_id,
                    status: run.status.as_str(),
                }
                .into());
            }
            Some(_) => {}
        }
        self.store.set_run_status(run_id, RunStatus::Running, None)?;

        match self.run_stages(run_id, method) {
            Ok(summary) => {
                self.store.set_run_status(
                    run_id,
                    RunStatus::Completed,
                    Some(summary.raw_awards as u64),
                )?;
                info!(
                    run_id,
                    vendors = summary.vendors,
                    statistical = summary.statistical_anomalies,
                    ml = ?summary.ml_anomalies,
                    "run completed"
                );
                Ok(summary)
            }
            Err(e) => {
                error!(run_id, error = %e, "run failed");
                self.store.set_run_status(run_id, RunStatus::Failed, None)?;
                Err(e)
            }
        }
    }

    fn run_stages(&self, run_id: &str, method: DetectMethod) -> Result<RunSummary, EngineError> {
        let mut summary = RunSummary {
            run_id: run_id.to_string(),
            raw_awards: self.store.raw_award_count(run_id)?,
            vendors: self.resolve(run_id)?,
            ..RunSummary::default()
        };
        summary.monthly_rows = self.aggregate(run_id)?;

        if method.includes(DetectorKind::Statistical) {
            summary.statistical_anomalies = self
                .detect(run_id, DetectMethod::Statistical, None)?
                .len();
        }
        if method.includes(DetectorKind::Ml) {
            match self.train(run_id) {
                Ok(_) => {
                    summary.ml_anomalies = Some(self.detect(run_id, DetectMethod::Ml, None)?.len());
                }
                Err(EngineError::InsufficientData { required, got }) => {
                    warn!(run_id, required, got, "too few rows to train, ml detection skipped");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(summary)
    }

    /// Stored anomalies of a run, each with evidence, context and narrative.
    pub fn reports(&self, run_id: &str) -> Result<Vec<AnomalyReport>, EngineError> {
        let assembler = EvidenceAssembler::new(self.store);
        self.store
            .anomalies(run_id)?
            .iter()
            .map(|a| assembler.explain(a, self.config.evidence.top_n))
            .collect()
    }
}
