//! Isolation-forest detector with a train/predict lifecycle.

use civicspend_ai::{ForestConfig, IsolationForest, StandardScaler};
use civicspend_core::{Anomaly, DetectorKind, MlConfig};
use civicspend_store::{DuckStore, StoredModel};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::Detector;
use crate::EngineError;
use crate::features::{FEATURE_COUNT, FeatureEngineer, FeatureTable};

/// Fitted scaler and forest, persisted together as one JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedModel {
    pub scaler: StandardScaler,
    pub forest: IsolationForest,
    pub sample_count: usize,
}

/// Unsupervised detector. Starts untrained; [`train`](Self::train) or
/// [`load`](Self::load) moves it to the trained state that prediction needs.
pub struct MlDetector<'a> {
    store: &'a DuckStore,
    config: MlConfig,
    model: Option<TrainedModel>,
}

impl<'a> MlDetector<'a> {
    pub fn new(store: &'a DuckStore, config: MlConfig) -> Self {
        Self {
            store,
            config,
            model: None,
        }
    }

    pub fn is_trained(&self) -> bool {
        self.model.is_some()
    }

    pub fn model(&self) -> Option<&TrainedModel> {
        self.model.as_ref()
    }

    /// Fit the scaler and forest on a run's features. Returns the number of
    /// training rows.
    pub fn train(&mut self, run_id: &str) -> Result<usize, EngineError> {
        let table = FeatureEngineer::new(self.store).engineer_features(run_id)?;
        self.train_on(&table)
    }

    /// Fit on an already engineered table.
    pub fn train_on(&mut self, table: &FeatureTable) -> Result<usize, EngineError> {
        if table.len() < self.config.min_samples {
            return Err(EngineError::InsufficientData {
                required: self.config.min_samples,
                got: table.len(),
            });
        }

        let (scaler, scaled) = StandardScaler::fit_transform(&table.matrix())?;
        let forest = IsolationForest::fit(
            &scaled,
            ForestConfig {
                n_estimators: self.config.n_estimators,
                max_samples: self.config.max_samples,
                contamination: self.config.contamination,
                seed: self.config.seed,
            },
        )?;

        let sample_count = table.len();
        info!(
            run_id = %table.run_id,
            samples = sample_count,
            features = FEATURE_COUNT,
            "trained outlier model"
        );
        self.model = Some(TrainedModel {
            scaler,
            forest,
            sample_count,
        });
        Ok(sample_count)
    }

    /// Score a (possibly different) run with the fitted model and return the
    /// rows the ensemble calls outliers.
    pub fn predict(&self, run_id: &str) -> Result<Vec<Anomaly>, EngineError> {
        if self.model.is_none() {
            return Err(EngineError::ModelNotTrained);
        }
        let table = FeatureEngineer::new(self.store).engineer_features(run_id)?;
        self.detect(&table)
    }

    /// Persist the trained model under `run_id`, replacing any earlier one.
    pub fn save(&self, run_id: &str) -> Result<(), EngineError> {
        let model = self.model.as_ref().ok_or(EngineError::ModelNotTrained)?;
        self.store.save_model(&StoredModel {
            run_id: run_id.to_string(),
            payload: serde_json::to_string(model)?,
            sample_count: model.sample_count as u64,
            trained_at: chrono::Utc::now().to_rfc3339(),
        })?;
        Ok(())
    }

    /// Restore the model saved under `run_id`. Fails with
    /// [`EngineError::ModelNotTrained`] if none was saved.
    pub fn load(&mut self, run_id: &str) -> Result<(), EngineError> {
        let stored = self
            .store
            .load_model(run_id)?
            .ok_or(EngineError::ModelNotTrained)?;
        let model: TrainedModel = serde_json::from_str(&stored.payload)?;
        info!(run_id, samples = model.sample_count, trained_at = %stored.trained_at, "loaded outlier model");
        self.model = Some(model);
        Ok(())
    }
}

impl Detector for MlDetector<'_> {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Ml
    }

    fn detect(&self, table: &FeatureTable) -> Result<Vec<Anomaly>, EngineError> {
        let model = self.model.as_ref().ok_or(EngineError::ModelNotTrained)?;
        if table.is_empty() {
            return Ok(Vec::new());
        }

        let scaled = model.scaler.transform(&table.matrix())?;
        let scores = model.forest.score_samples(&scaled)?;
        let offset = model.forest.offset();

        let anomalies: Vec<Anomaly> = table
            .rows
            .iter()
            .zip(scores)
            .filter(|(_, score)| *score < offset)
            .map(|(row, score)| Anomaly {
                run_id: table.run_id.clone(),
                vendor_id: row.aggregate.vendor_id.clone(),
                vendor_name: Some(row.vendor_name.clone()),
                year_month: row.aggregate.year_month,
                detector: DetectorKind::Ml,
                severity: self.config.severity.classify(score),
                score,
                value: row.aggregate.obligation_sum,
                award_count: row.aggregate.award_count,
            })
            .collect();

        info!(
            run_id = %table.run_id,
            rows = table.len(),
            anomalies = anomalies.len(),
            "ml detection complete"
        );
        Ok(anomalies)
    }
}
