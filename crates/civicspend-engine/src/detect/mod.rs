//! Anomaly detectors over the engineered feature table.
//!
//! Both detectors read the same [`FeatureTable`] and emit [`Anomaly`] values
//! of the same shape. They are independent views; nothing deduplicates
//! their output against each other.

mod ml;
mod robust;

pub use ml::{MlDetector, TrainedModel};
pub use robust::{MODIFIED_Z_FACTOR, RobustStatisticalDetector, modified_z_scores};

use civicspend_core::{Anomaly, DetectorKind};

use crate::EngineError;
use crate::features::FeatureTable;

/// A source of anomalies over an engineered feature table.
pub trait Detector {
    fn kind(&self) -> DetectorKind;

    /// Flag rows of `table`. An empty result is success.
    fn detect(&self, table: &FeatureTable) -> Result<Vec<Anomaly>, EngineError>;
}
