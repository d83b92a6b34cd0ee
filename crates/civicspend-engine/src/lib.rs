//! CivicSpend analytical engine: vendor resolution, monthly aggregation,
//! feature engineering, anomaly detection and evidence assembly.

mod error;

pub mod aggregate;
pub mod detect;
pub mod evidence;
pub mod features;
pub mod pipeline;
pub mod resolver;

pub use aggregate::TimeSeriesAggregator;
pub use detect::{Detector, MlDetector, RobustStatisticalDetector};
pub use error::EngineError;
pub use evidence::{AnomalyReport, EvidenceAssembler, generate_narrative};
pub use features::{FeatureEngineer, FeatureRow, FeatureTable};
pub use pipeline::{DetectMethod, Pipeline, RunSummary};
pub use resolver::VendorResolver;
