//! Unsupervised outlier scoring: feature standardisation and isolation forests.

mod error;
pub mod forest;
pub mod scaler;

pub use error::ModelError;
pub use forest::{ForestConfig, IsolationForest};
pub use scaler::StandardScaler;
