use civicspend_ai::ModelError;
use civicspend_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("insufficient data: need at least {required} samples, got {got}")]
    InsufficientData { required: usize, got: usize },

    #[error("model not trained: call train() or load a saved model first")]
    ModelNotTrained,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("model serialisation: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("arrow: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
}
