use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("no samples to fit")]
    EmptyInput,

    #[error("expected {expected} features per row, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}
