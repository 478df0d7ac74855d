//! Error types for the nasdiff training pipeline

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for nasdiff operations
pub type Result<T> = std::result::Result<T, NasDiffError>;

/// Main error type for the nasdiff pipeline
#[derive(Error, Debug)]
pub enum NasDiffError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("SDE {0} unknown")]
    UnsupportedSde(String),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Config mismatch on `{field}`: frozen score model has {frozen}, current run has {current}")]
    ConfigMismatch {
        field: &'static str,
        frozen: String,
        current: String,
    },

    #[error("Checkpoint not found: {}", .0.display())]
    CheckpointNotFound(PathBuf),

    #[error("Data error: {0}")]
    DataError(String),

    #[error("Training error: {0}")]
    TrainingError(String),

    #[error("Invalid shape: expected {expected}, got {actual}")]
    ShapeError { expected: String, actual: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl NasDiffError {
    /// Whether the error belongs to the configuration class (fatal before training starts)
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigError(_)
                | Self::UnsupportedSde(_)
                | Self::UnknownTask(_)
                | Self::UnknownModel(_)
                | Self::ConfigMismatch { .. }
        )
    }
}

impl From<serde_json::Error> for NasDiffError {
    fn from(err: serde_json::Error) -> Self {
        NasDiffError::SerializationError(err.to_string())
    }
}

impl From<ndarray::ShapeError> for NasDiffError {
    fn from(err: ndarray::ShapeError) -> Self {
        NasDiffError::ShapeError {
            expected: "valid shape".to_string(),
            actual: err.to_string(),
        }
    }
}
