//! Error types for padim-training crate.

use padim_model::PadimError;
use thiserror::Error;

/// Errors that can occur while fitting or evaluating a model.
#[derive(Debug, Error)]
pub enum TrainingError {
    /// The extractor or batches do not fit the model configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Error raised by the model itself.
    #[error("model error: {0}")]
    Model(#[from] PadimError),

    /// No training or evaluation samples were provided.
    #[error("empty dataset: {0}")]
    EmptyDataset(String),

    /// Evaluation inputs are inconsistent.
    #[error("evaluation error: {0}")]
    Evaluation(String),
}

impl TrainingError {
    /// Creates an invalid configuration error.
    #[must_use]
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig(reason.into())
    }

    /// Creates an empty dataset error.
    #[must_use]
    pub fn empty_dataset(reason: impl Into<String>) -> Self {
        Self::EmptyDataset(reason.into())
    }

    /// Creates an evaluation error.
    #[must_use]
    pub fn evaluation(reason: impl Into<String>) -> Self {
        Self::Evaluation(reason.into())
    }
}

/// Result type for training operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn error_invalid_config() {
        let err = TrainingError::invalid_config("extractor backbone differs");
        assert!(err.to_string().contains("invalid configuration"));
        assert!(err.to_string().contains("backbone"));
    }

    #[test]
    fn error_empty_dataset() {
        let err = TrainingError::empty_dataset("no training batches");
        assert!(err.to_string().contains("empty dataset"));
    }

    #[test]
    fn error_evaluation() {
        let err = TrainingError::evaluation("3 labels for 2 images");
        assert!(err.to_string().contains("evaluation error"));
    }

    #[test]
    fn error_from_model_error() {
        let err: TrainingError = PadimError::NotFitted.into();
        assert!(matches!(err, TrainingError::Model(PadimError::NotFitted)));
        assert!(err.to_string().contains("has not been fit"));
    }
}
