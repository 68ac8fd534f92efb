//! Error types for padim-model crate.

use thiserror::Error;

/// Errors that can occur in padim-model operations.
///
/// Every variant is fatal to the operation that raised it. `fit` and
/// `compute` never hand back partial state alongside an error.
#[derive(Debug, Error)]
pub enum PadimError {
    /// Invalid configuration: unknown layer name, too many requested
    /// channels, unsupported backbone, malformed config document.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Tensor dimensions disagree between layers, chunks, or model and input.
    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Expected shape.
        expected: String,
        /// Actual shape.
        actual: String,
    },

    /// Covariance inversion failed even after regularization.
    #[error("numerical error: {0}")]
    Numerical(String),

    /// A persisted model does not match the loading configuration.
    #[error("checkpoint does not match configuration: {field} expected {expected}, found {actual}")]
    ConfigMismatch {
        /// Name of the mismatching field.
        field: String,
        /// Value required by the loading configuration.
        expected: String,
        /// Value stored in the checkpoint.
        actual: String,
    },

    /// Not enough training samples to estimate a covariance.
    #[error("insufficient samples: got {count}, need at least {required}")]
    InsufficientSamples {
        /// Number of samples seen.
        count: usize,
        /// Minimum number of samples required.
        required: usize,
    },

    /// Scoring was requested before the Gaussian model was fit.
    #[error("model has not been fit")]
    NotFitted,

    /// Failed to load checkpoint.
    #[error("failed to load checkpoint from {path}: {reason}")]
    LoadCheckpoint {
        /// Path to the checkpoint file.
        path: String,
        /// Reason for failure.
        reason: String,
    },

    /// Failed to save checkpoint.
    #[error("failed to save checkpoint to {path}: {reason}")]
    SaveCheckpoint {
        /// Path to the checkpoint file.
        path: String,
        /// Reason for failure.
        reason: String,
    },

    /// Checkpoint file not found.
    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    /// Unsupported checkpoint format.
    #[error("unsupported checkpoint format: {0}")]
    UnsupportedFormat(String),

    /// Binary checkpoint header is corrupt or from an unknown version.
    #[error("invalid checkpoint header: {0}")]
    InvalidCheckpointHeader(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Tensor data could not be read back from the backend.
    #[error("tensor data error: {0}")]
    TensorData(String),
}

impl PadimError {
    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }

    /// Creates a shape mismatch error.
    #[must_use]
    pub fn shape_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Creates a numerical error.
    #[must_use]
    pub fn numerical(reason: impl Into<String>) -> Self {
        Self::Numerical(reason.into())
    }

    /// Creates a config mismatch error.
    #[must_use]
    pub fn config_mismatch(
        field: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::ConfigMismatch {
            field: field.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Creates an insufficient samples error.
    #[must_use]
    pub const fn insufficient_samples(count: usize, required: usize) -> Self {
        Self::InsufficientSamples { count, required }
    }

    /// Creates a load checkpoint error.
    #[must_use]
    pub fn load_checkpoint(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LoadCheckpoint {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a save checkpoint error.
    #[must_use]
    pub fn save_checkpoint(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SaveCheckpoint {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a checkpoint not found error.
    #[must_use]
    pub fn checkpoint_not_found(path: impl Into<String>) -> Self {
        Self::CheckpointNotFound(path.into())
    }

    /// Creates an unsupported format error.
    #[must_use]
    pub fn unsupported_format(format: impl Into<String>) -> Self {
        Self::UnsupportedFormat(format.into())
    }

    /// Creates an invalid checkpoint header error.
    #[must_use]
    pub fn invalid_header(reason: impl Into<String>) -> Self {
        Self::InvalidCheckpointHeader(reason.into())
    }

    /// Creates an IO error.
    #[must_use]
    pub fn io(reason: impl Into<String>) -> Self {
        Self::Io(reason.into())
    }

    /// Creates a serialization error.
    #[must_use]
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization(reason.into())
    }

    /// Creates a tensor data error.
    #[must_use]
    pub fn tensor_data(reason: impl Into<String>) -> Self {
        Self::TensorData(reason.into())
    }
}

impl From<std::io::Error> for PadimError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PadimError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for PadimError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for padim-model operations.
pub type Result<T> = std::result::Result<T, PadimError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn error_configuration() {
        let err = PadimError::configuration("layer 'layer9' not found");
        assert!(err.to_string().contains("configuration error"));
        assert!(err.to_string().contains("layer9"));
    }

    #[test]
    fn error_shape_mismatch() {
        let err = PadimError::shape_mismatch("[100, 56, 56]", "[100, 28, 28]");
        assert!(err.to_string().contains("[100, 56, 56]"));
        assert!(err.to_string().contains("[100, 28, 28]"));
    }

    #[test]
    fn error_numerical() {
        let err = PadimError::numerical("location 17 not positive definite");
        assert!(err.to_string().contains("numerical error"));
        assert!(err.to_string().contains("location 17"));
    }

    #[test]
    fn error_config_mismatch() {
        let err = PadimError::config_mismatch("backbone", "resnet18", "wide_resnet50_2");
        let msg = err.to_string();
        assert!(msg.contains("backbone"));
        assert!(msg.contains("resnet18"));
        assert!(msg.contains("wide_resnet50_2"));
    }

    #[test]
    fn error_insufficient_samples() {
        let err = PadimError::insufficient_samples(1, 2);
        assert!(err.to_string().contains("got 1"));
        assert!(err.to_string().contains("at least 2"));
    }

    #[test]
    fn error_not_fitted() {
        assert_eq!(PadimError::NotFitted.to_string(), "model has not been fit");
    }

    #[test]
    fn error_checkpoint_paths() {
        let err = PadimError::load_checkpoint("model.bin", "file corrupted");
        assert!(err.to_string().contains("model.bin"));
        assert!(err.to_string().contains("file corrupted"));

        let err = PadimError::save_checkpoint("output.json", "disk full");
        assert!(err.to_string().contains("output.json"));

        let err = PadimError::checkpoint_not_found("/path/to/missing.bin");
        assert!(err.to_string().contains("/path/to/missing.bin"));
    }

    #[test]
    fn error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let err: PadimError = io_err.into();
        assert!(matches!(err, PadimError::Io(_)));
    }

    #[test]
    fn error_from_json_error() {
        let json_err = serde_json::from_str::<u32>("not json");
        assert!(json_err.is_err());
        if let Err(e) = json_err {
            let err: PadimError = e.into();
            assert!(matches!(err, PadimError::Serialization(_)));
        }
    }
}
