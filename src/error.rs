use crate::inference::BackendKind;
use thiserror::Error;

/// Raised by a backend probe when the backend cannot be brought up.
///
/// Only the selector ever sees this; it logs it and moves on to the next
/// backend in the chain.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind} backend unavailable: {reason}")]
pub struct BackendUnavailable {
    pub kind: BackendKind,
    pub reason: String,
}

impl BackendUnavailable {
    pub fn new(kind: BackendKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// Why an upload was rejected before reaching any backend
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvalidInput {
    #[error("Image payload is empty")]
    Empty,

    #[error("Image is {size} bytes, limit is {limit} bytes")]
    TooLarge { size: usize, limit: usize },

    #[error("Unsupported image type: {mime_type} ({filename})")]
    UnsupportedType { filename: String, mime_type: String },

    #[error("Image could not be read: {0}")]
    Unreadable(String),

    #[error("Payload is not a recognised image format")]
    NotAnImage,
}

/// Per-request pipeline errors
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid input: {0}")]
    InvalidInput(#[from] InvalidInput),

    #[error("Prediction failed on {backend} backend: {source}")]
    PredictionFailed {
        backend: BackendKind,
        #[source]
        source: anyhow::Error,
    },

    #[error("No inference backend available")]
    NoBackendAvailable,
}

impl PipelineError {
    pub fn prediction_failed(backend: BackendKind, source: impl Into<anyhow::Error>) -> Self {
        PipelineError::PredictionFailed {
            backend,
            source: source.into(),
        }
    }

    /// Stable name used in failure responses and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::InvalidInput(_) => "InvalidInput",
            PipelineError::PredictionFailed { .. } => "PredictionFailed",
            PipelineError::NoBackendAvailable => "NoBackendAvailable",
        }
    }

    /// User-facing message. Prediction failures never expose the cause.
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::InvalidInput(reason) => reason.to_string(),
            PipelineError::PredictionFailed { .. } => "Prediction failed. Please try again.".to_string(),
            PipelineError::NoBackendAvailable => {
                "Diagnosis is currently unavailable".to_string()
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prediction_failed_keeps_cause() {
        let err = PipelineError::prediction_failed(
            BackendKind::Real,
            std::io::Error::new(std::io::ErrorKind::Other, "tensor shape mismatch"),
        );

        assert_eq!(err.kind(), "PredictionFailed");
        assert!(err.to_string().contains("real"));

        let source = std::error::Error::source(&err).expect("cause attached");
        assert!(source.to_string().contains("tensor shape mismatch"));
        assert!(!err.user_message().contains("tensor"));
    }

    #[test]
    fn test_invalid_input_converts() {
        let err: PipelineError = InvalidInput::Empty.into();
        assert_eq!(err.kind(), "InvalidInput");
        assert_eq!(err.user_message(), "Image payload is empty");
    }
}
