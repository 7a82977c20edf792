//! Error types for CacheFlow

use crate::shape::ShapeError;
use thiserror::Error;

/// CacheFlow error types
#[derive(Error, Debug)]
pub enum FlowError {
    /// A wrapped callable failed during evaluation
    #[error("Operation '{id}' failed: {source}")]
    OperationFailed {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    /// A decoded snapshot did not match its expected shape
    #[error("Value validation failed: {}", format_shape_errors(.errors))]
    ValueValidationFailed { errors: Vec<ShapeError> },

    /// Cached value requested before the operation was evaluated
    #[error("Value of operation '{id}' has not been computed")]
    ValueNotComputed { id: String },

    /// An internal lookup came back empty where a value was required
    #[error("Unexpected empty value: {0}")]
    UnexpectedEmptyValue(String),

    /// A structural precondition of a workflow action failed
    #[error("Failed workflow action: {0}")]
    FailedWorkflowAction(String),

    /// A function reference could not be resolved against the registry
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),
}

/// Kind tag for matching on a [`FlowError`] without its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    OperationFailed,
    ValueValidationFailed,
    ValueNotComputed,
    UnexpectedEmptyValue,
    FailedWorkflowAction,
    SerializationFailed,
}

impl FlowError {
    /// Return the kind tag of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowError::OperationFailed { .. } => ErrorKind::OperationFailed,
            FlowError::ValueValidationFailed { .. } => ErrorKind::ValueValidationFailed,
            FlowError::ValueNotComputed { .. } => ErrorKind::ValueNotComputed,
            FlowError::UnexpectedEmptyValue(_) => ErrorKind::UnexpectedEmptyValue,
            FlowError::FailedWorkflowAction(_) => ErrorKind::FailedWorkflowAction,
            FlowError::SerializationFailed(_) => ErrorKind::SerializationFailed,
        }
    }

    /// Shorthand for a single-message validation failure
    pub(crate) fn invalid(path: impl Into<String>, message: impl Into<String>) -> Self {
        FlowError::ValueValidationFailed {
            errors: vec![ShapeError::new(path, message)],
        }
    }
}

fn format_shape_errors(errors: &[ShapeError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias using FlowError
pub type Result<T> = std::result::Result<T, FlowError>;
