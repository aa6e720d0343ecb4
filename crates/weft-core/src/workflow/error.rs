//! Runtime error type and its conversion to persisted `ErrorDetails`.

use std::time::Duration;

use thiserror::Error;
use weft_types::error::{ErrorDetails, RepositoryError};

use super::definition::DefinitionError;
use super::expression::ExpressionError;

/// Errors raised while executing a workflow.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("task instance '{0}' not found")]
    TaskNotFound(String),

    #[error("correlation failed: {0}")]
    Correlation(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("runtime error: {0}")]
    Runtime(String),

    /// A fault already described in structured form.
    #[error("{0}")]
    Fault(ErrorDetails),
}

impl EngineError {
    /// Convert to the structured form persisted on faulted tasks and workflows.
    pub fn to_error_details(&self) -> ErrorDetails {
        match self {
            EngineError::Fault(details) => details.clone(),
            EngineError::Timeout(after) => {
                ErrorDetails::timeout(format!("timed out after {}ms", after.as_millis()))
            }
            EngineError::Expression(e) => ErrorDetails::expression(e.to_string()),
            EngineError::Configuration(msg) => ErrorDetails::configuration(msg.clone()),
            EngineError::Definition(e) => ErrorDetails::validation(e.to_string()),
            EngineError::Correlation(msg) => ErrorDetails::correlation(msg.clone()),
            EngineError::Repository(RepositoryError::Connection) => {
                ErrorDetails::communication(self.to_string())
            }
            other => ErrorDetails::runtime(other.to_string()),
        }
    }
}

impl From<ErrorDetails> for EngineError {
    fn from(details: ErrorDetails) -> Self {
        EngineError::Fault(details)
    }
}
