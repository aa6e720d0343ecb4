//! Error types shared across the Weft crates.
//!
//! `RepositoryError` is returned by every storage port. `ErrorDetails` is the
//! structured, persisted description of a task or workflow fault.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from repository operations (used by trait definitions in weft-core).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    /// The resource changed since it was read (optimistic concurrency).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("entity already exists: {0}")]
    AlreadyExists(String),
}

impl RepositoryError {
    /// Whether the failure is an optimistic-concurrency conflict that a
    /// re-read-and-retry can resolve.
    pub fn is_conflict(&self) -> bool {
        matches!(self, RepositoryError::Conflict(_))
    }
}

/// Well-known error type URIs.
pub mod error_types {
    const BASE: &str = "https://serverlessworkflow.io/spec/1.0.0/errors";

    pub const CONFIGURATION: &str = "https://serverlessworkflow.io/spec/1.0.0/errors/configuration";
    pub const VALIDATION: &str = "https://serverlessworkflow.io/spec/1.0.0/errors/validation";
    pub const EXPRESSION: &str = "https://serverlessworkflow.io/spec/1.0.0/errors/expression";
    pub const TIMEOUT: &str = "https://serverlessworkflow.io/spec/1.0.0/errors/timeout";
    pub const COMMUNICATION: &str = "https://serverlessworkflow.io/spec/1.0.0/errors/communication";
    pub const RUNTIME: &str = "https://serverlessworkflow.io/spec/1.0.0/errors/runtime";
    pub const CORRELATION: &str = "https://serverlessworkflow.io/spec/1.0.0/errors/correlation";

    /// Returns `true` if `type_` is one of the engine-defined URIs above.
    pub fn is_well_known(type_: &str) -> bool {
        type_.starts_with(BASE)
    }
}

/// Structured description of a fault, persisted on faulted tasks and workflows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    /// URI identifying the error type.
    #[serde(rename = "type")]
    pub type_: String,
    /// HTTP-like status code.
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Reference of the task instance that raised the error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl ErrorDetails {
    pub fn new(type_: impl Into<String>, status: u16, title: impl Into<String>) -> Self {
        Self {
            type_: type_.into(),
            status,
            title: Some(title.into()),
            detail: None,
            instance: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(error_types::TIMEOUT, 408, "Timeout").with_detail(detail)
    }

    pub fn configuration(detail: impl Into<String>) -> Self {
        Self::new(error_types::CONFIGURATION, 400, "Configuration").with_detail(detail)
    }

    pub fn validation(detail: impl Into<String>) -> Self {
        Self::new(error_types::VALIDATION, 400, "Validation").with_detail(detail)
    }

    pub fn expression(detail: impl Into<String>) -> Self {
        Self::new(error_types::EXPRESSION, 400, "Expression").with_detail(detail)
    }

    pub fn communication(detail: impl Into<String>) -> Self {
        Self::new(error_types::COMMUNICATION, 502, "Communication").with_detail(detail)
    }

    pub fn runtime(detail: impl Into<String>) -> Self {
        Self::new(error_types::RUNTIME, 500, "Runtime").with_detail(detail)
    }

    pub fn correlation(detail: impl Into<String>) -> Self {
        Self::new(error_types::CORRELATION, 500, "Correlation").with_detail(detail)
    }

    pub fn is_timeout(&self) -> bool {
        self.type_ == error_types::TIMEOUT
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.status, self.type_)?;
        if let Some(title) = &self.title {
            write!(f, " {title}")?;
        }
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorDetails {}
