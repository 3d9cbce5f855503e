//! Error types for the scoreflow pipeline.
//!
//! Stage failures are values, not panics: every stage returns a
//! [`StageError`] carrying an [`ErrorKind`], and the coordinator folds it
//! into the run context. [`ScoreflowError`] covers everything outside the
//! stage boundary (configuration, context bookkeeping, collaborators).

use crate::config::ConfigError;
use crate::core::RunStatus;
use crate::ports::PortError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// The main error type for scoreflow operations outside stage execution.
#[derive(Debug, Error)]
pub enum ScoreflowError {
    /// Configuration could not be loaded or is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A write-once field of the run context was written twice.
    #[error("{0}")]
    DataConflict(#[from] DataConflictError),

    /// The run status was asked to move along an edge that does not exist.
    #[error("{0}")]
    Transition(#[from] TransitionError),

    /// A run identifier is unusable as a location segment.
    #[error("Invalid run id '{0}': expected [A-Za-z0-9._-]+")]
    InvalidRunId(String),

    /// A location string could not be parsed.
    #[error("Invalid location '{0}'")]
    InvalidLocation(String),

    /// A coordinator was built without one of its required parts.
    #[error("Pipeline is missing its {0}")]
    MissingComponent(&'static str),

    /// A collaborator call failed.
    #[error("{0}")]
    Port(#[from] PortError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ScoreflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Classification of a stage or run failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The upstream data source was unreachable, refused access, or the
    /// extraction statement failed.
    ExportUnavailable,
    /// The extraction finished but produced no rows.
    ExportEmptyResult,
    /// The extraction exceeded the export stage timeout.
    ExportTimeout,
    /// The compute job could not be scheduled.
    ComputeSchedulingFailed,
    /// The compute job reached a failed terminal state.
    ComputeJobFailed,
    /// The compute job exceeded the compute stage timeout.
    ComputeTimeout,
    /// The notification could not be delivered.
    NotifyDeliveryFailed,
    /// The overall run deadline elapsed.
    Timeout,
    /// A required configuration parameter could not be resolved.
    ConfigurationMissing,
}

impl ErrorKind {
    /// Returns the stable snake_case code for this kind.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::ExportUnavailable => "export_unavailable",
            Self::ExportEmptyResult => "export_empty_result",
            Self::ExportTimeout => "export_timeout",
            Self::ComputeSchedulingFailed => "compute_scheduling_failed",
            Self::ComputeJobFailed => "compute_job_failed",
            Self::ComputeTimeout => "compute_timeout",
            Self::NotifyDeliveryFailed => "notify_delivery_failed",
            Self::Timeout => "timeout",
            Self::ConfigurationMissing => "configuration_missing",
        }
    }

    /// Returns true if a wrapping retry decorator may try again.
    ///
    /// Timeouts, empty results and job failures are deterministic enough
    /// that retrying only burns the deadline.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ExportUnavailable | Self::ComputeSchedulingFailed | Self::NotifyDeliveryFailed
        )
    }

    /// Returns true for any timeout flavour, stage-local or overall.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ExportTimeout | Self::ComputeTimeout | Self::Timeout
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Typed failure returned by a stage.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct StageError {
    /// What went wrong.
    pub kind: ErrorKind,
    /// Human-readable cause.
    pub message: String,
}

impl StageError {
    /// Creates a new stage error.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates a `ConfigurationMissing` error for a parameter key.
    #[must_use]
    pub fn configuration_missing(key: &str) -> Self {
        Self::new(
            ErrorKind::ConfigurationMissing,
            format!("required parameter '{key}' is missing or empty"),
        )
    }

    /// Creates an overall-deadline `Timeout` error.
    #[must_use]
    pub fn deadline(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Returns true if a retry decorator may try again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("kind".to_string(), serde_json::json!(self.kind.code()));
        map.insert("message".to_string(), serde_json::json!(self.message));
        map
    }
}

/// Error raised when writing to a write-once field of the run context.
#[derive(Debug, Clone, Error)]
#[error("Data conflict: field '{key}' is already set")]
pub struct DataConflictError {
    /// The conflicting field.
    pub key: String,
}

impl DataConflictError {
    /// Creates a new data conflict error.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// Error raised when a status transition is not part of the state machine.
#[derive(Debug, Clone, Error)]
#[error("Illegal status transition: {from} -> {to}")]
pub struct TransitionError {
    /// The current status.
    pub from: RunStatus,
    /// The requested status.
    pub to: RunStatus,
}

impl TransitionError {
    /// Creates a new transition error.
    #[must_use]
    pub const fn new(from: RunStatus, to: RunStatus) -> Self {
        Self { from, to }
    }
}
