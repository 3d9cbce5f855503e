//! Collaborator ports consumed by the stages.
//!
//! Each trait is a narrow boundary to external infrastructure: object
//! storage, the data warehouse, the job runner, the parameter store and the
//! notification channel. Stages only receive the ports they need.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors reported by collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    /// The service could not be reached or is overloaded.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// The caller lacks permission for the operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The referenced object, statement or job does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The service has no capacity to accept the request.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The request was rejected as invalid.
    #[error("Rejected: {0}")]
    Rejected(String),
}

/// An object listed under a prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    /// Full location of the object.
    pub location: String,
    /// Size in bytes.
    pub size: u64,
}

/// Read/write access to run-scoped storage locations.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Writes an object, replacing any existing one.
    async fn put(&self, location: &str, bytes: Vec<u8>) -> Result<(), PortError>;

    /// Reads an object.
    async fn get(&self, location: &str) -> Result<Vec<u8>, PortError>;

    /// Lists every object whose location starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, PortError>;
}

/// A statement submitted to the warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementRequest {
    /// Target workgroup.
    pub workgroup: String,
    /// Target database.
    pub database: String,
    /// Statement text.
    pub sql: String,
    /// Deterministic token; a repeated token must not run the statement twice
    /// while the first is running or finished. A failed or aborted statement
    /// releases its token.
    pub client_token: String,
}

/// Observed state of a warehouse statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StatementState {
    /// Accepted, not yet started.
    Submitted,
    /// Running.
    Started,
    /// Finished; the row count is reported when the warehouse knows it.
    Finished {
        /// Rows written by the statement.
        rows: Option<u64>,
    },
    /// Failed with an error message.
    Failed {
        /// The warehouse's error.
        error: String,
    },
    /// Aborted before completion.
    Aborted,
}

impl StatementState {
    /// Returns true once the statement will not change state again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished { .. } | Self::Failed { .. } | Self::Aborted
        )
    }

    /// Returns true for a statement that ended without finishing.
    #[must_use]
    pub const fn is_unsuccessful(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Aborted)
    }
}

/// Executes extraction statements.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Submits a statement and returns its id.
    async fn execute(&self, request: &StatementRequest) -> Result<String, PortError>;

    /// Reports the current state of a statement.
    async fn describe(&self, statement_id: &str) -> Result<StatementState, PortError>;

    /// Requests that a running statement be cancelled.
    async fn cancel(&self, statement_id: &str) -> Result<(), PortError>;
}

/// Describes a containerized job.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobSpec {
    /// Image reference.
    pub image: String,
    /// Command override; empty means the image default.
    #[serde(default)]
    pub command: Vec<String>,
    /// Environment passed to the job.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// Observed state of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for capacity.
    Pending,
    /// Running.
    Running,
    /// Exited successfully.
    Succeeded,
    /// Exited unsuccessfully or was stopped.
    Failed {
        /// Exit code, when the job produced one.
        exit_code: Option<i32>,
        /// Why the job failed.
        reason: String,
    },
}

impl JobStatus {
    /// Returns true once the job will not change state again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. })
    }
}

/// A handle to a submitted job.
#[async_trait]
pub trait JobHandle: Send + Sync {
    /// Returns the job id.
    fn id(&self) -> &str;

    /// Polls the job status.
    async fn status(&self) -> Result<JobStatus, PortError>;

    /// Forcibly stops the job.
    async fn stop(&self, reason: &str) -> Result<(), PortError>;
}

/// Launches jobs.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Submits a job. Fails with `ResourceExhausted` when it cannot be scheduled.
    async fn submit(&self, spec: &JobSpec) -> Result<Box<dyn JobHandle>, PortError>;
}

/// Read-only key to string configuration lookups.
#[async_trait]
pub trait ParameterStore: Send + Sync {
    /// Looks up a parameter. `Ok(None)` means the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<String>, PortError>;
}

/// Resolves a parameter that must be present and non-blank.
///
/// Returns the key back as the error so callers can name it.
pub async fn require_parameter(
    store: &dyn ParameterStore,
    key: &str,
) -> Result<String, RequiredParameterError> {
    match store.get(key).await {
        Ok(Some(value)) if !value.trim().is_empty() => Ok(value),
        Ok(_) => Err(RequiredParameterError::Missing(key.to_string())),
        Err(source) => Err(RequiredParameterError::Lookup {
            key: key.to_string(),
            source,
        }),
    }
}

/// Why a required parameter could not be resolved.
#[derive(Debug, Clone, Error)]
pub enum RequiredParameterError {
    /// The key is absent or blank.
    #[error("required parameter '{0}' is missing or empty")]
    Missing(String),

    /// The lookup itself failed.
    #[error("lookup of parameter '{key}' failed: {source}")]
    Lookup {
        /// The key.
        key: String,
        /// The store error.
        source: PortError,
    },
}

/// A structured notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    /// Short subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
    /// Recipient override for this message only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
}

/// Delivers notifications to a topic.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Publishes a message and returns the channel's message id.
    async fn publish(&self, topic: &str, message: &NotificationMessage)
        -> Result<String, PortError>;
}
