//! Failure record stored on a failed run.

use super::StageName;
use crate::errors::{ErrorKind, StageError};
use serde::{Deserialize, Serialize};

/// Why a run failed: the step that failed, how, and a readable cause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// The failing step.
    pub stage: StageName,
    /// The error classification.
    pub kind: ErrorKind,
    /// Human-readable cause.
    pub cause: String,
}

impl FailureRecord {
    /// Creates a new failure record.
    #[must_use]
    pub fn new(stage: StageName, kind: ErrorKind, cause: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            cause: cause.into(),
        }
    }

    /// Builds a record from a stage error.
    #[must_use]
    pub fn from_stage_error(stage: StageName, err: &StageError) -> Self {
        Self::new(stage, err.kind, err.message.clone())
    }
}

impl std::fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed ({}): {}", self.stage, self.kind, self.cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_stage_error() {
        let err = StageError::new(ErrorKind::ExportEmptyResult, "no rows");
        let record = FailureRecord::from_stage_error(StageName::Export, &err);

        assert_eq!(record.stage, StageName::Export);
        assert_eq!(record.kind, ErrorKind::ExportEmptyResult);
        assert_eq!(record.cause, "no rows");
        assert_eq!(record.to_string(), "export failed (export_empty_result): no rows");
    }

    #[test]
    fn test_failure_record_serialization() {
        let record = FailureRecord::new(StageName::Compute, ErrorKind::Timeout, "deadline");
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["stage"], "compute");
        assert_eq!(json["kind"], "timeout");
    }
}
