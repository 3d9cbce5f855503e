//! Typed stage payloads.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// What the export stage produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportResult {
    /// Identifier of the logical run.
    pub run_id: String,
    /// Partition date of the snapshot.
    pub run_date: NaiveDate,
    /// Prefix the snapshot objects live under.
    pub input_location: String,
    /// Rows written, when the warehouse reported it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    /// Data objects found under the prefix.
    pub object_count: usize,
    /// True when an existing snapshot was reused instead of re-extracted.
    #[serde(default)]
    pub reused_snapshot: bool,
    /// Stage duration.
    pub duration_ms: u64,
}

impl ExportResult {
    /// Creates an export result with no counts.
    #[must_use]
    pub fn new(run_id: impl Into<String>, run_date: NaiveDate, input_location: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            run_date,
            input_location: input_location.into(),
            row_count: None,
            object_count: 0,
            reused_snapshot: false,
            duration_ms: 0,
        }
    }

    /// Sets the row count.
    #[must_use]
    pub const fn with_row_count(mut self, rows: u64) -> Self {
        self.row_count = Some(rows);
        self
    }

    /// Sets the object count.
    #[must_use]
    pub const fn with_object_count(mut self, count: usize) -> Self {
        self.object_count = count;
        self
    }

    /// Marks the snapshot as reused.
    #[must_use]
    pub const fn reused(mut self) -> Self {
        self.reused_snapshot = true;
        self
    }

    /// Sets the duration.
    #[must_use]
    pub const fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// What the compute stage produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeResult {
    /// Id of the job that ran.
    pub job_id: String,
    /// Exit code, when the runner reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Objects found under the output location after the job finished.
    pub output_objects: usize,
    /// Stage duration.
    pub duration_ms: u64,
}

impl ComputeResult {
    /// Creates a compute result for a job.
    #[must_use]
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            exit_code: None,
            output_objects: 0,
            duration_ms: 0,
        }
    }

    /// Sets the exit code.
    #[must_use]
    pub const fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    /// Sets the output object count.
    #[must_use]
    pub const fn with_output_objects(mut self, count: usize) -> Self {
        self.output_objects = count;
        self
    }

    /// Sets the duration.
    #[must_use]
    pub const fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// What the notify stage produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyResult {
    /// Channel-assigned message id.
    pub message_id: String,
    /// Delivery attempts it took.
    pub attempts: usize,
}

impl NotifyResult {
    /// Creates a notify result.
    #[must_use]
    pub fn new(message_id: impl Into<String>, attempts: usize) -> Self {
        Self {
            message_id: message_id.into(),
            attempts,
        }
    }
}
