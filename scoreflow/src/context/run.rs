//! The run context threaded through the pipeline.

use crate::core::{FailureRecord, RunStatus};
use crate::errors::{DataConflictError, StageError, TransitionError};
use crate::stages::{ComputeResult, ExportResult, NotifyResult};
use crate::utils::{generate_uuid, now_utc, Timestamp};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Caller-supplied inputs for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunParameters {
    /// Overrides the notification recipient.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    /// Re-uses a run id, making a re-run land on the same locations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Logical snapshot date; defaults to today (UTC) at export time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_date: Option<NaiveDate>,
}

impl RunParameters {
    /// Creates empty run parameters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the recipient override.
    #[must_use]
    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    /// Sets the requested run id.
    #[must_use]
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Sets the run date.
    #[must_use]
    pub fn with_run_date(mut self, run_date: NaiveDate) -> Self {
        self.run_date = Some(run_date);
        self
    }
}

/// The record of one pipeline execution.
///
/// Only the coordinator mutates a context; stages see it through `&RunContext`.
/// Location and result fields are write-once and the status only moves along
/// the edges allowed by [`RunStatus::can_transition_to`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    execution_id: Uuid,
    params: RunParameters,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    export_result: Option<ExportResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    compute_result: Option<ComputeResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    notify_result: Option<NotifyResult>,
    status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<FailureRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    notify_error: Option<StageError>,
    started_at: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    finished_at: Option<Timestamp>,
}

fn set_once<T>(slot: &mut Option<T>, key: &str, value: T) -> Result<(), DataConflictError> {
    if slot.is_some() {
        return Err(DataConflictError::new(key));
    }
    *slot = Some(value);
    Ok(())
}

impl RunContext {
    /// Creates a pending context stamped with the current time.
    #[must_use]
    pub fn new(params: RunParameters) -> Self {
        Self {
            execution_id: generate_uuid(),
            params,
            run_id: None,
            run_date: None,
            input_location: None,
            output_location: None,
            export_result: None,
            compute_result: None,
            notify_result: None,
            status: RunStatus::Pending,
            failure: None,
            notify_error: None,
            started_at: now_utc(),
            finished_at: None,
        }
    }

    /// Returns the execution id minted at creation.
    #[must_use]
    pub const fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Returns the parameters the run was started with.
    #[must_use]
    pub const fn params(&self) -> &RunParameters {
        &self.params
    }

    /// Returns the run id, once export has produced one.
    #[must_use]
    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    /// Returns the run id, or the execution id before export produced one.
    #[must_use]
    pub fn display_id(&self) -> String {
        self.run_id
            .clone()
            .unwrap_or_else(|| self.execution_id.to_string())
    }

    /// Returns the logical run date.
    #[must_use]
    pub const fn run_date(&self) -> Option<NaiveDate> {
        self.run_date
    }

    /// Returns where the snapshot landed.
    #[must_use]
    pub fn input_location(&self) -> Option<&str> {
        self.input_location.as_deref()
    }

    /// Returns where compute results are written.
    #[must_use]
    pub fn output_location(&self) -> Option<&str> {
        self.output_location.as_deref()
    }

    /// Returns the export payload.
    #[must_use]
    pub const fn export_result(&self) -> Option<&ExportResult> {
        self.export_result.as_ref()
    }

    /// Returns the compute payload.
    #[must_use]
    pub const fn compute_result(&self) -> Option<&ComputeResult> {
        self.compute_result.as_ref()
    }

    /// Returns the notify payload.
    #[must_use]
    pub const fn notify_result(&self) -> Option<&NotifyResult> {
        self.notify_result.as_ref()
    }

    /// Returns the current status.
    #[must_use]
    pub const fn status(&self) -> RunStatus {
        self.status
    }

    /// Returns the failure, present iff the run failed or is about to.
    #[must_use]
    pub const fn failure(&self) -> Option<&FailureRecord> {
        self.failure.as_ref()
    }

    /// Returns the notification error, if delivery failed.
    #[must_use]
    pub const fn notify_error(&self) -> Option<&StageError> {
        self.notify_error.as_ref()
    }

    /// Returns when the run started.
    #[must_use]
    pub const fn started_at(&self) -> Timestamp {
        self.started_at
    }

    /// Returns when the run reached a terminal status.
    #[must_use]
    pub const fn finished_at(&self) -> Option<Timestamp> {
        self.finished_at
    }

    /// Returns the wall-clock duration in milliseconds, once finished.
    #[must_use]
    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }

    /// Returns true once the run reached `succeeded` or `failed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Serializes the context into a JSON report.
    #[must_use]
    pub fn to_report(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub(crate) fn transition(&mut self, next: RunStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::new(self.status, next));
        }
        self.status = next;
        Ok(())
    }

    pub(crate) fn set_run_id(&mut self, run_id: String) -> Result<(), DataConflictError> {
        set_once(&mut self.run_id, "run_id", run_id)
    }

    pub(crate) fn set_run_date(&mut self, run_date: NaiveDate) -> Result<(), DataConflictError> {
        set_once(&mut self.run_date, "run_date", run_date)
    }

    pub(crate) fn set_input_location(&mut self, location: String) -> Result<(), DataConflictError> {
        set_once(&mut self.input_location, "input_location", location)
    }

    pub(crate) fn set_output_location(&mut self, location: String) -> Result<(), DataConflictError> {
        set_once(&mut self.output_location, "output_location", location)
    }

    pub(crate) fn set_export_result(&mut self, result: ExportResult) -> Result<(), DataConflictError> {
        set_once(&mut self.export_result, "export_result", result)
    }

    pub(crate) fn set_compute_result(
        &mut self,
        result: ComputeResult,
    ) -> Result<(), DataConflictError> {
        set_once(&mut self.compute_result, "compute_result", result)
    }

    pub(crate) fn set_notify_result(&mut self, result: NotifyResult) -> Result<(), DataConflictError> {
        set_once(&mut self.notify_result, "notify_result", result)
    }

    /// Records the failure that decides the run. The first failure wins.
    pub(crate) fn record_failure(&mut self, failure: FailureRecord) -> Result<(), DataConflictError> {
        set_once(&mut self.failure, "failure", failure)
    }

    pub(crate) fn record_notify_error(&mut self, error: StageError) -> Result<(), DataConflictError> {
        set_once(&mut self.notify_error, "notify_error", error)
    }

    /// Moves `notifying` to its terminal status and stamps `finished_at`.
    ///
    /// The outcome follows from whether a failure was recorded, so a failed
    /// status always carries its failure and a succeeded one never does.
    pub(crate) fn finish(&mut self) -> Result<RunStatus, TransitionError> {
        let terminal = if self.failure.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        self.transition(terminal)?;
        self.finished_at = Some(now_utc());
        Ok(terminal)
    }
}
