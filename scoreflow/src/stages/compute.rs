//! Containerized scoring job.

use super::{elapsed_ms, ComputeResult, ComputeStage};
use crate::cancellation::CancellationToken;
use crate::config::ComputeConfig;
use crate::context::RunContext;
use crate::errors::{ErrorKind, StageError};
use crate::ports::{JobHandle, JobRunner, JobSpec, JobStatus, ObjectStore, PortError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Environment variable carrying the snapshot location.
pub const INPUT_PREFIX_VAR: &str = "INPUT_PREFIX";
/// Environment variable carrying the output location.
pub const OUTPUT_PREFIX_VAR: &str = "OUTPUT_PREFIX";

/// Runs the scoring container through a [`JobRunner`] and waits for it.
pub struct ContainerComputeStage {
    runner: Arc<dyn JobRunner>,
    store: Arc<dyn ObjectStore>,
    config: ComputeConfig,
}

enum Interrupt {
    Timeout,
    Cancelled(String),
}

impl ContainerComputeStage {
    /// Creates a compute stage.
    #[must_use]
    pub fn new(runner: Arc<dyn JobRunner>, store: Arc<dyn ObjectStore>, config: ComputeConfig) -> Self {
        Self {
            runner,
            store,
            config,
        }
    }

    /// Builds the job description for one run.
    ///
    /// The two prefix variables always reflect the locations passed in,
    /// whatever the static environment says.
    #[must_use]
    pub fn job_spec(&self, run_id: Option<&str>, input_location: &str, output_location: &str) -> JobSpec {
        let mut environment = BTreeMap::new();
        environment.insert("TEXT_COL".to_string(), self.config.text_column.clone());
        if let Some(models) = &self.config.models_prefix {
            environment.insert("MODELS_S3_PREFIX".to_string(), models.clone());
        }
        if let Some(run_id) = run_id {
            environment.insert("RUN_ID".to_string(), run_id.to_string());
        }
        environment.extend(self.config.environment.clone());
        environment.insert(INPUT_PREFIX_VAR.to_string(), input_location.to_string());
        environment.insert(OUTPUT_PREFIX_VAR.to_string(), output_location.to_string());

        JobSpec {
            image: self.config.image.clone(),
            command: self.config.command.clone(),
            environment,
        }
    }

    async fn wait_for_job(&self, handle: &dyn JobHandle) -> Result<Option<i32>, StageError> {
        let interval = self.config.poll_interval();
        loop {
            match handle.status().await {
                Ok(JobStatus::Succeeded) => return Ok(Some(0)),
                Ok(JobStatus::Failed { exit_code, reason }) => {
                    let code = exit_code.map_or_else(|| "none".to_string(), |c| c.to_string());
                    return Err(StageError::new(
                        ErrorKind::ComputeJobFailed,
                        format!("job {} failed (exit code {code}): {reason}", handle.id()),
                    ));
                }
                Ok(status) => debug!(job_id = %handle.id(), status = ?status, "Polled compute job"),
                Err(PortError::NotFound(msg)) => {
                    return Err(StageError::new(
                        ErrorKind::ComputeJobFailed,
                        format!("job {} disappeared: {msg}", handle.id()),
                    ))
                }
                Err(e) => warn!(job_id = %handle.id(), error = %e, "Job status poll failed"),
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn stop_job(handle: &dyn JobHandle, reason: &str) {
        if let Err(e) = handle.stop(reason).await {
            warn!(job_id = %handle.id(), error = %e, "Failed to stop compute job");
        }
    }

    async fn collect(
        &self,
        handle: &dyn JobHandle,
        output_location: &str,
    ) -> Result<(Option<i32>, usize), StageError> {
        let exit_code = self.wait_for_job(handle).await?;
        Ok((exit_code, self.count_outputs(output_location).await))
    }

    fn timeout_error(&self, what: &str) -> StageError {
        StageError::new(
            ErrorKind::ComputeTimeout,
            format!("{what} did not finish within {}s", self.config.timeout_seconds),
        )
    }

    async fn count_outputs(&self, output_location: &str) -> usize {
        match self.store.list(output_location).await {
            Ok(entries) => entries.len(),
            Err(e) => {
                warn!(output_location = %output_location, error = %e, "Failed to list compute outputs");
                0
            }
        }
    }
}

#[async_trait]
impl ComputeStage for ContainerComputeStage {
    async fn run(
        &self,
        ctx: &RunContext,
        input_location: &str,
        output_location: &str,
        cancel: &CancellationToken,
    ) -> Result<ComputeResult, StageError> {
        let start = Instant::now();
        let stage_deadline = start + self.config.timeout();
        let spec = self.job_spec(ctx.run_id(), input_location, output_location);

        let submitted = tokio::select! {
            result = self.runner.submit(&spec) => result,
            () = tokio::time::sleep_until(stage_deadline) => {
                return Err(self.timeout_error("job submission"));
            }
            () = cancel.cancelled() => {
                return Err(StageError::deadline(format!(
                    "compute cancelled before submission: {}",
                    cancel.reason().unwrap_or_default()
                )));
            }
        };
        let handle = submitted.map_err(|e| {
            StageError::new(ErrorKind::ComputeSchedulingFailed, e.to_string())
        })?;
        let job_id = handle.id().to_string();
        info!(job_id = %job_id, input = %input_location, output = %output_location, "Submitted compute job");

        let waited = tokio::select! {
            result = self.collect(handle.as_ref(), output_location) => Ok(result),
            () = tokio::time::sleep_until(stage_deadline) => Err(Interrupt::Timeout),
            () = cancel.cancelled() => Err(Interrupt::Cancelled(cancel.reason().unwrap_or_default())),
        };

        let (exit_code, outputs) = match waited {
            Ok(result) => result?,
            Err(Interrupt::Timeout) => {
                Self::stop_job(handle.as_ref(), "compute stage timeout").await;
                return Err(self.timeout_error(&format!("job {job_id}")));
            }
            Err(Interrupt::Cancelled(reason)) => {
                Self::stop_job(handle.as_ref(), &reason).await;
                return Err(StageError::deadline(format!("compute cancelled: {reason}")));
            }
        };

        if outputs == 0 {
            warn!(job_id = %job_id, output_location = %output_location, "Compute job wrote no outputs");
        }

        let mut result = ComputeResult::new(job_id)
            .with_output_objects(outputs)
            .with_duration_ms(elapsed_ms(start));
        if let Some(code) = exit_code {
            result = result.with_exit_code(code);
        }
        Ok(result)
    }
}
