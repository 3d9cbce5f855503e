//! The pipeline coordinator.
//!
//! Sequences export, compute and notify over one [`RunContext`], enforces the
//! overall deadline and folds every stage failure into a terminal status.
//! `run` never returns an error: the returned context is the report.

use crate::cancellation::CancellationToken;
use crate::config::PipelineConfig;
use crate::context::{bucket_namespace, output_location, RunContext, RunParameters};
use crate::core::{FailureRecord, RunStatus, StageName};
use crate::errors::{ErrorKind, ScoreflowError, StageError};
use crate::events::{
    EventSink, LoggingEventSink, NOTIFY_FAILED, PIPELINE_COMPLETED, PIPELINE_STARTED,
    STAGE_COMPLETED, STAGE_FAILED, STAGE_STARTED,
};
use crate::ports::{require_parameter, ParameterStore, RequiredParameterError};
use crate::stages::{ComputeStage, ExportResult, ExportStage, NotifyStage};
use crate::utils::validate_run_id;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Drives a run through its stages.
///
/// The coordinator holds no per-run state, so one instance can serve many
/// concurrent runs.
pub struct PipelineCoordinator {
    export: Arc<dyn ExportStage>,
    compute: Arc<dyn ComputeStage>,
    notify: Arc<dyn NotifyStage>,
    parameters: Arc<dyn ParameterStore>,
    config: PipelineConfig,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for PipelineCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCoordinator")
            .field("export", &self.export.name())
            .field("compute", &self.compute.name())
            .field("notify", &self.notify.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PipelineCoordinator {
    /// Starts building a coordinator.
    #[must_use]
    pub fn builder() -> PipelineCoordinatorBuilder {
        PipelineCoordinatorBuilder::default()
    }

    /// Returns the configuration runs are executed with.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Executes one run to a terminal status.
    pub async fn run(&self, params: RunParameters) -> RunContext {
        let mut ctx = RunContext::new(params);
        let deadline = Instant::now() + self.config.deadline();
        let token = CancellationToken::new();

        info!(
            execution_id = %ctx.execution_id(),
            requested_run_id = ?ctx.params().run_id,
            "Pipeline run started"
        );
        self.events
            .emit(PIPELINE_STARTED, event_payload(&ctx, None, json!({})))
            .await;

        let preflight = self
            .supervise(StageName::Preflight, self.preflight(ctx.params()), &token, deadline)
            .await;
        match preflight {
            Ok(scored_namespace) => {
                self.run_stages(&mut ctx, &scored_namespace, &token, deadline)
                    .await;
            }
            Err(err) => self.fail(&mut ctx, StageName::Preflight, &err).await,
        }

        self.notify(&mut ctx).await;

        let status = match ctx.finish() {
            Ok(status) => status,
            Err(e) => {
                error!(execution_id = %ctx.execution_id(), error = %e, "Could not finish run");
                ctx.status()
            }
        };

        info!(
            execution_id = %ctx.execution_id(),
            run_id = ?ctx.run_id(),
            status = %status,
            duration_ms = ?ctx.duration_ms(),
            "Pipeline run finished"
        );
        self.events
            .emit(
                PIPELINE_COMPLETED,
                event_payload(&ctx, None, json!({ "duration_ms": ctx.duration_ms() })),
            )
            .await;
        ctx
    }

    async fn run_stages(
        &self,
        ctx: &mut RunContext,
        scored_namespace: &str,
        token: &CancellationToken,
        deadline: Instant,
    ) {
        advance(ctx, RunStatus::Exporting);
        if self.deadline_passed(ctx, StageName::Export, token, deadline).await {
            return;
        }
        self.stage_started(ctx, StageName::Export).await;
        let exported = self
            .supervise(StageName::Export, self.export.run(ctx, token), token, deadline)
            .await;
        match exported {
            Ok(result) => {
                let payload = json!({
                    "input_location": result.input_location,
                    "reused_snapshot": result.reused_snapshot,
                    "duration_ms": result.duration_ms,
                });
                if let Err(e) = apply_export(ctx, result, scored_namespace) {
                    let err = StageError::new(ErrorKind::ExportUnavailable, e.to_string());
                    self.fail(ctx, StageName::Export, &err).await;
                    return;
                }
                self.stage_completed(ctx, StageName::Export, payload).await;
            }
            Err(err) => {
                self.fail(ctx, StageName::Export, &err).await;
                return;
            }
        }

        advance(ctx, RunStatus::Computing);
        if self.deadline_passed(ctx, StageName::Compute, token, deadline).await {
            return;
        }
        let input = ctx.input_location().unwrap_or_default().to_string();
        let output = ctx.output_location().unwrap_or_default().to_string();
        self.stage_started(ctx, StageName::Compute).await;
        let computed = self
            .supervise(
                StageName::Compute,
                self.compute.run(ctx, &input, &output, token),
                token,
                deadline,
            )
            .await;
        match computed {
            Ok(result) => {
                let payload = json!({
                    "job_id": result.job_id,
                    "output_objects": result.output_objects,
                    "duration_ms": result.duration_ms,
                });
                if let Err(e) = ctx.set_compute_result(result) {
                    error!(execution_id = %ctx.execution_id(), error = %e, "Could not store compute result");
                }
                self.stage_completed(ctx, StageName::Compute, payload).await;
                advance(ctx, RunStatus::Notifying);
            }
            Err(err) => self.fail(ctx, StageName::Compute, &err).await,
        }
    }

    /// Sends the final notification exactly once. Its outcome never changes
    /// the decided status.
    async fn notify(&self, ctx: &mut RunContext) {
        let token = CancellationToken::new();
        let timeout = self.config.notify_timeout();
        self.stage_started(ctx, StageName::Notify).await;

        let outcome = tokio::select! {
            result = self.notify.run(ctx, &token) => result,
            () = tokio::time::sleep(timeout) => {
                token.cancel("notification time box elapsed");
                Err(StageError::new(
                    ErrorKind::NotifyDeliveryFailed,
                    format!("notification did not complete within {}s", self.config.notify_timeout_seconds),
                ))
            }
        };

        match outcome {
            Ok(result) => {
                let payload = json!({ "message_id": result.message_id, "attempts": result.attempts });
                if let Err(e) = ctx.set_notify_result(result) {
                    error!(execution_id = %ctx.execution_id(), error = %e, "Could not store notify result");
                }
                self.stage_completed(ctx, StageName::Notify, payload).await;
            }
            Err(err) => {
                warn!(
                    execution_id = %ctx.execution_id(),
                    run_id = ?ctx.run_id(),
                    kind = %err.kind,
                    error = %err.message,
                    "Notification failed"
                );
                let payload = json!({ "kind": err.kind.code(), "cause": err.message });
                if let Err(e) = ctx.record_notify_error(err) {
                    error!(execution_id = %ctx.execution_id(), error = %e, "Could not store notify error");
                }
                self.events
                    .emit(NOTIFY_FAILED, event_payload(ctx, Some(StageName::Notify), payload))
                    .await;
            }
        }
    }

    async fn preflight(&self, params: &RunParameters) -> Result<String, StageError> {
        for key in self.config.parameters.required_keys() {
            self.require(&key).await?;
        }
        if let Some(run_id) = &params.run_id {
            validate_run_id(run_id)
                .map_err(|e| StageError::new(ErrorKind::ConfigurationMissing, e.to_string()))?;
        }
        match &self.config.namespaces.scored_location {
            Some(location) => Ok(location.clone()),
            None => {
                let bucket = self.require(&self.config.parameters.data_bucket).await?;
                Ok(bucket_namespace(&bucket, &self.config.namespaces.scored))
            }
        }
    }

    async fn require(&self, key: &str) -> Result<String, StageError> {
        require_parameter(self.parameters.as_ref(), key)
            .await
            .map_err(|e| match e {
                RequiredParameterError::Missing(key) => StageError::configuration_missing(&key),
                other @ RequiredParameterError::Lookup { .. } => {
                    StageError::new(ErrorKind::ConfigurationMissing, other.to_string())
                }
            })
    }

    /// Awaits a stage under the run deadline.
    ///
    /// When the deadline fires first the run token is cancelled and the stage
    /// gets `cancel_grace` to wind down before the result is recorded as a
    /// timeout. A stage that returns after the token fired is also a timeout.
    async fn supervise<T, F>(
        &self,
        stage: StageName,
        fut: F,
        token: &CancellationToken,
        deadline: Instant,
    ) -> Result<T, StageError>
    where
        F: Future<Output = Result<T, StageError>>,
    {
        tokio::pin!(fut);
        tokio::select! {
            biased;
            result = &mut fut => {
                if token.is_cancelled() {
                    return Err(self.deadline_error(stage));
                }
                result
            }
            () = tokio::time::sleep_until(deadline) => {
                token.cancel(format!("run deadline elapsed during {stage}"));
                if tokio::time::timeout(self.config.cancel_grace(), &mut fut).await.is_err() {
                    warn!(stage = %stage, "Stage did not stop within the cancellation grace period");
                }
                Err(self.deadline_error(stage))
            }
        }
    }

    fn deadline_error(&self, stage: StageName) -> StageError {
        StageError::deadline(format!(
            "run deadline of {}s elapsed during {stage}",
            self.config.deadline_seconds
        ))
    }

    async fn deadline_passed(
        &self,
        ctx: &mut RunContext,
        stage: StageName,
        token: &CancellationToken,
        deadline: Instant,
    ) -> bool {
        if token.is_cancelled() || Instant::now() >= deadline {
            token.cancel(format!("run deadline elapsed before {stage}"));
            self.fail(ctx, stage, &self.deadline_error(stage)).await;
            return true;
        }
        false
    }

    async fn stage_started(&self, ctx: &RunContext, stage: StageName) {
        info!(execution_id = %ctx.execution_id(), run_id = ?ctx.run_id(), stage = %stage, "Stage started");
        self.events
            .emit(STAGE_STARTED, event_payload(ctx, Some(stage), json!({})))
            .await;
    }

    async fn stage_completed(&self, ctx: &RunContext, stage: StageName, details: serde_json::Value) {
        info!(execution_id = %ctx.execution_id(), run_id = ?ctx.run_id(), stage = %stage, "Stage completed");
        self.events
            .emit(STAGE_COMPLETED, event_payload(ctx, Some(stage), details))
            .await;
    }

    async fn fail(&self, ctx: &mut RunContext, stage: StageName, err: &StageError) {
        warn!(
            execution_id = %ctx.execution_id(),
            run_id = ?ctx.run_id(),
            stage = %stage,
            kind = %err.kind,
            error = %err.message,
            "Stage failed"
        );
        if let Err(e) = ctx.record_failure(FailureRecord::from_stage_error(stage, err)) {
            error!(execution_id = %ctx.execution_id(), error = %e, "Could not record failure");
        }
        self.events
            .emit(
                STAGE_FAILED,
                event_payload(ctx, Some(stage), json!({ "kind": err.kind.code(), "cause": err.message })),
            )
            .await;
        advance(ctx, RunStatus::Notifying);
    }
}

fn advance(ctx: &mut RunContext, next: RunStatus) {
    if let Err(e) = ctx.transition(next) {
        error!(execution_id = %ctx.execution_id(), error = %e, "Rejected status transition");
    }
}

fn apply_export(
    ctx: &mut RunContext,
    result: ExportResult,
    scored_namespace: &str,
) -> Result<(), ScoreflowError> {
    let output = output_location(scored_namespace, &result.run_id)?;
    ctx.set_run_id(result.run_id.clone())?;
    ctx.set_run_date(result.run_date)?;
    ctx.set_input_location(result.input_location.clone())?;
    ctx.set_output_location(output)?;
    ctx.set_export_result(result)?;
    Ok(())
}

fn event_payload(
    ctx: &RunContext,
    stage: Option<StageName>,
    details: serde_json::Value,
) -> serde_json::Value {
    let mut payload = json!({
        "execution_id": ctx.execution_id().to_string(),
        "run_id": ctx.run_id(),
        "status": ctx.status().to_string(),
    });
    if let Some(stage) = stage {
        payload["stage"] = json!(stage.as_str());
    }
    if let (Some(map), serde_json::Value::Object(extra)) = (payload.as_object_mut(), details) {
        map.extend(extra);
    }
    payload
}

/// Builds a [`PipelineCoordinator`].
#[derive(Default)]
pub struct PipelineCoordinatorBuilder {
    export: Option<Arc<dyn ExportStage>>,
    compute: Option<Arc<dyn ComputeStage>>,
    notify: Option<Arc<dyn NotifyStage>>,
    parameters: Option<Arc<dyn ParameterStore>>,
    config: Option<PipelineConfig>,
    events: Option<Arc<dyn EventSink>>,
}

impl PipelineCoordinatorBuilder {
    /// Sets the export stage.
    #[must_use]
    pub fn export(mut self, stage: Arc<dyn ExportStage>) -> Self {
        self.export = Some(stage);
        self
    }

    /// Sets the compute stage.
    #[must_use]
    pub fn compute(mut self, stage: Arc<dyn ComputeStage>) -> Self {
        self.compute = Some(stage);
        self
    }

    /// Sets the notify stage.
    #[must_use]
    pub fn notify(mut self, stage: Arc<dyn NotifyStage>) -> Self {
        self.notify = Some(stage);
        self
    }

    /// Sets the parameter store used by preflight.
    #[must_use]
    pub fn parameters(mut self, store: Arc<dyn ParameterStore>) -> Self {
        self.parameters = Some(store);
        self
    }

    /// Sets the configuration. Defaults to [`PipelineConfig::default`].
    #[must_use]
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Sets the event sink. Defaults to [`LoggingEventSink`].
    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Validates the configuration and builds the coordinator.
    ///
    /// # Errors
    ///
    /// Returns an error if a stage or the parameter store is missing, or if
    /// the configuration is invalid.
    pub fn build(self) -> Result<PipelineCoordinator, ScoreflowError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        Ok(PipelineCoordinator {
            export: self.export.ok_or(ScoreflowError::MissingComponent("export stage"))?,
            compute: self
                .compute
                .ok_or(ScoreflowError::MissingComponent("compute stage"))?,
            notify: self.notify.ok_or(ScoreflowError::MissingComponent("notify stage"))?,
            parameters: self
                .parameters
                .ok_or(ScoreflowError::MissingComponent("parameter store"))?,
            config,
            events: self
                .events
                .unwrap_or_else(|| Arc::new(LoggingEventSink::default())),
        })
    }
}
