//! Retry decorator for a single stage.

use crate::cancellation::CancellationToken;
use crate::context::RunContext;
use crate::errors::StageError;
use crate::pipeline::{retry_while, RetryConfig};
use crate::stages::{
    ComputeResult, ComputeStage, ExportResult, ExportStage, NotifyResult, NotifyStage,
};
use async_trait::async_trait;

/// Wraps a stage and retries its retryable failures.
///
/// Only kinds for which [`StageError::is_retryable`] holds are retried, and
/// nothing is retried once the run token is cancelled. The whole retry loop
/// still runs under the coordinator's deadline.
#[derive(Debug)]
pub struct Retrying<S> {
    inner: S,
    config: RetryConfig,
}

impl<S> Retrying<S> {
    /// Wraps `inner` with the given retry policy.
    #[must_use]
    pub const fn new(inner: S, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    /// Returns the wrapped stage.
    #[must_use]
    pub const fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: ExportStage> ExportStage for Retrying<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn run(
        &self,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<ExportResult, StageError> {
        let inner = &self.inner;
        retry_while(
            &self.config,
            inner.name(),
            cancel,
            StageError::is_retryable,
            move || inner.run(ctx, cancel),
        )
        .await
    }
}

#[async_trait]
impl<S: ComputeStage> ComputeStage for Retrying<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn run(
        &self,
        ctx: &RunContext,
        input_location: &str,
        output_location: &str,
        cancel: &CancellationToken,
    ) -> Result<ComputeResult, StageError> {
        let inner = &self.inner;
        retry_while(
            &self.config,
            inner.name(),
            cancel,
            StageError::is_retryable,
            move || inner.run(ctx, input_location, output_location, cancel),
        )
        .await
    }
}

#[async_trait]
impl<S: NotifyStage> NotifyStage for Retrying<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn run(
        &self,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<NotifyResult, StageError> {
        let inner = &self.inner;
        retry_while(
            &self.config,
            inner.name(),
            cancel,
            StageError::is_retryable,
            move || inner.run(ctx, cancel),
        )
        .await
    }
}
