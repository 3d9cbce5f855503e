//! Stage traits and reference implementations.
//!
//! The coordinator drives exactly three stages. Each is a trait so runs can
//! be wired to real infrastructure, local processes or test doubles.

mod compute;
mod export;
mod notify;
mod result;

pub use compute::{ContainerComputeStage, INPUT_PREFIX_VAR, OUTPUT_PREFIX_VAR};
pub use export::{render_unload, unload_target, WarehouseExportStage};
pub use notify::{render_message, TopicNotifyStage};
pub use result::{ComputeResult, ExportResult, NotifyResult};

use crate::cancellation::CancellationToken;
use crate::context::RunContext;
use crate::errors::StageError;
use async_trait::async_trait;
use std::sync::Arc;

/// Extracts a dataset snapshot into object storage.
#[async_trait]
pub trait ExportStage: Send + Sync {
    /// Returns the name used in logs and events.
    fn name(&self) -> &str {
        "export"
    }

    /// Runs the extraction.
    ///
    /// Must stop any in-flight external work when `cancel` fires.
    async fn run(
        &self,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<ExportResult, StageError>;
}

/// Runs the scoring job over an exported snapshot.
#[async_trait]
pub trait ComputeStage: Send + Sync {
    /// Returns the name used in logs and events.
    fn name(&self) -> &str {
        "compute"
    }

    /// Runs the job, reading `input_location` and writing under
    /// `output_location`. Blocks until the job terminates.
    async fn run(
        &self,
        ctx: &RunContext,
        input_location: &str,
        output_location: &str,
        cancel: &CancellationToken,
    ) -> Result<ComputeResult, StageError>;
}

/// Delivers the final status summary.
#[async_trait]
pub trait NotifyStage: Send + Sync {
    /// Returns the name used in logs and events.
    fn name(&self) -> &str {
        "notify"
    }

    /// Sends the summary for a run whose outcome is already decided.
    async fn run(
        &self,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<NotifyResult, StageError>;
}

#[async_trait]
impl<T: ExportStage + ?Sized> ExportStage for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn run(
        &self,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<ExportResult, StageError> {
        (**self).run(ctx, cancel).await
    }
}

#[async_trait]
impl<T: ComputeStage + ?Sized> ComputeStage for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn run(
        &self,
        ctx: &RunContext,
        input_location: &str,
        output_location: &str,
        cancel: &CancellationToken,
    ) -> Result<ComputeResult, StageError> {
        (**self).run(ctx, input_location, output_location, cancel).await
    }
}

#[async_trait]
impl<T: NotifyStage + ?Sized> NotifyStage for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn run(
        &self,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<NotifyResult, StageError> {
        (**self).run(ctx, cancel).await
    }
}

pub(crate) fn elapsed_ms(start: tokio::time::Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}
