//! Scripted stage doubles.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::context::RunContext;
use crate::errors::{ErrorKind, StageError};
use crate::stages::{
    ComputeResult, ComputeStage, ExportResult, ExportStage, NotifyResult, NotifyStage,
};
use super::fixtures::fixture_run_date;

/// How a double behaves when invoked.
#[derive(Debug, Clone)]
enum Script {
    Succeed,
    Fail(StageError),
    FailFirst(usize, StageError),
    Delay(Duration),
    Hang,
    IgnoreCancel,
}

#[derive(Debug)]
struct Player {
    script: Script,
    calls: AtomicUsize,
    observed_cancel: AtomicBool,
}

impl Player {
    fn new(script: Script) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
            observed_cancel: AtomicBool::new(false),
        }
    }

    async fn play(&self, cancel: &CancellationToken) -> Result<(), StageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match &self.script {
            Script::Succeed => Ok(()),
            Script::Fail(err) => Err(err.clone()),
            Script::FailFirst(n, err) if call <= *n => Err(err.clone()),
            Script::FailFirst(..) => Ok(()),
            Script::Delay(delay) => {
                tokio::select! {
                    () = tokio::time::sleep(*delay) => Ok(()),
                    () = cancel.cancelled() => Err(self.stopped()),
                }
            }
            Script::Hang => {
                cancel.cancelled().await;
                Err(self.stopped())
            }
            Script::IgnoreCancel => std::future::pending().await,
        }
    }

    fn stopped(&self) -> StageError {
        self.observed_cancel.store(true, Ordering::SeqCst);
        StageError::deadline("stopped on cancellation")
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn observed_cancellation(&self) -> bool {
        self.observed_cancel.load(Ordering::SeqCst)
    }
}

/// An export double.
///
/// On success it reports the requested run id when one was given, otherwise
/// its configured id.
#[derive(Debug)]
pub struct MockExportStage {
    player: Player,
    run_id: String,
    input_location: String,
}

impl MockExportStage {
    fn with_script(script: Script, run_id: &str, input_location: &str) -> Self {
        Self {
            player: Player::new(script),
            run_id: run_id.to_string(),
            input_location: input_location.to_string(),
        }
    }

    /// Succeeds with the given run id and input location.
    #[must_use]
    pub fn succeeding(run_id: &str, input_location: &str) -> Self {
        Self::with_script(Script::Succeed, run_id, input_location)
    }

    /// Always fails.
    #[must_use]
    pub fn failing(kind: ErrorKind, message: &str) -> Self {
        Self::with_script(Script::Fail(StageError::new(kind, message)), "", "")
    }

    /// Fails `failures` times, then succeeds.
    #[must_use]
    pub fn flaky(failures: usize, kind: ErrorKind, run_id: &str, input_location: &str) -> Self {
        Self::with_script(
            Script::FailFirst(failures, StageError::new(kind, "transient")),
            run_id,
            input_location,
        )
    }

    /// Succeeds after `delay`, unless cancelled first.
    #[must_use]
    pub fn delayed(delay: Duration, run_id: &str, input_location: &str) -> Self {
        Self::with_script(Script::Delay(delay), run_id, input_location)
    }

    /// Blocks until cancelled.
    #[must_use]
    pub fn hanging() -> Self {
        Self::with_script(Script::Hang, "", "")
    }

    /// Returns how many times the stage ran.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.player.calls()
    }

    /// Returns true if the stage stopped because it was cancelled.
    #[must_use]
    pub fn observed_cancellation(&self) -> bool {
        self.player.observed_cancellation()
    }
}

#[async_trait]
impl ExportStage for MockExportStage {
    async fn run(
        &self,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<ExportResult, StageError> {
        self.player.play(cancel).await?;
        let run_id = ctx
            .params()
            .run_id
            .clone()
            .unwrap_or_else(|| self.run_id.clone());
        let run_date = ctx.params().run_date.unwrap_or_else(fixture_run_date);
        Ok(ExportResult::new(run_id, run_date, self.input_location.clone()).with_object_count(1))
    }
}

/// A compute double that records the locations it was given.
#[derive(Debug)]
pub struct MockComputeStage {
    player: Player,
    locations: Mutex<Vec<(String, String)>>,
}

impl MockComputeStage {
    fn with_script(script: Script) -> Self {
        Self {
            player: Player::new(script),
            locations: Mutex::new(Vec::new()),
        }
    }

    /// Always succeeds.
    #[must_use]
    pub fn succeeding() -> Self {
        Self::with_script(Script::Succeed)
    }

    /// Always fails.
    #[must_use]
    pub fn failing(kind: ErrorKind, message: &str) -> Self {
        Self::with_script(Script::Fail(StageError::new(kind, message)))
    }

    /// Fails `failures` times, then succeeds.
    #[must_use]
    pub fn flaky(failures: usize, kind: ErrorKind) -> Self {
        Self::with_script(Script::FailFirst(failures, StageError::new(kind, "transient")))
    }

    /// Succeeds after `delay`, unless cancelled first.
    #[must_use]
    pub fn delayed(delay: Duration) -> Self {
        Self::with_script(Script::Delay(delay))
    }

    /// Blocks until cancelled.
    #[must_use]
    pub fn hanging() -> Self {
        Self::with_script(Script::Hang)
    }

    /// Never returns, even when cancelled.
    #[must_use]
    pub fn unresponsive() -> Self {
        Self::with_script(Script::IgnoreCancel)
    }

    /// Returns how many times the stage ran.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.player.calls()
    }

    /// Returns true if the stage stopped because it was cancelled.
    #[must_use]
    pub fn observed_cancellation(&self) -> bool {
        self.player.observed_cancellation()
    }

    /// Returns the `(input, output)` locations of every call.
    #[must_use]
    pub fn locations(&self) -> Vec<(String, String)> {
        self.locations.lock().clone()
    }
}

#[async_trait]
impl ComputeStage for MockComputeStage {
    async fn run(
        &self,
        _ctx: &RunContext,
        input_location: &str,
        output_location: &str,
        cancel: &CancellationToken,
    ) -> Result<ComputeResult, StageError> {
        self.locations
            .lock()
            .push((input_location.to_string(), output_location.to_string()));
        self.player.play(cancel).await?;
        Ok(ComputeResult::new(format!("job-{}", self.calls()))
            .with_exit_code(0)
            .with_output_objects(1))
    }
}

/// A notify double that keeps a copy of every context it was shown.
#[derive(Debug)]
pub struct MockNotifyStage {
    player: Player,
    seen: Mutex<Vec<RunContext>>,
}

impl MockNotifyStage {
    fn with_script(script: Script) -> Self {
        Self {
            player: Player::new(script),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Always succeeds.
    #[must_use]
    pub fn succeeding() -> Self {
        Self::with_script(Script::Succeed)
    }

    /// Always fails.
    #[must_use]
    pub fn failing(kind: ErrorKind, message: &str) -> Self {
        Self::with_script(Script::Fail(StageError::new(kind, message)))
    }

    /// Fails `failures` times, then succeeds.
    #[must_use]
    pub fn flaky(failures: usize) -> Self {
        Self::with_script(Script::FailFirst(
            failures,
            StageError::new(ErrorKind::NotifyDeliveryFailed, "transient"),
        ))
    }

    /// Never returns, even when cancelled.
    #[must_use]
    pub fn unresponsive() -> Self {
        Self::with_script(Script::IgnoreCancel)
    }

    /// Returns how many times the stage ran.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.player.calls()
    }

    /// Returns the contexts the stage was invoked with.
    #[must_use]
    pub fn seen(&self) -> Vec<RunContext> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl NotifyStage for MockNotifyStage {
    async fn run(
        &self,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<NotifyResult, StageError> {
        self.seen.lock().push(ctx.clone());
        self.player.play(cancel).await?;
        Ok(NotifyResult::new(format!("msg-{}", self.calls()), 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunParameters;

    #[tokio::test]
    async fn test_flaky_export_recovers() {
        let stage = MockExportStage::flaky(2, ErrorKind::ExportUnavailable, "R1", "/raw/R1");
        let ctx = RunContext::new(RunParameters::new());
        let token = CancellationToken::new();

        assert!(stage.run(&ctx, &token).await.is_err());
        assert!(stage.run(&ctx, &token).await.is_err());
        assert_eq!(stage.run(&ctx, &token).await.unwrap().run_id, "R1");
        assert_eq!(stage.calls(), 3);
    }

    #[tokio::test]
    async fn test_export_prefers_requested_run_id() {
        let stage = MockExportStage::succeeding("R1", "/raw/R1");
        let ctx = RunContext::new(RunParameters::new().with_run_id("R9"));

        let result = stage.run(&ctx, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.run_id, "R9");
    }

    #[tokio::test]
    async fn test_hanging_compute_stops_on_cancel() {
        let stage = MockComputeStage::hanging();
        let ctx = RunContext::new(RunParameters::new());
        let token = CancellationToken::new();
        token.cancel("test");

        let err = stage.run(&ctx, "/in", "/out", &token).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(stage.observed_cancellation());
        assert_eq!(stage.locations(), vec![("/in".to_string(), "/out".to_string())]);
    }
}
