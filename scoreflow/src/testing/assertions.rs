//! Assertions over finished runs.

use crate::context::RunContext;
use crate::core::{RunStatus, StageName};
use crate::errors::ErrorKind;

/// Asserts the invariants every finished run must hold.
///
/// The status is terminal, `finished_at` is set and a failure is recorded
/// exactly when the run failed.
pub fn assert_terminal(ctx: &RunContext) {
    assert!(
        ctx.is_terminal(),
        "Expected a terminal status, got {}",
        ctx.status()
    );
    assert!(ctx.finished_at().is_some(), "Expected finished_at to be set");
    assert_eq!(
        ctx.failure().is_some(),
        ctx.status() == RunStatus::Failed,
        "Failure record must be present iff the run failed (status {}, failure {:?})",
        ctx.status(),
        ctx.failure()
    );
}

/// Asserts the run succeeded.
pub fn assert_succeeded(ctx: &RunContext) {
    assert_terminal(ctx);
    assert_eq!(
        ctx.status(),
        RunStatus::Succeeded,
        "Expected success, got failure {:?}",
        ctx.failure()
    );
}

/// Asserts the run failed in `stage` with `kind`.
pub fn assert_failed(ctx: &RunContext, stage: StageName, kind: ErrorKind) {
    assert_terminal(ctx);
    match ctx.failure() {
        Some(failure) => {
            assert_eq!(failure.stage, stage, "Unexpected failing stage: {failure}");
            assert_eq!(failure.kind, kind, "Unexpected failure kind: {failure}");
        }
        None => panic!("Expected a failure in {stage}, but the run {}", ctx.status()),
    }
}
