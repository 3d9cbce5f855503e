//! Coordinator scenarios over scripted stage doubles.

use futures::future::join_all;
use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio::time::Instant;

use scoreflow::config::{ParameterKeys, PipelineConfig};
use scoreflow::context::RunParameters;
use scoreflow::core::{RunStatus, StageName};
use scoreflow::errors::ErrorKind;
use scoreflow::events::{NOTIFY_FAILED, PIPELINE_COMPLETED, PIPELINE_STARTED, STAGE_FAILED};
use scoreflow::testing::{
    assert_failed, assert_succeeded, fixture_run_date, test_config, MockComputeStage,
    MockExportStage, MockNotifyStage, TestPipeline,
};

fn short_deadline() -> PipelineConfig {
    let mut config = test_config();
    config.deadline_seconds = 60.0;
    config.cancel_grace_seconds = 5.0;
    config.export.timeout_seconds = 30.0;
    config.compute.timeout_seconds = 60.0;
    config
}

#[tokio::test]
async fn test_successful_run_records_every_stage() {
    let pipeline = TestPipeline::new();
    let coordinator = pipeline.build();

    let ctx = coordinator
        .run(
            RunParameters::new()
                .with_run_id("R1")
                .with_run_date(fixture_run_date()),
        )
        .await;

    assert_succeeded(&ctx);
    assert_eq!(ctx.run_id(), Some("R1"));
    assert_eq!(ctx.run_date(), Some(fixture_run_date()));
    assert_eq!(ctx.input_location(), Some("/raw/R1"));
    assert_eq!(ctx.output_location(), Some("/scored/run_id=R1/"));
    assert!(ctx.export_result().is_some());
    assert!(ctx.compute_result().is_some());
    assert!(ctx.notify_result().is_some());
    assert!(ctx.finished_at().is_some());

    assert_eq!(
        pipeline.compute.locations(),
        vec![("/raw/R1".to_string(), "/scored/run_id=R1/".to_string())]
    );
    assert_eq!(pipeline.notify.calls(), 1);
    assert_eq!(pipeline.notify.seen()[0].status(), RunStatus::Notifying);

    let types = pipeline.events.event_types();
    assert_eq!(types.first().map(String::as_str), Some(PIPELINE_STARTED));
    assert_eq!(types.last().map(String::as_str), Some(PIPELINE_COMPLETED));
    assert_eq!(pipeline.events.events_of_type(PIPELINE_COMPLETED).len(), 1);
}

#[tokio::test]
async fn test_export_failure_skips_compute_but_notifies() {
    let pipeline = TestPipeline::new().with_export(MockExportStage::failing(
        ErrorKind::ExportUnavailable,
        "warehouse unreachable",
    ));
    let coordinator = pipeline.build();

    let ctx = coordinator.run(RunParameters::new()).await;

    assert_failed(&ctx, StageName::Export, ErrorKind::ExportUnavailable);
    assert_eq!(ctx.failure().map(|f| f.cause.as_str()), Some("warehouse unreachable"));
    assert_eq!(ctx.output_location(), None);
    assert_eq!(pipeline.compute.calls(), 0);
    assert_eq!(pipeline.notify.calls(), 1);
    assert!(pipeline.notify.seen()[0].failure().is_some());

    let failed = pipeline.events.events_of_type(STAGE_FAILED);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].1["stage"], "export");
}

#[tokio::test]
async fn test_compute_failure_keeps_export_facts() {
    let pipeline = TestPipeline::new().with_compute(MockComputeStage::failing(
        ErrorKind::ComputeJobFailed,
        "exit code 137",
    ));
    let coordinator = pipeline.build();

    let ctx = coordinator.run(RunParameters::new().with_run_id("R2")).await;

    assert_failed(&ctx, StageName::Compute, ErrorKind::ComputeJobFailed);
    assert_eq!(ctx.run_id(), Some("R2"));
    assert_eq!(ctx.input_location(), Some("/raw/R1"));
    assert_eq!(ctx.output_location(), Some("/scored/run_id=R2/"));
    assert!(ctx.compute_result().is_none());
    assert_eq!(pipeline.notify.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_during_compute_cancels_and_times_out() {
    let pipeline = TestPipeline::new()
        .with_compute(MockComputeStage::hanging())
        .with_config(short_deadline());
    let coordinator = pipeline.build();
    let start = Instant::now();

    let ctx = coordinator.run(RunParameters::new().with_run_id("R3")).await;

    assert_failed(&ctx, StageName::Compute, ErrorKind::Timeout);
    assert!(pipeline.compute.observed_cancellation());
    assert_eq!(pipeline.notify.calls(), 1);
    assert!(start.elapsed() >= Duration::from_secs(60));
    assert!(start.elapsed() < Duration::from_secs(65));
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_stage_is_cut_off_after_grace() {
    let pipeline = TestPipeline::new()
        .with_compute(MockComputeStage::unresponsive())
        .with_config(short_deadline());
    let coordinator = pipeline.build();
    let start = Instant::now();

    let ctx = coordinator.run(RunParameters::new()).await;

    assert_failed(&ctx, StageName::Compute, ErrorKind::Timeout);
    assert!(start.elapsed() >= Duration::from_secs(65));
    assert!(start.elapsed() < Duration::from_secs(70));
    assert_eq!(pipeline.notify.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_during_export_never_starts_compute() {
    let pipeline = TestPipeline::new()
        .with_export(MockExportStage::hanging())
        .with_config(short_deadline());
    let coordinator = pipeline.build();

    let ctx = coordinator.run(RunParameters::new()).await;

    assert_failed(&ctx, StageName::Export, ErrorKind::Timeout);
    assert!(pipeline.export.observed_cancellation());
    assert_eq!(pipeline.compute.calls(), 0);
    assert_eq!(ctx.run_id(), None);
}

#[tokio::test(start_paused = true)]
async fn test_slow_export_within_deadline_succeeds() {
    let pipeline = TestPipeline::new()
        .with_export(MockExportStage::delayed(Duration::from_secs(20), "R4", "/raw/R4"))
        .with_config(short_deadline());
    let coordinator = pipeline.build();

    let ctx = coordinator.run(RunParameters::new()).await;

    assert_succeeded(&ctx);
    assert!(!pipeline.export.observed_cancellation());
}

#[tokio::test]
async fn test_notify_failure_does_not_change_status() {
    let pipeline = TestPipeline::new().with_notify(MockNotifyStage::failing(
        ErrorKind::NotifyDeliveryFailed,
        "topic not found",
    ));
    let coordinator = pipeline.build();

    let ctx = coordinator.run(RunParameters::new()).await;

    assert_succeeded(&ctx);
    let err = ctx.notify_error().cloned().unwrap();
    assert_eq!(err.kind, ErrorKind::NotifyDeliveryFailed);
    assert_eq!(pipeline.notify.calls(), 1);
    assert_eq!(pipeline.events.events_of_type(NOTIFY_FAILED).len(), 1);
}

#[tokio::test]
async fn test_notify_failure_after_failed_run_keeps_original_failure() {
    let pipeline = TestPipeline::new()
        .with_export(MockExportStage::failing(ErrorKind::ExportEmptyResult, "no rows"))
        .with_notify(MockNotifyStage::failing(ErrorKind::NotifyDeliveryFailed, "down"));
    let coordinator = pipeline.build();

    let ctx = coordinator.run(RunParameters::new()).await;

    assert_failed(&ctx, StageName::Export, ErrorKind::ExportEmptyResult);
    assert!(ctx.notify_error().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_notify_is_time_boxed() {
    let pipeline = TestPipeline::new().with_notify(MockNotifyStage::unresponsive());
    let coordinator = pipeline.build();
    let start = Instant::now();

    let ctx = coordinator.run(RunParameters::new()).await;

    assert_succeeded(&ctx);
    assert_eq!(
        ctx.notify_error().map(|e| e.kind),
        Some(ErrorKind::NotifyDeliveryFailed)
    );
    assert!(start.elapsed() >= Duration::from_secs(30));
}

#[tokio::test]
async fn test_rerun_with_same_run_id_targets_same_output() {
    let pipeline = TestPipeline::new();
    let coordinator = pipeline.build();

    let first = coordinator.run(RunParameters::new().with_run_id("R9")).await;
    let second = coordinator.run(RunParameters::new().with_run_id("R9")).await;

    assert_succeeded(&first);
    assert_succeeded(&second);
    assert_eq!(first.output_location(), second.output_location());
    assert_ne!(first.execution_id(), second.execution_id());
}

#[tokio::test]
async fn test_missing_parameter_fails_preflight() {
    let pipeline = TestPipeline::new();
    pipeline.parameters.remove(&ParameterKeys::default().sql);
    let coordinator = pipeline.build();

    let ctx = coordinator.run(RunParameters::new()).await;

    assert_failed(&ctx, StageName::Preflight, ErrorKind::ConfigurationMissing);
    assert!(ctx
        .failure()
        .is_some_and(|f| f.cause.contains("/trust_scoring/sql")));
    assert_eq!(pipeline.export.calls(), 0);
    assert_eq!(pipeline.compute.calls(), 0);
    assert_eq!(pipeline.notify.calls(), 1);
}

#[tokio::test]
async fn test_concurrent_runs_are_isolated() {
    let pipeline = TestPipeline::new();
    let coordinator = pipeline.build();

    let runs = (0..8).map(|i| {
        coordinator.run(RunParameters::new().with_run_id(format!("R{i}")))
    });
    let contexts = join_all(runs).await;

    for (i, ctx) in contexts.iter().enumerate() {
        assert_succeeded(ctx);
        assert_eq!(
            ctx.output_location().map(str::to_string),
            Some(format!("/scored/run_id=R{i}/"))
        );
    }
    assert_eq!(pipeline.export.calls(), 8);
    assert_eq!(pipeline.notify.calls(), 8);
    assert_eq!(pipeline.events.events_of_type(PIPELINE_COMPLETED).len(), 8);
}
