//! Testing utilities for scoreflow pipelines.
//!
//! This module provides:
//! - Scripted stage doubles with call counters
//! - In-memory collaborators
//! - Run assertions and a pipeline fixture

mod assertions;
mod fakes;
mod fixtures;
mod mocks;

pub use assertions::{assert_failed, assert_succeeded, assert_terminal};
pub use fakes::{
    InMemoryObjectStore, InMemoryParameterStore, RecordingChannel, ScriptedJobRunner,
    ScriptedWarehouse,
};
pub use fixtures::{fixture_run_date, test_config, TestPipeline, TEST_SCORED_NAMESPACE};
pub use mocks::{MockComputeStage, MockExportStage, MockNotifyStage};
