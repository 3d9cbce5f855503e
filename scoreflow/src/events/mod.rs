//! Pipeline lifecycle events.
//!
//! The coordinator reports progress through an [`EventSink`]. Every payload
//! carries the `execution_id` and, once export has produced one, the
//! `run_id`.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Emitted once when a run begins.
pub const PIPELINE_STARTED: &str = "pipeline.started";
/// Emitted when a stage is invoked.
pub const STAGE_STARTED: &str = "stage.started";
/// Emitted when a stage returns a result.
pub const STAGE_COMPLETED: &str = "stage.completed";
/// Emitted when a stage fails, times out or is cut off by the deadline.
pub const STAGE_FAILED: &str = "stage.failed";
/// Emitted when the final notification could not be delivered.
pub const NOTIFY_FAILED: &str = "notify.failed";
/// Emitted once when a run reaches a terminal status.
pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
