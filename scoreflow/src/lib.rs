//! # Scoreflow
//!
//! Coordinates a daily batch scoring pipeline: export a dated snapshot from
//! the warehouse, score it with a containerized job, then notify the outcome.
//!
//! Scoreflow provides:
//!
//! - **A typed run context**: write-once run facts and a status state machine
//! - **Pluggable stages**: export, compute and notify behind async traits
//! - **Deadline enforcement**: cooperative cancellation with a bounded grace period
//! - **Idempotent locations**: re-running a run id targets the same output
//! - **Event-driven observability**: lifecycle events through an [`events::EventSink`]
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use scoreflow::prelude::*;
//!
//! let coordinator = PipelineCoordinator::builder()
//!     .export(export_stage)
//!     .compute(compute_stage)
//!     .notify(notify_stage)
//!     .parameters(parameter_store)
//!     .config(PipelineConfig::default())
//!     .build()?;
//!
//! let ctx = coordinator.run(RunParameters::new()).await;
//! println!("{}", ctx.status());
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, missing_docs, rust_2018_idioms)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod backends;
pub mod cancellation;
pub mod config;
pub mod context;
pub mod core;
pub mod errors;
pub mod events;
pub mod interceptors;
pub mod observability;
pub mod pipeline;
pub mod ports;
pub mod stages;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{EmptyResultPolicy, PipelineConfig};
    pub use crate::context::{output_location, RunContext, RunParameters};
    pub use crate::core::{FailureRecord, RunStatus, StageName};
    pub use crate::errors::{ErrorKind, ScoreflowError, StageError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::interceptors::Retrying;
    pub use crate::pipeline::{PipelineCoordinator, RetryConfig};
    pub use crate::ports::{
        JobRunner, NotificationChannel, ObjectStore, ParameterStore, Warehouse,
    };
    pub use crate::stages::{
        ComputeResult, ComputeStage, ExportResult, ExportStage, NotifyResult, NotifyStage,
    };
}
