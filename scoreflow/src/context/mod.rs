//! Run context and location derivation.
//!
//! This module provides:
//! - `RunContext`, the typed record carried from stage to stage
//! - `RunParameters`, the caller's inputs
//! - Pure functions deriving run-scoped storage locations

mod locations;
mod run;

pub use locations::{
    bucket_namespace, is_data_object, output_location, snapshot_prefix, Location,
    SNAPSHOT_OBJECT_STEM,
};
pub use run::{RunContext, RunParameters};
