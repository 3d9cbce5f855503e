//! Core domain model types for scoreflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Run status and stage name enums
//! - The failure record attached to failed runs

mod failure;
mod status;

pub use failure::FailureRecord;
pub use status::{RunStatus, StageName};
