//! Structured cancellation utilities.
//!
//! This module provides the `CancellationToken` the coordinator hands to
//! every stage invocation.

mod token;

pub use token::{CancelCallback, CancellationToken};
