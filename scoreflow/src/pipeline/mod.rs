//! Pipeline coordination and retry utilities.

mod coordinator;
mod retry;

pub use coordinator::{PipelineCoordinator, PipelineCoordinatorBuilder};
pub use retry::{
    retry_while, should_retry, with_retry, BackoffStrategy, JitterStrategy, RetryConfig,
    RetryDecision, RetryState,
};
