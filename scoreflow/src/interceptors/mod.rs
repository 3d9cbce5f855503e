//! Stage decorators.

mod retry;

pub use retry::Retrying;
