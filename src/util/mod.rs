//! Shared execution utilities.
//!
//! - `deadline`: bound an operation by the context deadline
//! - `retry`: bounded exponential backoff

pub mod deadline;
pub mod retry;

pub use retry::RetryConfig;
