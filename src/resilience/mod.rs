//! Resilience
//!
//! Retry with exponential backoff and jitter for token endpoint calls.

pub mod retry;

pub use retry::{RetryConfig, RetryExecutor, RetryStats};
