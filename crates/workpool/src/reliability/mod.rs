//! Reliability primitives
//!
//! This module provides:
//! - [`RetryPolicy`] / [`Retry`] - Retry an operation per a pluggable strategy
//! - [`ParallelLoop`] - Bounded-concurrency iteration with per-tick retries

mod parallel;
mod retry;

pub use parallel::ParallelLoop;
pub use retry::{retry, OnRetryError, Retry, RetryPolicy, RetryStrategy};

pub(crate) use retry::{duration_millis, option_duration_millis};
