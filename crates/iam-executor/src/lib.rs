//! # iam-executor - Serial Retrying Executor
//!
//! Runs in-app automation work one job at a time on a dedicated Tokio task.
//! Pipelines of dependent operations retry with exponential backoff without
//! blocking the queue.
//!
//! ## Public API
//!
//! - [`RetryingExecutor`] - Cloneable handle to the serial worker
//! - [`Pipeline`] - Ordered chain of [`Operation`]s
//! - [`OperationResult`] - `Finished`, `Retry` or `Cancel`
//! - [`BackoffConfig`] - Retry delay policy

pub mod retrying;

pub use retrying::{
    BackoffConfig, Operation, OperationResult, Pipeline, RetryingExecutor,
    DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_BACKOFF,
};
