//! Serial retrying executor
//!
//! All work submitted to a [`RetryingExecutor`] runs one job at a time on a
//! single Tokio task. A job is either a one-shot runnable or a [`Pipeline`] of
//! dependent [`Operation`]s: each operation reports whether it finished, wants
//! a retry, or cancels the rest of the pipeline.
//!
//! A retry never blocks the worker. The remaining pipeline is handed to a
//! detached timer task that re-enqueues it once the backoff elapses, so other
//! jobs keep running in the meantime.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use iam_core::prelude::*;

/// Default delay before the first retry of an operation
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(30);

/// Upper bound for the retry delay
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(120);

/// Outcome of running an operation once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationResult {
    /// Move on to the next operation in the pipeline
    Finished,
    /// Run this operation again after a backoff delay
    Retry,
    /// Drop this operation and every one after it
    Cancel,
}

/// A unit of work in a pipeline
///
/// Any `FnMut() -> OperationResult` closure is an operation.
pub trait Operation: Send + 'static {
    fn run(&mut self) -> OperationResult;
}

impl<F> Operation for F
where
    F: FnMut() -> OperationResult + Send + 'static,
{
    fn run(&mut self) -> OperationResult {
        self()
    }
}

/// Retry delay policy: exponential, starting at `initial`, capped at `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: DEFAULT_INITIAL_BACKOFF,
            max: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl BackoffConfig {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
        }
    }

    /// Delay to use after `previous`, or the initial delay for a first retry
    pub fn next_delay(&self, previous: Option<Duration>) -> Duration {
        match previous {
            None => self.initial,
            Some(previous) => previous.saturating_mul(2).min(self.max),
        }
    }
}

/// An ordered chain of operations. Each runs only after the previous one
/// finished.
pub struct Pipeline {
    operations: VecDeque<Box<dyn Operation>>,
    /// Backoff of the operation at the front, reset when it finishes
    backoff: Option<Duration>,
    retries: u32,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("remaining", &self.operations.len())
            .field("backoff", &self.backoff)
            .field("retries", &self.retries)
            .finish()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            operations: VecDeque::new(),
            backoff: None,
            retries: 0,
        }
    }

    /// Append an operation
    pub fn then(mut self, operation: impl Operation) -> Self {
        self.operations.push_back(Box::new(operation));
        self
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

enum Job {
    Pipeline(Pipeline),
    Runnable(Box<dyn FnOnce() + Send + 'static>),
}

/// Serial executor with non-blocking retries
///
/// Cheap to clone; all clones feed the same worker. The worker exits once
/// every clone has been dropped and the queue is drained.
#[derive(Clone)]
pub struct RetryingExecutor {
    job_tx: mpsc::UnboundedSender<Job>,
    paused_tx: Arc<watch::Sender<bool>>,
    backoff: BackoffConfig,
}

impl fmt::Debug for RetryingExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryingExecutor")
            .field("job_tx", &"<channel>")
            .field("paused", &*self.paused_tx.borrow())
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl RetryingExecutor {
    /// Create a serial executor with the default backoff.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new_serial() -> Self {
        Self::with_backoff(BackoffConfig::default())
    }

    /// Create a serial executor with a custom backoff.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_backoff(backoff: BackoffConfig) -> Self {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let (paused_tx, paused_rx) = watch::channel(false);

        tokio::spawn(worker_loop(job_rx, job_tx.downgrade(), paused_rx, backoff));

        Self {
            job_tx,
            paused_tx: Arc::new(paused_tx),
            backoff,
        }
    }

    /// Pause or resume the worker. Queued jobs wait while paused.
    pub fn set_paused(&self, paused: bool) {
        let previous = self.paused_tx.send_replace(paused);
        if previous != paused {
            debug!("Executor {}", if paused { "paused" } else { "resumed" });
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused_tx.borrow()
    }

    pub fn backoff(&self) -> BackoffConfig {
        self.backoff
    }

    /// Run a one-shot job
    pub fn execute(&self, runnable: impl FnOnce() + Send + 'static) {
        self.submit(Job::Runnable(Box::new(runnable)));
    }

    /// Run a single retryable operation
    pub fn execute_operation(&self, operation: impl Operation) {
        self.execute_pipeline(Pipeline::new().then(operation));
    }

    /// Run a chain of dependent operations
    pub fn execute_pipeline(&self, pipeline: Pipeline) {
        if pipeline.is_empty() {
            return;
        }
        self.submit(Job::Pipeline(pipeline));
    }

    /// Resolve once every job queued before this call has run.
    ///
    /// Pipelines waiting on a retry timer are not waited for.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.execute(move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }

    fn submit(&self, job: Job) {
        if self.job_tx.send(job).is_err() {
            warn!("Executor worker has stopped, dropping job");
        }
    }
}

async fn worker_loop(
    mut job_rx: mpsc::UnboundedReceiver<Job>,
    retry_tx: mpsc::WeakUnboundedSender<Job>,
    mut paused_rx: watch::Receiver<bool>,
    backoff: BackoffConfig,
) {
    debug!("Executor worker started");

    while let Some(job) = job_rx.recv().await {
        if paused_rx.wait_for(|paused| !*paused).await.is_err() {
            break;
        }

        match job {
            Job::Runnable(runnable) => {
                if catch_unwind(AssertUnwindSafe(runnable)).is_err() {
                    error!("Executor job panicked");
                }
            }
            Job::Pipeline(pipeline) => run_pipeline(pipeline, &retry_tx, backoff),
        }
    }

    debug!("Executor worker stopped");
}

fn run_pipeline(
    mut pipeline: Pipeline,
    retry_tx: &mpsc::WeakUnboundedSender<Job>,
    backoff: BackoffConfig,
) {
    while let Some(operation) = pipeline.operations.front_mut() {
        let result = catch_unwind(AssertUnwindSafe(|| operation.run())).unwrap_or_else(|_| {
            error!("Executor operation panicked, cancelling pipeline");
            OperationResult::Cancel
        });

        match result {
            OperationResult::Finished => {
                pipeline.operations.pop_front();
                pipeline.backoff = None;
            }
            OperationResult::Cancel => {
                trace!(
                    "Pipeline cancelled with {} operation(s) remaining",
                    pipeline.operations.len()
                );
                return;
            }
            OperationResult::Retry => {
                let delay = backoff.next_delay(pipeline.backoff);
                pipeline.backoff = Some(delay);
                pipeline.retries += 1;
                schedule_retry(pipeline, delay, retry_tx.clone());
                return;
            }
        }
    }
}

fn schedule_retry(pipeline: Pipeline, delay: Duration, retry_tx: mpsc::WeakUnboundedSender<Job>) {
    debug!(
        "Retrying operation in {:?} (retry #{})",
        delay, pipeline.retries
    );

    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        match retry_tx.upgrade() {
            Some(tx) => {
                let _ = tx.send(Job::Pipeline(pipeline));
            }
            None => debug!("Executor dropped before retry was due"),
        }
    });
}
