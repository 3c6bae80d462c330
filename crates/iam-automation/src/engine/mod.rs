//! Contracts between the scheduling engine and its driver
//!
//! The engine owns schedules, counts triggers and decides when a schedule is
//! due. The driver (in-app automation) decides whether a due schedule can be
//! prepared and executed. Prepare and execution results flow back through
//! single-use callbacks.

mod memory;

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use iam_core::prelude::*;
use iam_core::{Schedule, ScheduleEdits, ScheduleInfo, TriggerContext};

pub use memory::{InMemoryEngine, ScheduleState};

/// Driver answer to a prepare request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareResult {
    /// Prepared; the schedule waits for readiness
    Continue,
    /// Not this time; does not count as an execution
    Skip,
    /// Counts as an execution without displaying
    Penalize,
    /// Cancel the schedule
    Cancel,
    /// Prepared state is stale; prepare again
    Invalidate,
}

/// Driver answer to a readiness check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyResult {
    Continue,
    NotReady,
    Invalidate,
}

/// Single-use handle for a prepare result
pub struct PrepareCallback(Box<dyn FnOnce(PrepareResult) + Send>);

impl PrepareCallback {
    pub fn new(callback: impl FnOnce(PrepareResult) + Send + 'static) -> Self {
        Self(Box::new(callback))
    }

    pub fn finish(self, result: PrepareResult) {
        (self.0)(result)
    }
}

impl fmt::Debug for PrepareCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrepareCallback")
    }
}

/// Single-use handle signalling that an execution finished
pub struct ExecutionCallback(Box<dyn FnOnce() + Send>);

impl ExecutionCallback {
    pub fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(callback))
    }

    pub fn finish(self) {
        (self.0)()
    }
}

impl fmt::Debug for ExecutionCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExecutionCallback")
    }
}

pub trait AutomationDriver: Send + Sync {
    /// Build the stored schedule for a new schedule request
    fn create_schedule(&self, schedule_id: &str, metadata: Value, info: ScheduleInfo)
        -> Result<Schedule>;

    fn on_prepare_schedule(
        &self,
        schedule: &Schedule,
        trigger_context: Option<&TriggerContext>,
        callback: PrepareCallback,
    );

    fn on_check_execution_readiness(&self, schedule: &Schedule) -> ReadyResult;

    fn on_execute_triggered_schedule(&self, schedule: &Schedule, callback: ExecutionCallback);

    /// An execution was cut short before its callback fired
    fn on_schedule_execution_interrupted(&self, _schedule: &Schedule) {}
}

/// Lifecycle notifications from the engine
pub trait ScheduleListener: Send + Sync {
    fn on_new_schedule(&self, _schedule: &Schedule) {}

    fn on_schedule_expired(&self, _schedule: &Schedule) {}

    fn on_schedule_cancelled(&self, _schedule: &Schedule) {}

    fn on_schedule_limit_reached(&self, _schedule: &Schedule) {}
}

pub trait AutomationEngine: Send + Sync {
    fn start(&self, driver: Arc<dyn AutomationDriver>) -> Result<()>;

    fn stop(&self);

    /// A paused engine keeps schedules but prepares and executes nothing
    fn set_paused(&self, paused: bool);

    /// Re-check prepared schedules for readiness. Safe to call re-entrantly.
    fn check_pending_schedules(&self);

    fn set_schedule_listener(&self, listener: Option<Arc<dyn ScheduleListener>>);

    fn schedule(&self, info: ScheduleInfo, metadata: Value) -> Result<Schedule>;

    /// Returns whether a schedule was removed
    fn cancel(&self, schedule_id: &str) -> Result<bool>;

    /// Returns the number of schedules removed
    fn cancel_group(&self, group: &str) -> Result<usize>;

    fn get_schedule(&self, schedule_id: &str) -> Option<Schedule>;

    fn get_schedules(&self) -> Vec<Schedule>;

    fn edit_schedule(&self, schedule_id: &str, edits: ScheduleEdits) -> Result<Schedule>;
}
