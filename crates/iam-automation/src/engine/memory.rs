//! In-memory automation engine
//!
//! Holds schedules in a map, counts trigger events, and walks each schedule
//! through `Idle -> Preparing -> Prepared -> Executing -> Idle` by calling the
//! driver. Nothing is persisted. Finished schedules (limit reached, expired,
//! cancelled) are dropped immediately.
//!
//! The state lock is never held while calling the driver or the schedule
//! listener, so both may call back into the engine.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use iam_core::prelude::*;
use iam_core::{Schedule, ScheduleEdits, ScheduleInfo, TriggerContext, TriggerType};

use super::{
    AutomationDriver, AutomationEngine, ExecutionCallback, PrepareCallback, PrepareResult,
    ReadyResult, ScheduleListener,
};
use crate::config::settings::DEFAULT_SCHEDULE_LIMIT;

/// Where a schedule is in its execution cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    /// Waiting for its triggers
    Idle,
    /// Driver is preparing it
    Preparing,
    /// Prepared, waiting for readiness
    Prepared,
    /// Driver is executing it
    Executing,
}

struct Entry {
    schedule: Schedule,
    state: ScheduleState,
    sequence: u64,
    execution_count: u32,
    trigger_progress: Vec<f64>,
    trigger_context: Option<TriggerContext>,
    next_eligible: Option<Instant>,
}

impl Entry {
    fn reset_to_idle(&mut self) {
        self.state = ScheduleState::Idle;
        self.trigger_context = None;
        self.trigger_progress.iter_mut().for_each(|p| *p = 0.0);
    }
}

enum Notification {
    New(Schedule),
    Expired(Schedule),
    Cancelled(Schedule),
    LimitReached(Schedule),
}

#[derive(Default)]
struct EngineState {
    entries: HashMap<String, Entry>,
    driver: Option<Arc<dyn AutomationDriver>>,
    listener: Option<Arc<dyn ScheduleListener>>,
    paused: bool,
    checking: bool,
    recheck_requested: bool,
    next_sequence: u64,
}

struct Inner {
    state: Mutex<EngineState>,
    schedule_limit: usize,
}

/// Non-persistent [`AutomationEngine`]
#[derive(Clone)]
pub struct InMemoryEngine {
    inner: Arc<Inner>,
}

impl Default for InMemoryEngine {
    fn default() -> Self {
        Self::new(DEFAULT_SCHEDULE_LIMIT)
    }
}

impl fmt::Debug for InMemoryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("InMemoryEngine")
            .field("schedules", &state.entries.len())
            .field("running", &state.driver.is_some())
            .field("paused", &state.paused)
            .finish()
    }
}

impl InMemoryEngine {
    pub fn new(schedule_limit: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(EngineState::default()),
                schedule_limit,
            }),
        }
    }

    /// Fire a schedule directly with the given trigger context.
    ///
    /// Returns `false` when the schedule is not eligible right now (paused,
    /// busy, outside its window or interval).
    pub fn trigger(&self, schedule_id: &str, context: TriggerContext) -> Result<bool> {
        self.inner.trigger(schedule_id, context)
    }

    /// Count an event against every idle schedule with a matching trigger.
    /// Returns the ids of schedules whose goal was reached and that started
    /// preparing.
    pub fn process_event(&self, trigger_type: TriggerType, event: Value) -> Vec<String> {
        self.inner.process_event(trigger_type, event)
    }

    pub fn schedule_state(&self, schedule_id: &str) -> Option<ScheduleState> {
        self.inner
            .lock()
            .entries
            .get(schedule_id)
            .map(|entry| entry.state)
    }

    pub fn execution_count(&self, schedule_id: &str) -> Option<u32> {
        self.inner
            .lock()
            .entries
            .get(schedule_id)
            .map(|entry| entry.execution_count)
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }
}

impl AutomationEngine for InMemoryEngine {
    fn start(&self, driver: Arc<dyn AutomationDriver>) -> Result<()> {
        {
            let mut state = self.inner.lock();
            if state.driver.is_some() {
                warn!("Engine already started, replacing driver");
            }
            state.driver = Some(driver);
        }
        info!("Automation engine started");
        self.inner.check_pending();
        Ok(())
    }

    fn stop(&self) {
        let (driver, interrupted) = {
            let mut state = self.inner.lock();
            let driver = state.driver.take();
            let mut interrupted = Vec::new();
            for entry in state.entries.values_mut() {
                if entry.state == ScheduleState::Executing {
                    interrupted.push(entry.schedule.clone());
                }
                if entry.state != ScheduleState::Idle {
                    entry.reset_to_idle();
                }
            }
            (driver, interrupted)
        };

        if let Some(driver) = driver {
            for schedule in &interrupted {
                driver.on_schedule_execution_interrupted(schedule);
            }
        }
        info!("Automation engine stopped");
    }

    fn set_paused(&self, paused: bool) {
        {
            let mut state = self.inner.lock();
            if state.paused == paused {
                return;
            }
            state.paused = paused;
        }
        debug!("Automation engine {}", if paused { "paused" } else { "resumed" });
        if !paused {
            self.inner.check_pending();
        }
    }

    fn check_pending_schedules(&self) {
        self.inner.check_pending();
    }

    fn set_schedule_listener(&self, listener: Option<Arc<dyn ScheduleListener>>) {
        self.inner.lock().listener = listener;
    }

    fn schedule(&self, info: ScheduleInfo, metadata: Value) -> Result<Schedule> {
        info.validate()?;

        let driver = {
            let state = self.inner.lock();
            if state.entries.len() >= self.inner.schedule_limit {
                return Err(Error::ScheduleLimitReached {
                    limit: self.inner.schedule_limit,
                });
            }
            state.driver.clone()
        };

        let id = generate_schedule_id();
        let schedule = match driver {
            Some(driver) => driver.create_schedule(&id, metadata, info)?,
            None => Schedule::new(id, metadata, info),
        };

        {
            let mut state = self.inner.lock();
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.entries.insert(
                schedule.id.clone(),
                Entry {
                    schedule: schedule.clone(),
                    state: ScheduleState::Idle,
                    sequence,
                    execution_count: 0,
                    trigger_progress: vec![0.0; schedule.info.triggers.len()],
                    trigger_context: None,
                    next_eligible: None,
                },
            );
        }

        debug!("Scheduled {}", schedule.id);
        self.inner
            .notify(vec![Notification::New(schedule.clone())]);
        Ok(schedule)
    }

    fn cancel(&self, schedule_id: &str) -> Result<bool> {
        let removed = self.inner.lock().entries.remove(schedule_id);
        match removed {
            Some(entry) => {
                debug!("Cancelled {}", schedule_id);
                self.inner
                    .notify(vec![Notification::Cancelled(entry.schedule)]);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn cancel_group(&self, group: &str) -> Result<usize> {
        let removed: Vec<Entry> = {
            let mut state = self.inner.lock();
            let ids: Vec<String> = state
                .entries
                .values()
                .filter(|entry| entry.schedule.info.group.as_deref() == Some(group))
                .map(|entry| entry.schedule.id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| state.entries.remove(id))
                .collect()
        };

        let count = removed.len();
        self.inner.notify(
            removed
                .into_iter()
                .map(|entry| Notification::Cancelled(entry.schedule))
                .collect(),
        );
        Ok(count)
    }

    fn get_schedule(&self, schedule_id: &str) -> Option<Schedule> {
        self.inner
            .lock()
            .entries
            .get(schedule_id)
            .map(|entry| entry.schedule.clone())
    }

    fn get_schedules(&self) -> Vec<Schedule> {
        let state = self.inner.lock();
        let mut entries: Vec<&Entry> = state.entries.values().collect();
        entries.sort_by_key(|entry| entry.sequence);
        entries.into_iter().map(|e| e.schedule.clone()).collect()
    }

    fn edit_schedule(&self, schedule_id: &str, edits: ScheduleEdits) -> Result<Schedule> {
        let mut state = self.inner.lock();
        let entry = state
            .entries
            .get_mut(schedule_id)
            .ok_or_else(|| Error::schedule_not_found(schedule_id))?;

        edits.apply(&mut entry.schedule)?;
        if entry.trigger_progress.len() != entry.schedule.info.triggers.len() {
            entry.trigger_progress = vec![0.0; entry.schedule.info.triggers.len()];
        }
        Ok(entry.schedule.clone())
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn notify(&self, notifications: Vec<Notification>) {
        if notifications.is_empty() {
            return;
        }
        let Some(listener) = self.lock().listener.clone() else {
            return;
        };

        for notification in notifications {
            match notification {
                Notification::New(schedule) => listener.on_new_schedule(&schedule),
                Notification::Expired(schedule) => listener.on_schedule_expired(&schedule),
                Notification::Cancelled(schedule) => listener.on_schedule_cancelled(&schedule),
                Notification::LimitReached(schedule) => {
                    listener.on_schedule_limit_reached(&schedule)
                }
            }
        }
    }

    fn trigger(self: &Arc<Self>, schedule_id: &str, context: TriggerContext) -> Result<bool> {
        let expired = {
            let mut state = self.lock();
            if state.driver.is_none() {
                return Err(Error::EngineStopped);
            }
            let paused = state.paused;
            let entry = state
                .entries
                .get_mut(schedule_id)
                .ok_or_else(|| Error::schedule_not_found(schedule_id))?;

            if entry.state != ScheduleState::Idle || paused {
                return Ok(false);
            }

            let now = Utc::now();
            if entry.schedule.is_expired(now) {
                state.entries.remove(schedule_id).map(|e| e.schedule)
            } else {
                if !entry.schedule.has_started(now) {
                    return Ok(false);
                }
                if entry.next_eligible.is_some_and(|next| Instant::now() < next) {
                    trace!("Schedule {} is within its interval", schedule_id);
                    return Ok(false);
                }
                entry.trigger_context = Some(context);
                None
            }
        };

        if let Some(schedule) = expired {
            debug!("Schedule {} expired", schedule_id);
            self.notify(vec![Notification::Expired(schedule)]);
            return Ok(false);
        }

        self.prepare(schedule_id);
        Ok(true)
    }

    fn process_event(self: &Arc<Self>, trigger_type: TriggerType, event: Value) -> Vec<String> {
        let amount = match trigger_type {
            TriggerType::CustomEventValue => event.get("value").and_then(Value::as_f64).unwrap_or(1.0),
            _ => 1.0,
        };

        let fired: Vec<(String, TriggerContext)> = {
            let mut state = self.lock();
            if state.paused || state.driver.is_none() {
                return Vec::new();
            }

            let mut fired = Vec::new();
            for entry in state.entries.values_mut() {
                if entry.state != ScheduleState::Idle {
                    continue;
                }
                for (index, trigger) in entry.schedule.info.triggers.iter().enumerate() {
                    if trigger.trigger_type != trigger_type {
                        continue;
                    }
                    entry.trigger_progress[index] += amount;
                    if entry.trigger_progress[index] >= trigger.goal {
                        entry.trigger_progress[index] = 0.0;
                        fired.push((
                            entry.schedule.id.clone(),
                            TriggerContext::new(trigger.clone(), event.clone()),
                        ));
                        break;
                    }
                }
            }
            fired
        };

        fired
            .into_iter()
            .filter_map(|(id, context)| match self.trigger(&id, context) {
                Ok(true) => Some(id),
                Ok(false) => None,
                Err(e) => {
                    warn!("Failed to trigger {}: {}", id, e);
                    None
                }
            })
            .collect()
    }

    fn prepare(self: &Arc<Self>, schedule_id: &str) {
        let (driver, schedule, context) = {
            let mut state = self.lock();
            if state.paused {
                if let Some(entry) = state.entries.get_mut(schedule_id) {
                    entry.reset_to_idle();
                }
                return;
            }
            let Some(driver) = state.driver.clone() else {
                return;
            };
            let Some(entry) = state.entries.get_mut(schedule_id) else {
                return;
            };
            entry.state = ScheduleState::Preparing;
            (driver, entry.schedule.clone(), entry.trigger_context.clone())
        };

        trace!("Preparing {}", schedule_id);
        let weak = Arc::downgrade(self);
        let id = schedule_id.to_string();
        let callback = PrepareCallback::new(move |result| {
            if let Some(inner) = weak.upgrade() {
                inner.on_prepare_result(&id, result);
            }
        });
        driver.on_prepare_schedule(&schedule, context.as_ref(), callback);
    }

    fn on_prepare_result(self: &Arc<Self>, schedule_id: &str, result: PrepareResult) {
        debug!("Prepare result for {}: {:?}", schedule_id, result);

        let mut notifications = Vec::new();
        let mut reprepare = false;
        let mut check = false;
        {
            let mut state = self.lock();
            let Some(entry) = state.entries.get_mut(schedule_id) else {
                return;
            };
            if entry.state != ScheduleState::Preparing {
                trace!("Ignoring stale prepare result for {}", schedule_id);
                return;
            }

            match result {
                PrepareResult::Continue => {
                    entry.state = ScheduleState::Prepared;
                    check = true;
                }
                PrepareResult::Skip => entry.reset_to_idle(),
                PrepareResult::Invalidate => {
                    entry.state = ScheduleState::Idle;
                    reprepare = true;
                }
                PrepareResult::Penalize => {
                    notifications.extend(record_execution(&mut state, schedule_id));
                }
                PrepareResult::Cancel => {
                    if let Some(entry) = state.entries.remove(schedule_id) {
                        notifications.push(Notification::Cancelled(entry.schedule));
                    }
                }
            }
        }

        self.notify(notifications);
        if reprepare {
            self.prepare(schedule_id);
        }
        if check {
            self.check_pending();
        }
    }

    fn check_pending(self: &Arc<Self>) {
        {
            let mut state = self.lock();
            if state.checking {
                state.recheck_requested = true;
                return;
            }
            state.checking = true;
        }

        loop {
            let (driver, candidates, expired) = self.collect_pending();
            self.notify(expired);

            if let Some(driver) = driver {
                for schedule in candidates {
                    self.check_one(&driver, schedule);
                }
            }

            let mut state = self.lock();
            if !state.recheck_requested {
                state.checking = false;
                break;
            }
        }
    }

    fn collect_pending(&self) -> (Option<Arc<dyn AutomationDriver>>, Vec<Schedule>, Vec<Notification>) {
        let mut state = self.lock();
        state.recheck_requested = false;

        let now = Utc::now();
        let expired_ids: Vec<String> = state
            .entries
            .values()
            .filter(|e| e.state != ScheduleState::Executing && e.schedule.is_expired(now))
            .map(|e| e.schedule.id.clone())
            .collect();
        let expired = expired_ids
            .iter()
            .filter_map(|id| state.entries.remove(id))
            .map(|e| Notification::Expired(e.schedule))
            .collect();

        if state.paused || state.driver.is_none() {
            return (None, Vec::new(), expired);
        }

        let mut prepared: Vec<&Entry> = state
            .entries
            .values()
            .filter(|e| e.state == ScheduleState::Prepared)
            .collect();
        prepared.sort_by_key(|e| (e.schedule.info.priority, e.sequence));
        let candidates = prepared.into_iter().map(|e| e.schedule.clone()).collect();

        (state.driver.clone(), candidates, expired)
    }

    fn check_one(self: &Arc<Self>, driver: &Arc<dyn AutomationDriver>, schedule: Schedule) {
        let still_prepared = {
            let state = self.lock();
            !state.paused
                && state
                    .entries
                    .get(&schedule.id)
                    .is_some_and(|e| e.state == ScheduleState::Prepared)
        };
        if !still_prepared {
            return;
        }

        match driver.on_check_execution_readiness(&schedule) {
            ReadyResult::Continue => {
                {
                    let mut state = self.lock();
                    match state.entries.get_mut(&schedule.id) {
                        Some(entry) if entry.state == ScheduleState::Prepared => {
                            entry.state = ScheduleState::Executing;
                        }
                        _ => return,
                    }
                }

                debug!("Executing {}", schedule.id);
                let weak = Arc::downgrade(self);
                let id = schedule.id.clone();
                let callback = ExecutionCallback::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_execution_finished(&id);
                    }
                });
                driver.on_execute_triggered_schedule(&schedule, callback);
            }
            ReadyResult::NotReady => trace!("Schedule {} not ready", schedule.id),
            ReadyResult::Invalidate => {
                debug!("Schedule {} invalidated, preparing again", schedule.id);
                {
                    let mut state = self.lock();
                    if let Some(entry) = state.entries.get_mut(&schedule.id) {
                        entry.state = ScheduleState::Idle;
                    }
                }
                self.prepare(&schedule.id);
            }
        }
    }

    fn on_execution_finished(self: &Arc<Self>, schedule_id: &str) {
        let notification = {
            let mut state = self.lock();
            match state.entries.get(schedule_id) {
                Some(entry) if entry.state == ScheduleState::Executing => {}
                _ => return,
            }
            record_execution(&mut state, schedule_id)
        };

        debug!("Execution finished for {}", schedule_id);
        self.notify(notification.into_iter().collect());
        self.check_pending();
    }
}

/// Count one execution; drops the schedule once its limit is reached
fn record_execution(state: &mut EngineState, schedule_id: &str) -> Option<Notification> {
    let entry = state.entries.get_mut(schedule_id)?;
    entry.execution_count += 1;

    let limit = entry.schedule.info.limit;
    if limit > 0 && entry.execution_count >= limit {
        return state
            .entries
            .remove(schedule_id)
            .map(|e| Notification::LimitReached(e.schedule));
    }

    entry.reset_to_idle();
    let interval = entry.schedule.info.interval_ms;
    entry.next_eligible = (interval > 0).then(|| Instant::now() + Duration::from_millis(interval));
    None
}

fn generate_schedule_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use iam_core::{DisplayType, InAppMessage, Trigger};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct TestDriver {
        calls: StdMutex<Vec<String>>,
        prepare_results: StdMutex<Vec<PrepareResult>>,
        ready: StdMutex<Option<ReadyResult>>,
        executions: StdMutex<Vec<(String, ExecutionCallback)>>,
        interrupted: StdMutex<Vec<String>>,
    }

    impl TestDriver {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn push_prepare_result(&self, result: PrepareResult) {
            self.prepare_results.lock().unwrap().push(result);
        }

        fn set_ready(&self, result: ReadyResult) {
            *self.ready.lock().unwrap() = Some(result);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn finish_executions(&self) {
            let executions: Vec<_> = self.executions.lock().unwrap().drain(..).collect();
            for (_, callback) in executions {
                callback.finish();
            }
        }
    }

    impl AutomationDriver for TestDriver {
        fn create_schedule(
            &self,
            schedule_id: &str,
            metadata: Value,
            info: ScheduleInfo,
        ) -> Result<Schedule> {
            Ok(Schedule::new(schedule_id, metadata, info))
        }

        fn on_prepare_schedule(
            &self,
            schedule: &Schedule,
            _trigger_context: Option<&TriggerContext>,
            callback: PrepareCallback,
        ) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("prepare:{}", schedule.info.priority));
            let result = {
                let mut results = self.prepare_results.lock().unwrap();
                if results.is_empty() {
                    PrepareResult::Continue
                } else {
                    results.remove(0)
                }
            };
            callback.finish(result);
        }

        fn on_check_execution_readiness(&self, _schedule: &Schedule) -> ReadyResult {
            self.ready.lock().unwrap().unwrap_or(ReadyResult::Continue)
        }

        fn on_execute_triggered_schedule(&self, schedule: &Schedule, callback: ExecutionCallback) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("execute:{}", schedule.info.priority));
            self.executions
                .lock()
                .unwrap()
                .push((schedule.id.clone(), callback));
        }

        fn on_schedule_execution_interrupted(&self, schedule: &Schedule) {
            self.interrupted.lock().unwrap().push(schedule.id.clone());
        }
    }

    #[derive(Default)]
    struct TestListener {
        events: StdMutex<Vec<String>>,
    }

    impl ScheduleListener for TestListener {
        fn on_new_schedule(&self, _schedule: &Schedule) {
            self.events.lock().unwrap().push("new".into());
        }
        fn on_schedule_expired(&self, _schedule: &Schedule) {
            self.events.lock().unwrap().push("expired".into());
        }
        fn on_schedule_cancelled(&self, _schedule: &Schedule) {
            self.events.lock().unwrap().push("cancelled".into());
        }
        fn on_schedule_limit_reached(&self, _schedule: &Schedule) {
            self.events.lock().unwrap().push("limit".into());
        }
    }

    fn info() -> ScheduleInfo {
        let message = InAppMessage::builder(DisplayType::Banner)
            .display_content(json!({}))
            .build()
            .unwrap();
        ScheduleInfo::new(message, vec![Trigger::new(TriggerType::Foreground, 1.0)])
    }

    fn context() -> TriggerContext {
        TriggerContext::new(Trigger::new(TriggerType::Foreground, 1.0), Value::Null)
    }

    fn started() -> (InMemoryEngine, Arc<TestDriver>, Arc<TestListener>) {
        let engine = InMemoryEngine::default();
        let driver = TestDriver::new();
        let listener = Arc::new(TestListener::default());
        engine.set_schedule_listener(Some(listener.clone()));
        engine.start(driver.clone()).unwrap();
        (engine, driver, listener)
    }

    #[test]
    fn test_full_cycle_until_limit() {
        let (engine, driver, listener) = started();
        let schedule = engine.schedule(info(), Value::Null).unwrap();

        assert!(engine.trigger(&schedule.id, context()).unwrap());
        assert_eq!(engine.schedule_state(&schedule.id), Some(ScheduleState::Executing));
        assert_eq!(driver.calls(), vec!["prepare:0", "execute:0"]);

        driver.finish_executions();

        assert!(engine.get_schedule(&schedule.id).is_none());
        assert_eq!(*listener.events.lock().unwrap(), vec!["new", "limit"]);
    }

    #[test]
    fn test_unlimited_schedule_returns_to_idle() {
        let (engine, driver, _) = started();
        let schedule = engine.schedule(info().with_limit(0), Value::Null).unwrap();

        engine.trigger(&schedule.id, context()).unwrap();
        driver.finish_executions();
        engine.trigger(&schedule.id, context()).unwrap();
        driver.finish_executions();

        assert_eq!(engine.schedule_state(&schedule.id), Some(ScheduleState::Idle));
        assert_eq!(engine.execution_count(&schedule.id), Some(2));
    }

    #[test]
    fn test_penalize_counts_as_execution() {
        let (engine, driver, listener) = started();
        let schedule = engine.schedule(info(), Value::Null).unwrap();
        driver.push_prepare_result(PrepareResult::Penalize);

        engine.trigger(&schedule.id, context()).unwrap();

        assert!(engine.get_schedule(&schedule.id).is_none());
        assert_eq!(driver.calls(), vec!["prepare:0"]);
        assert!(listener.events.lock().unwrap().contains(&"limit".to_string()));
    }

    #[test]
    fn test_skip_does_not_count() {
        let (engine, driver, _) = started();
        let schedule = engine.schedule(info(), Value::Null).unwrap();
        driver.push_prepare_result(PrepareResult::Skip);

        engine.trigger(&schedule.id, context()).unwrap();

        assert_eq!(engine.schedule_state(&schedule.id), Some(ScheduleState::Idle));
        assert_eq!(engine.execution_count(&schedule.id), Some(0));
    }

    #[test]
    fn test_cancel_result_removes_schedule() {
        let (engine, driver, listener) = started();
        let schedule = engine.schedule(info(), Value::Null).unwrap();
        driver.push_prepare_result(PrepareResult::Cancel);

        engine.trigger(&schedule.id, context()).unwrap();

        assert!(engine.get_schedule(&schedule.id).is_none());
        assert_eq!(*listener.events.lock().unwrap(), vec!["new", "cancelled"]);
    }

    #[test]
    fn test_invalidate_prepares_again() {
        let (engine, driver, _) = started();
        let schedule = engine.schedule(info(), Value::Null).unwrap();
        driver.push_prepare_result(PrepareResult::Invalidate);

        engine.trigger(&schedule.id, context()).unwrap();

        assert_eq!(driver.calls(), vec!["prepare:0", "prepare:0", "execute:0"]);
    }

    #[test]
    fn test_not_ready_waits_for_check() {
        let (engine, driver, _) = started();
        driver.set_ready(ReadyResult::NotReady);
        let schedule = engine.schedule(info(), Value::Null).unwrap();

        engine.trigger(&schedule.id, context()).unwrap();
        assert_eq!(engine.schedule_state(&schedule.id), Some(ScheduleState::Prepared));

        driver.set_ready(ReadyResult::Continue);
        engine.check_pending_schedules();
        assert_eq!(engine.schedule_state(&schedule.id), Some(ScheduleState::Executing));
    }

    #[test]
    fn test_ready_invalidate_prepares_again() {
        let (engine, driver, _) = started();
        driver.set_ready(ReadyResult::NotReady);
        let schedule = engine.schedule(info(), Value::Null).unwrap();
        engine.trigger(&schedule.id, context()).unwrap();

        driver.set_ready(ReadyResult::Invalidate);
        driver.push_prepare_result(PrepareResult::Skip);
        engine.check_pending_schedules();

        assert_eq!(driver.calls(), vec!["prepare:0", "prepare:0"]);
        assert_eq!(engine.schedule_state(&schedule.id), Some(ScheduleState::Idle));
    }

    #[test]
    fn test_priority_order() {
        let (engine, driver, _) = started();
        driver.set_ready(ReadyResult::NotReady);
        let low = engine.schedule(info().with_priority(5), Value::Null).unwrap();
        let high = engine.schedule(info().with_priority(-1), Value::Null).unwrap();
        engine.trigger(&low.id, context()).unwrap();
        engine.trigger(&high.id, context()).unwrap();

        driver.set_ready(ReadyResult::Continue);
        engine.check_pending_schedules();

        let calls = driver.calls();
        assert_eq!(&calls[2..], &["execute:-1", "execute:5"]);
    }

    #[test]
    fn test_paused_engine_holds_schedules() {
        let (engine, driver, _) = started();
        driver.set_ready(ReadyResult::NotReady);
        let schedule = engine.schedule(info(), Value::Null).unwrap();
        engine.trigger(&schedule.id, context()).unwrap();

        engine.set_paused(true);
        assert!(!engine.trigger(&schedule.id, context()).unwrap());
        driver.set_ready(ReadyResult::Continue);
        engine.check_pending_schedules();
        assert_eq!(engine.schedule_state(&schedule.id), Some(ScheduleState::Prepared));

        engine.set_paused(false);
        assert_eq!(engine.schedule_state(&schedule.id), Some(ScheduleState::Executing));
    }

    #[test]
    fn test_process_event_counts_towards_goal() {
        let (engine, _driver, _) = started();
        let message = info().message;
        let info = ScheduleInfo::new(message, vec![Trigger::new(TriggerType::Foreground, 2.0)]);
        let schedule = engine.schedule(info, Value::Null).unwrap();

        assert!(engine.process_event(TriggerType::Foreground, Value::Null).is_empty());
        assert!(engine.process_event(TriggerType::AppInit, Value::Null).is_empty());
        assert_eq!(
            engine.process_event(TriggerType::Foreground, Value::Null),
            vec![schedule.id.clone()]
        );
    }

    #[test]
    fn test_custom_event_value_uses_amount() {
        let (engine, _driver, _) = started();
        let message = info().message;
        let info = ScheduleInfo::new(
            message,
            vec![Trigger::new(TriggerType::CustomEventValue, 10.0)],
        );
        let schedule = engine.schedule(info, Value::Null).unwrap();

        let fired = engine.process_event(TriggerType::CustomEventValue, json!({"value": 12.5}));
        assert_eq!(fired, vec![schedule.id]);
    }

    #[test]
    fn test_cancel_and_cancel_group() {
        let (engine, _driver, listener) = started();
        let a = engine.schedule(info().with_group("msg"), Value::Null).unwrap();
        let _b = engine.schedule(info().with_group("msg"), Value::Null).unwrap();
        let c = engine.schedule(info(), Value::Null).unwrap();

        assert_eq!(engine.cancel_group("msg").unwrap(), 2);
        assert!(engine.get_schedule(&a.id).is_none());
        assert!(engine.cancel(&c.id).unwrap());
        assert!(!engine.cancel(&c.id).unwrap());
        assert_eq!(
            listener
                .events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| *e == "cancelled")
                .count(),
            3
        );
    }

    #[test]
    fn test_edit_schedule() {
        let (engine, _driver, _) = started();
        let schedule = engine.schedule(info(), Value::Null).unwrap();

        let edited = engine
            .edit_schedule(
                &schedule.id,
                ScheduleEdits {
                    limit: Some(3),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(edited.info.limit, 3);
        assert_eq!(engine.get_schedule(&schedule.id).unwrap().info.limit, 3);

        assert!(matches!(
            engine.edit_schedule("missing", ScheduleEdits::default()),
            Err(Error::ScheduleNotFound { .. })
        ));
    }

    #[test]
    fn test_schedule_limit() {
        let engine = InMemoryEngine::new(1);
        engine.schedule(info(), Value::Null).unwrap();
        assert!(matches!(
            engine.schedule(info(), Value::Null),
            Err(Error::ScheduleLimitReached { limit: 1 })
        ));
    }

    #[test]
    fn test_invalid_schedule_rejected() {
        let engine = InMemoryEngine::default();
        let mut info = info();
        info.triggers.clear();
        assert!(engine.schedule(info, Value::Null).is_err());
    }

    #[test]
    fn test_expired_schedule_removed_on_trigger() {
        let (engine, driver, listener) = started();
        let now = Utc::now();
        let schedule = engine
            .schedule(
                info().with_window(
                    Some(now - ChronoDuration::hours(2)),
                    Some(now - ChronoDuration::hours(1)),
                ),
                Value::Null,
            )
            .unwrap();

        assert!(!engine.trigger(&schedule.id, context()).unwrap());
        assert!(engine.get_schedule(&schedule.id).is_none());
        assert!(driver.calls().is_empty());
        assert!(listener.events.lock().unwrap().contains(&"expired".to_string()));
    }

    #[test]
    fn test_trigger_requires_running_engine() {
        let engine = InMemoryEngine::default();
        let schedule = engine.schedule(info(), Value::Null).unwrap();
        assert!(matches!(
            engine.trigger(&schedule.id, context()),
            Err(Error::EngineStopped)
        ));
    }

    #[test]
    fn test_stop_interrupts_executing() {
        let (engine, driver, _) = started();
        let schedule = engine.schedule(info(), Value::Null).unwrap();
        engine.trigger(&schedule.id, context()).unwrap();

        engine.stop();

        assert_eq!(*driver.interrupted.lock().unwrap(), vec![schedule.id.clone()]);
        assert_eq!(engine.schedule_state(&schedule.id), Some(ScheduleState::Idle));

        // Late execution callback is ignored
        driver.finish_executions();
        assert_eq!(engine.execution_count(&schedule.id), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_between_executions() {
        let (engine, driver, _) = started();
        let mut info = info().with_limit(0);
        info.interval_ms = 1_000;
        let schedule = engine.schedule(info, Value::Null).unwrap();

        engine.trigger(&schedule.id, context()).unwrap();
        driver.finish_executions();
        assert!(!engine.trigger(&schedule.id, context()).unwrap());

        tokio::time::sleep(Duration::from_millis(1_001)).await;
        assert!(engine.trigger(&schedule.id, context()).unwrap());
    }

    #[test]
    fn test_generated_ids_are_uuids() {
        let id = generate_schedule_id();
        let parsed = Uuid::parse_str(&id).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
        assert_ne!(id, generate_schedule_id());
    }
}
