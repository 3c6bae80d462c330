//! In-app automation façade
//!
//! Wires an [`AutomationEngine`] to the [`InAppMessageManager`]: it is the
//! engine's driver and schedule listener, owns the pause and enable flags,
//! and gates remote schedules on remote-data freshness.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use serde_json::Value;

use iam_core::prelude::*;
use iam_core::{Schedule, ScheduleEdits, ScheduleInfo, TriggerContext};

use crate::config::{keys, PreferenceDataStore};
use crate::engine::{
    AutomationDriver, AutomationEngine, ExecutionCallback, PrepareCallback, PrepareResult,
    ReadyResult, ScheduleListener,
};
use crate::manager::InAppMessageManager;
use crate::registry;
use crate::remote_data::RemoteDataObserver;

pub struct InAppAutomation {
    engine: Arc<dyn AutomationEngine>,
    manager: Arc<InAppMessageManager>,
    preferences: Arc<PreferenceDataStore>,
    remote_data: RemoteDataObserver,
    started: AtomicBool,
    weak_self: Weak<InAppAutomation>,
}

impl InAppAutomation {
    pub fn new(
        engine: Arc<dyn AutomationEngine>,
        manager: Arc<InAppMessageManager>,
        preferences: Arc<PreferenceDataStore>,
        remote_data: RemoteDataObserver,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            engine,
            manager,
            preferences,
            remote_data,
            started: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        })
    }

    /// Start the engine with this instance as its driver and make it the
    /// process-wide instance used by display handlers
    pub fn start(&self) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.engine.set_schedule_listener(Some(Arc::new(EngineListener {
            automation: self.weak_self.clone(),
        })));
        self.engine.start(Arc::new(Driver {
            automation: self.weak_self.clone(),
        }))?;

        let engine = Arc::downgrade(&self.engine);
        self.manager
            .set_schedule_check_callback(Some(Arc::new(move || {
                if let Some(engine) = engine.upgrade() {
                    engine.check_pending_schedules();
                }
            })));

        self.engine.set_paused(!self.is_enabled());
        self.started.store(true, Ordering::SeqCst);
        if let Some(this) = self.weak_self.upgrade() {
            registry::install(this);
        }
        self.manager.on_ready();

        info!(
            "In-app automation started (enabled: {}, paused: {})",
            self.is_enabled(),
            self.is_paused()
        );
        Ok(())
    }

    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        registry::uninstall(self);
        self.manager.set_schedule_check_callback(None);
        self.engine.stop();
        self.engine.set_schedule_listener(None);
        self.manager.release_adapters();
        info!("In-app automation stopped");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn manager(&self) -> &Arc<InAppMessageManager> {
        &self.manager
    }

    pub fn engine(&self) -> &Arc<dyn AutomationEngine> {
        &self.engine
    }

    pub fn remote_data(&self) -> &RemoteDataObserver {
        &self.remote_data
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Pause / enable
    // ─────────────────────────────────────────────────────────────────────────

    /// A paused instance keeps preparing but displays nothing
    pub fn is_paused(&self) -> bool {
        self.preferences.get_bool(keys::PAUSED, false)
    }

    pub fn set_paused(&self, paused: bool) -> Result<()> {
        let was_paused = self.is_paused();
        self.preferences.put_bool(keys::PAUSED, paused)?;
        if was_paused && !paused {
            self.engine.check_pending_schedules();
        }
        Ok(())
    }

    /// A disabled instance stops the engine from preparing or executing
    pub fn is_enabled(&self) -> bool {
        self.preferences.get_bool(keys::ENABLED, true)
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.preferences.put_bool(keys::ENABLED, enabled)?;
        if self.is_started() {
            self.engine.set_paused(!enabled);
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Schedules
    // ─────────────────────────────────────────────────────────────────────────

    pub fn schedule(&self, info: ScheduleInfo, metadata: Value) -> Result<Schedule> {
        self.engine.schedule(info, metadata)
    }

    pub fn cancel_schedule(&self, schedule_id: &str) -> Result<bool> {
        self.engine.cancel(schedule_id)
    }

    pub fn cancel_group(&self, group: &str) -> Result<usize> {
        self.engine.cancel_group(group)
    }

    pub fn get_schedule(&self, schedule_id: &str) -> Option<Schedule> {
        self.engine.get_schedule(schedule_id)
    }

    pub fn get_schedules(&self) -> Vec<Schedule> {
        self.engine.get_schedules()
    }

    pub fn edit_schedule(&self, schedule_id: &str, edits: ScheduleEdits) -> Result<Schedule> {
        self.engine.edit_schedule(schedule_id, edits)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Driver logic
    // ─────────────────────────────────────────────────────────────────────────

    fn is_schedule_invalid(&self, schedule: &Schedule) -> bool {
        self.remote_data.is_remote_schedule(schedule) && !self.remote_data.is_schedule_valid(schedule)
    }

    /// Valid schedules prepare right away. An outdated schedule is skipped
    /// when remote data is current, otherwise it is invalidated after the
    /// next update so the engine prepares the refreshed copy.
    fn prepare_schedule(&self, schedule: &Schedule, callback: PrepareCallback) {
        if !self.is_schedule_invalid(schedule) {
            self.manager.on_prepare(
                &schedule.id,
                schedule.info.campaigns.clone(),
                schedule.info.reporting_context.clone(),
                schedule.info.message.clone(),
                callback,
            );
            return;
        }

        if self.remote_data.is_up_to_date() {
            debug!("Schedule {} is outdated and remote data is current, skipping", schedule.id);
            callback.finish(PrepareResult::Skip);
            return;
        }

        let schedule_id = schedule.id.clone();
        self.remote_data.attempt_refresh(schedule, move || {
            debug!("Remote data updated, invalidating {}", schedule_id);
            callback.finish(PrepareResult::Invalidate);
        });
    }

    fn check_readiness(&self, schedule: &Schedule) -> ReadyResult {
        if self.is_paused() {
            return ReadyResult::NotReady;
        }

        if self.is_schedule_invalid(schedule) {
            self.manager.on_execution_invalidated(&schedule.id);
            return ReadyResult::Invalidate;
        }

        self.manager.on_check_execution_readiness(&schedule.id)
    }
}

struct Driver {
    automation: Weak<InAppAutomation>,
}

impl AutomationDriver for Driver {
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
        match self.automation.upgrade() {
            Some(automation) => automation.prepare_schedule(schedule, callback),
            None => callback.finish(PrepareResult::Skip),
        }
    }

    fn on_check_execution_readiness(&self, schedule: &Schedule) -> ReadyResult {
        self.automation
            .upgrade()
            .map_or(ReadyResult::NotReady, |automation| {
                automation.check_readiness(schedule)
            })
    }

    fn on_execute_triggered_schedule(&self, schedule: &Schedule, callback: ExecutionCallback) {
        match self.automation.upgrade() {
            Some(automation) => automation.manager.on_execute(&schedule.id, callback),
            None => callback.finish(),
        }
    }

    fn on_schedule_execution_interrupted(&self, schedule: &Schedule) {
        if let Some(automation) = self.automation.upgrade() {
            automation.manager.on_execution_interrupted(
                &schedule.id,
                schedule.info.campaigns.clone(),
                schedule.info.reporting_context.clone(),
                Some(schedule.info.message.clone()),
            );
        }
    }
}

struct EngineListener {
    automation: Weak<InAppAutomation>,
}

impl EngineListener {
    fn schedule_finished(&self, schedule: &Schedule) {
        if let Some(automation) = self.automation.upgrade() {
            automation
                .manager
                .on_message_schedule_finished(&schedule.id);
        }
    }
}

impl ScheduleListener for EngineListener {
    fn on_new_schedule(&self, schedule: &Schedule) {
        if let Some(automation) = self.automation.upgrade() {
            automation
                .manager
                .on_new_message_schedule(&schedule.id, schedule.info.message.clone());
        }
    }

    fn on_schedule_expired(&self, schedule: &Schedule) {
        self.schedule_finished(schedule);
    }

    fn on_schedule_cancelled(&self, schedule: &Schedule) {
        self.schedule_finished(schedule);
    }

    fn on_schedule_limit_reached(&self, schedule: &Schedule) {
        self.schedule_finished(schedule);
    }
}
