//! Headless mode runner - drives a scenario through the full stack
//!
//! Wires [`InAppAutomation`] to an [`InMemoryEngine`], an adapter that
//! parks display handlers until a scenario step resolves them, and an event
//! forwarder that turns listener, delegate and analytics callbacks into
//! [`HeadlessEvent`]s.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use iam_automation::config::load_settings;
use iam_automation::remote_data::REMOTE_DATA_INFO_KEY;
use iam_automation::{
    AdapterFactory, AdapterPrepareResult, Analytics, AnalyticsEvent, AssetCache, Assets,
    DisplayDelegate, DisplayHandler, InAppAutomation, InAppMessageAdapter, InAppMessageListener,
    InAppMessageManager, InMemoryEngine, NoRemoteData, PreferenceDataStore, RemoteDataObserver,
    Settings,
};
use iam_core::prelude::*;
use iam_core::{DisplayType, InAppMessage, ResolutionInfo, TriggerContext};
use iam_executor::RetryingExecutor;

use super::HeadlessEvent;
use crate::scenario::{Scenario, Step};

/// Time given to cooldown timers and follow-up checks after every step
const SETTLE: Duration = Duration::from_millis(20);

/// Run a scenario file, writing NDJSON events to stdout
pub async fn run_headless(scenario_path: &Path, display_interval_ms: Option<u64>) -> Result<()> {
    info!("═══════════════════════════════════════════════════════");
    info!("iamctl starting in HEADLESS mode");
    info!("Scenario: {}", scenario_path.display());
    info!("═══════════════════════════════════════════════════════");

    let mut scenario = match Scenario::load(scenario_path) {
        Ok(scenario) => scenario,
        Err(e) => {
            HeadlessEvent::error(e.to_string(), true).emit();
            return Err(e);
        }
    };
    if display_interval_ms.is_some() {
        scenario.display_interval_ms = display_interval_ms;
    }

    let config_dir = scenario_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let settings = load_settings(config_dir);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let run = run_scenario(&scenario, &settings, event_tx);
    tokio::pin!(run);

    let result = loop {
        tokio::select! {
            result = &mut run => break result,
            Some(event) = event_rx.recv() => event.emit(),
        }
    };
    while let Ok(event) = event_rx.try_recv() {
        event.emit();
    }

    if let Err(e) = &result {
        HeadlessEvent::error(e.to_string(), true).emit();
    }

    info!("iamctl headless mode exiting");
    result
}

/// Run a parsed scenario, sending events to `events`
pub async fn run_scenario(
    scenario: &Scenario,
    settings: &Settings,
    events: mpsc::UnboundedSender<HeadlessEvent>,
) -> Result<()> {
    let forwarder = Arc::new(EventForwarder::new(events));
    let adapters = Arc::new(ScenarioAdapterFactory::default());

    let executor = RetryingExecutor::with_backoff(settings.executor.backoff());
    let preferences = Arc::new(PreferenceDataStore::in_memory());
    let display_interval = Duration::from_millis(
        scenario
            .display_interval_ms
            .unwrap_or(settings.display.interval_ms),
    );

    let manager = InAppMessageManager::new(
        executor.clone(),
        preferences.clone(),
        forwarder.clone(),
        Arc::new(AssetCache::new(settings.assets.cache_dir())),
        display_interval,
    );
    for display_type in DisplayType::ALL {
        manager.set_adapter_factory(display_type, Some(adapters.clone() as Arc<dyn AdapterFactory>));
    }
    manager.add_listener(forwarder.clone());
    manager.set_display_delegate(Some(forwarder.clone() as Arc<dyn DisplayDelegate>));

    let engine = InMemoryEngine::new(settings.engine.schedule_limit);
    let remote_data = RemoteDataObserver::new(Arc::new(NoRemoteData), preferences.clone());
    remote_data.notify_schedules_updated(&json!({ "source": "scenario" }))?;

    let automation = InAppAutomation::new(
        Arc::new(engine.clone()),
        Arc::new(manager),
        preferences,
        remote_data,
    );
    automation.start()?;

    let mut runner = StepRunner {
        scenario,
        automation: &automation,
        engine: &engine,
        adapters: &adapters,
        schedule_ids: HashMap::new(),
    };

    let outcome = runner.run(&forwarder, &executor).await;

    automation.stop();
    executor.flush().await;
    outcome
}

// ─────────────────────────────────────────────────────────────────────────────
// Steps
// ─────────────────────────────────────────────────────────────────────────────

struct StepRunner<'a> {
    scenario: &'a Scenario,
    automation: &'a InAppAutomation,
    engine: &'a InMemoryEngine,
    adapters: &'a ScenarioAdapterFactory,
    schedule_ids: HashMap<String, String>,
}

impl StepRunner<'_> {
    async fn run(&mut self, forwarder: &EventForwarder, executor: &RetryingExecutor) -> Result<()> {
        for schedule in &self.scenario.schedules {
            let info = schedule.to_info()?;
            let metadata = json!({
                "name": schedule.name,
                REMOTE_DATA_INFO_KEY: { "source": "scenario" },
            });
            let created = self.automation.schedule(info, metadata)?;

            forwarder.send(HeadlessEvent::schedule_created(&created.id, &schedule.name));
            self.schedule_ids
                .insert(schedule.name.clone(), created.id.clone());
        }
        settle(executor).await;

        for (index, step) in self.scenario.steps.iter().enumerate() {
            debug!("Step {}: {}", index + 1, step.action());
            if let Err(e) = self.run_step(step).await {
                warn!("Step {} ({}) failed: {}", index + 1, step.action(), e);
                forwarder.send(HeadlessEvent::error(
                    format!("step {} ({}): {}", index + 1, step.action(), e),
                    false,
                ));
            }
            settle(executor).await;
        }
        Ok(())
    }

    async fn run_step(&self, step: &Step) -> Result<()> {
        match step {
            Step::Event { trigger, value } => {
                let event = value.map_or(Value::Null, |value| json!({ "value": value }));
                let fired = self.engine.process_event(*trigger, event);
                debug!("{:?} event fired {} schedules", trigger, fired.len());
            }
            Step::Trigger { schedule } => {
                let schedule_id = self.schedule_id(schedule)?;
                let trigger = self
                    .scenario
                    .schedule(schedule)
                    .and_then(|s| s.triggers.first().cloned())
                    .ok_or_else(|| Error::invalid_schedule(format!("{} has no trigger", schedule)))?;

                if !self
                    .engine
                    .trigger(schedule_id, TriggerContext::new(trigger, Value::Null))?
                {
                    return Err(Error::invalid_schedule(format!(
                        "{} is not eligible to run",
                        schedule
                    )));
                }
            }
            Step::Resolve {
                schedule,
                resolution,
                display_ms,
            } => {
                let schedule_id = self.schedule_id(schedule)?;
                let handler = self
                    .adapters
                    .take_handler(schedule_id)
                    .ok_or_else(|| Error::display(schedule_id, "message is not on screen"))?;
                handler.finished(resolution.clone(), *display_ms);
            }
            Step::Wait { ms } => tokio::time::sleep(Duration::from_millis(*ms)).await,
            Step::Pause => self.automation.set_paused(true)?,
            Step::Resume => self.automation.set_paused(false)?,
            Step::Cancel { schedule } => {
                let schedule_id = self.schedule_id(schedule)?;
                if !self.automation.cancel_schedule(schedule_id)? {
                    debug!("{} was already gone", schedule);
                }
            }
            Step::SetDisplayInterval { ms } => self
                .automation
                .manager()
                .set_display_interval(Duration::from_millis(*ms))?,
        }
        Ok(())
    }

    fn schedule_id(&self, name: &str) -> Result<&str> {
        self.schedule_ids
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| Error::schedule_not_found(name))
    }
}

async fn settle(executor: &RetryingExecutor) {
    executor.flush().await;
    tokio::time::sleep(SETTLE).await;
    executor.flush().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Event forwarding
// ─────────────────────────────────────────────────────────────────────────────

/// Turns orchestration callbacks into headless events
struct EventForwarder {
    events: mpsc::UnboundedSender<HeadlessEvent>,
    /// Schedules already reported as prepared in their current cycle
    prepared: Mutex<HashSet<String>>,
}

impl EventForwarder {
    fn new(events: mpsc::UnboundedSender<HeadlessEvent>) -> Self {
        Self {
            events,
            prepared: Mutex::new(HashSet::new()),
        }
    }

    fn send(&self, event: HeadlessEvent) {
        if self.events.send(event).is_err() {
            debug!("Headless event receiver closed");
        }
    }

    fn lock_prepared(&self) -> MutexGuard<'_, HashSet<String>> {
        self.prepared.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Analytics for EventForwarder {
    fn add_event(&self, event: AnalyticsEvent) {
        self.send(HeadlessEvent::event_recorded(&event));
    }
}

impl InAppMessageListener for EventForwarder {
    fn on_message_displayed(&self, schedule_id: &str, _message: &InAppMessage) {
        self.send(HeadlessEvent::displayed(schedule_id));
    }

    fn on_message_finished(
        &self,
        schedule_id: &str,
        _message: &InAppMessage,
        resolution: &ResolutionInfo,
    ) {
        self.lock_prepared().remove(schedule_id);
        self.send(HeadlessEvent::finished(schedule_id, resolution.clone()));
    }
}

/// Readiness is only asked of prepared schedules, so the first ask of a
/// cycle marks the end of preparation.
impl DisplayDelegate for EventForwarder {
    fn is_message_ready(&self, schedule_id: &str, _message: &InAppMessage) -> bool {
        if self.lock_prepared().insert(schedule_id.to_string()) {
            self.send(HeadlessEvent::prepared(schedule_id));
        }
        true
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Adapter
// ─────────────────────────────────────────────────────────────────────────────

type HandlerSlots = Arc<Mutex<HashMap<String, DisplayHandler>>>;

/// Creates adapters that hold on to their display handler until a
/// `resolve` step takes it
#[derive(Default)]
struct ScenarioAdapterFactory {
    handlers: HandlerSlots,
}

impl ScenarioAdapterFactory {
    fn take_handler(&self, schedule_id: &str) -> Option<DisplayHandler> {
        self.handlers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(schedule_id)
    }
}

impl AdapterFactory for ScenarioAdapterFactory {
    fn create_adapter(&self, _message: &InAppMessage) -> Result<Box<dyn InAppMessageAdapter>> {
        Ok(Box::new(ScenarioAdapter {
            handlers: self.handlers.clone(),
        }))
    }
}

struct ScenarioAdapter {
    handlers: HandlerSlots,
}

impl InAppMessageAdapter for ScenarioAdapter {
    fn on_prepare(&mut self, _assets: Option<Assets>) -> Result<AdapterPrepareResult> {
        Ok(AdapterPrepareResult::Ok)
    }

    fn is_ready(&self) -> Result<bool> {
        Ok(true)
    }

    fn on_display(&mut self, handler: DisplayHandler) -> Result<()> {
        self.handlers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(handler.schedule_id().to_string(), handler);
        Ok(())
    }

    fn on_finish(&mut self) -> Result<()> {
        Ok(())
    }
}
