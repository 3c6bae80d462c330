//! In-app message manager: the orchestration core
//!
//! Takes a schedule from "due" to "displayed" to "finished":
//!
//! 1. `on_prepare` extends the message, picks an adapter and a coordinator,
//!    then runs asset prepare and adapter prepare as a two-stage pipeline on
//!    the serial retrying executor. Only a fully prepared adapter is
//!    registered.
//! 2. `on_check_execution_readiness` asks the adapter, the coordinator and
//!    the optional display delegate.
//! 3. `on_execute` displays; the adapter later reports back through its
//!    [`DisplayHandler`](crate::display_handler::DisplayHandler).
//! 4. `on_display_finished` cleans up, notifies listeners and releases the
//!    engine's execution slot.
//!
//! No lock is held while calling adapters, listeners, coordinators or
//! callbacks.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;

use iam_core::prelude::*;
use iam_core::{DisplayBehavior, DisplayType, InAppMessage, MessageSource, ResolutionInfo};
use iam_executor::{OperationResult, Pipeline, RetryingExecutor};

use crate::actions::{run_actions, ActionRunner, LoggingActionRunner};
use crate::adapter::{AdapterFactory, AdapterPrepareResult, InAppMessageAdapter};
use crate::adapter_wrapper::AdapterWrapper;
use crate::analytics::{Analytics, InAppReportingEvent};
use crate::assets::{AssetManager, AssetPrepareResult};
use crate::config::{keys, PreferenceDataStore};
use crate::coordinator::{
    DefaultDisplayCoordinator, DisplayCoordinator, ImmediateDisplayCoordinator, ReadyCallback,
};
use crate::engine::{ExecutionCallback, PrepareCallback, PrepareResult, ReadyResult};
use crate::listener::InAppMessageListener;

/// Rewrites a message before it is prepared
pub type MessageExtender = Arc<dyn Fn(InAppMessage) -> Result<InAppMessage> + Send + Sync>;

/// Picks a coordinator for a message; `None` falls back to the display behavior
pub type CoordinatorRequest =
    Arc<dyn Fn(&InAppMessage) -> Option<Arc<dyn DisplayCoordinator>> + Send + Sync>;

/// Host veto over displaying a prepared message
pub trait DisplayDelegate: Send + Sync {
    fn is_message_ready(&self, schedule_id: &str, message: &InAppMessage) -> bool;
}

type SharedPrepareCallback = Arc<Mutex<Option<PrepareCallback>>>;

pub struct InAppMessageManager {
    executor: RetryingExecutor,
    preferences: Arc<PreferenceDataStore>,
    analytics: Arc<dyn Analytics>,
    asset_manager: Arc<dyn AssetManager>,
    action_runner: Mutex<Arc<dyn ActionRunner>>,

    wrappers: Arc<Mutex<HashMap<String, Arc<AdapterWrapper>>>>,
    execution_callbacks: Mutex<HashMap<String, ExecutionCallback>>,
    listeners: Mutex<Vec<Arc<dyn InAppMessageListener>>>,
    factories: Mutex<HashMap<DisplayType, Arc<dyn AdapterFactory>>>,
    extender: Mutex<Option<MessageExtender>>,
    coordinator_request: Mutex<Option<CoordinatorRequest>>,
    display_delegate: Mutex<Option<Arc<dyn DisplayDelegate>>>,

    default_coordinator: Arc<DefaultDisplayCoordinator>,
    immediate_coordinator: Arc<ImmediateDisplayCoordinator>,
    coordinator_ready: ReadyCallback,
    schedule_check: Arc<Mutex<Option<ReadyCallback>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

fn finish_prepare(callback: &SharedPrepareCallback, result: PrepareResult) {
    let callback = lock(callback).take();
    match callback {
        Some(callback) => callback.finish(result),
        None => warn!("Prepare callback already finished, dropping {:?}", result),
    }
}

impl InAppMessageManager {
    /// The executor is paused here and resumed by [`on_ready`](Self::on_ready)
    pub fn new(
        executor: RetryingExecutor,
        preferences: Arc<PreferenceDataStore>,
        analytics: Arc<dyn Analytics>,
        asset_manager: Arc<dyn AssetManager>,
        default_display_interval: Duration,
    ) -> Self {
        executor.set_paused(true);

        let interval_ms = preferences.get_u64(
            keys::DISPLAY_INTERVAL,
            default_display_interval.as_millis() as u64,
        );
        let default_coordinator = Arc::new(DefaultDisplayCoordinator::new(
            Duration::from_millis(interval_ms),
        ));

        let schedule_check: Arc<Mutex<Option<ReadyCallback>>> = Arc::new(Mutex::new(None));
        let coordinator_ready: ReadyCallback = {
            let schedule_check = schedule_check.clone();
            Arc::new(move || {
                let check = lock(&schedule_check).clone();
                if let Some(check) = check {
                    check();
                }
            })
        };
        default_coordinator.set_ready_callback(Some(coordinator_ready.clone()));

        Self {
            executor,
            preferences,
            analytics,
            asset_manager,
            action_runner: Mutex::new(Arc::new(LoggingActionRunner)),
            wrappers: Arc::new(Mutex::new(HashMap::new())),
            execution_callbacks: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            factories: Mutex::new(HashMap::new()),
            extender: Mutex::new(None),
            coordinator_request: Mutex::new(None),
            display_delegate: Mutex::new(None),
            default_coordinator,
            immediate_coordinator: Arc::new(ImmediateDisplayCoordinator::new()),
            coordinator_ready,
            schedule_check,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Registration
    // ─────────────────────────────────────────────────────────────────────────

    /// Register or, with `None`, remove the adapter factory for a display type
    pub fn set_adapter_factory(
        &self,
        display_type: DisplayType,
        factory: Option<Arc<dyn AdapterFactory>>,
    ) {
        let mut factories = lock(&self.factories);
        match factory {
            Some(factory) => {
                factories.insert(display_type, factory);
            }
            None => {
                factories.remove(&display_type);
            }
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn InAppMessageListener>) {
        lock(&self.listeners).push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn InAppMessageListener>) {
        lock(&self.listeners).retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn set_message_extender(&self, extender: Option<MessageExtender>) {
        *lock(&self.extender) = extender;
    }

    pub fn set_coordinator_request(&self, request: Option<CoordinatorRequest>) {
        *lock(&self.coordinator_request) = request;
    }

    pub fn set_display_delegate(&self, delegate: Option<Arc<dyn DisplayDelegate>>) {
        *lock(&self.display_delegate) = delegate;
    }

    pub fn set_action_runner(&self, runner: Arc<dyn ActionRunner>) {
        *lock(&self.action_runner) = runner;
    }

    /// Called whenever a coordinator becomes ready, to re-check pending schedules
    pub fn set_schedule_check_callback(&self, callback: Option<ReadyCallback>) {
        *lock(&self.schedule_check) = callback;
    }

    pub fn display_interval(&self) -> Duration {
        self.default_coordinator.display_interval()
    }

    /// Persist and apply a new interval between default-behavior displays
    pub fn set_display_interval(&self, interval: Duration) -> Result<()> {
        self.preferences
            .put_u64(keys::DISPLAY_INTERVAL, interval.as_millis() as u64)?;
        self.default_coordinator.set_display_interval(interval);
        Ok(())
    }

    /// Startup finished; queued work may run
    pub fn on_ready(&self) {
        self.executor.set_paused(false);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Schedule lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    pub fn on_new_message_schedule(&self, schedule_id: &str, message: InAppMessage) {
        let extender = lock(&self.extender).clone();
        let asset_manager = self.asset_manager.clone();
        let schedule_id = schedule_id.to_string();

        self.executor.execute(move || {
            match extend(extender.as_ref(), message) {
                Ok(message) => asset_manager.on_schedule(&schedule_id, &message),
                Err(e) => warn!("Unable to extend message for {}: {}", schedule_id, e),
            }
        });
    }

    /// The engine dropped the schedule. A prepared adapter that never
    /// displayed is torn down here; a displayed one is released when its
    /// display finishes.
    pub fn on_message_schedule_finished(&self, schedule_id: &str) {
        let asset_manager = self.asset_manager.clone();
        let wrappers = self.wrappers.clone();
        let schedule_id = schedule_id.to_string();

        // Runs on the serial executor so it lands after a queued prepare
        self.executor.execute(move || {
            let released = {
                let mut wrappers = lock(&wrappers);
                let displayed = wrappers.get(&schedule_id).map(|w| w.is_displayed());
                match displayed {
                    Some(false) => wrappers.remove(&schedule_id),
                    _ => None,
                }
            };
            if let Some(wrapper) = released {
                debug!("Releasing prepared adapter for finished schedule {}", schedule_id);
                wrapper.adapter_finished();
            }
            asset_manager.on_finish(&schedule_id);
        });
    }

    pub fn on_prepare(
        &self,
        schedule_id: &str,
        campaigns: Option<Value>,
        reporting_context: Option<Value>,
        message: InAppMessage,
        callback: PrepareCallback,
    ) {
        debug!("Preparing {}", schedule_id);

        let extender = lock(&self.extender).clone();
        let message = match extend(extender.as_ref(), message) {
            Ok(message) => message,
            Err(e) => {
                error!("Failed to extend message for {}: {}", schedule_id, e);
                callback.finish(PrepareResult::Penalize);
                return;
            }
        };

        let adapter = match self.create_adapter(&message) {
            Ok(adapter) => adapter,
            Err(e) => {
                error!("No adapter for {}: {}", schedule_id, e);
                callback.finish(PrepareResult::Penalize);
                return;
            }
        };

        let coordinator = self.resolve_coordinator(&message);
        coordinator.set_ready_callback(Some(self.coordinator_ready.clone()));

        let wrapper = Arc::new(AdapterWrapper::new(
            schedule_id,
            message,
            campaigns,
            reporting_context,
            adapter,
            coordinator,
        ));
        let callback: SharedPrepareCallback = Arc::new(Mutex::new(Some(callback)));

        let prepare_assets = {
            let asset_manager = self.asset_manager.clone();
            let wrapper = wrapper.clone();
            let callback = callback.clone();
            move || {
                let schedule_id = wrapper.schedule_id();
                let result = asset_call(schedule_id, "on_prepare", || {
                    asset_manager.on_prepare(schedule_id, wrapper.message())
                })
                .unwrap_or(AssetPrepareResult::Retry);

                match result {
                    AssetPrepareResult::Ok => OperationResult::Finished,
                    AssetPrepareResult::Retry => {
                        debug!("Assets for {} not ready, retrying", schedule_id);
                        OperationResult::Retry
                    }
                    AssetPrepareResult::Cancel => {
                        debug!("Asset prepare cancelled for {}", schedule_id);
                        asset_call(schedule_id, "on_display_finished", || {
                            asset_manager.on_display_finished(schedule_id, wrapper.message())
                        });
                        finish_prepare(&callback, PrepareResult::Cancel);
                        OperationResult::Cancel
                    }
                }
            }
        };

        let prepare_adapter = {
            let asset_manager = self.asset_manager.clone();
            let wrappers = self.wrappers.clone();
            move || {
                let schedule_id = wrapper.schedule_id();
                let assets = asset_call(schedule_id, "assets", || asset_manager.assets(schedule_id));
                let Some(assets) = assets else {
                    return OperationResult::Retry;
                };

                match wrapper.prepare(assets) {
                    AdapterPrepareResult::Ok => {
                        let previous =
                            lock(&wrappers).insert(schedule_id.to_string(), wrapper.clone());
                        if let Some(previous) = previous.filter(|p| !Arc::ptr_eq(p, &wrapper)) {
                            debug!("Replacing prepared adapter for {}", schedule_id);
                            previous.adapter_finished();
                        }
                        finish_prepare(&callback, PrepareResult::Continue);
                        OperationResult::Finished
                    }
                    AdapterPrepareResult::Retry => {
                        debug!("Adapter for {} not ready, retrying", schedule_id);
                        OperationResult::Retry
                    }
                    AdapterPrepareResult::Cancel => {
                        debug!("Adapter prepare cancelled for {}", schedule_id);
                        finish_prepare(&callback, PrepareResult::Cancel);
                        OperationResult::Cancel
                    }
                }
            }
        };

        self.executor.execute_pipeline(
            Pipeline::new()
                .then(prepare_assets)
                .then(prepare_adapter),
        );
    }

    pub fn on_check_execution_readiness(&self, schedule_id: &str) -> ReadyResult {
        let Some(wrapper) = self.wrapper(schedule_id) else {
            debug!("No prepared adapter for {}, invalidating", schedule_id);
            return ReadyResult::Invalidate;
        };

        if !wrapper.is_ready() {
            return ReadyResult::NotReady;
        }

        let delegate = lock(&self.display_delegate).clone();
        if let Some(delegate) = delegate {
            if !delegate.is_message_ready(schedule_id, wrapper.message()) {
                return ReadyResult::NotReady;
            }
        }

        ReadyResult::Continue
    }

    pub fn on_execute(&self, schedule_id: &str, callback: ExecutionCallback) {
        let Some(wrapper) = self.wrapper(schedule_id) else {
            warn!("Execute requested for {} without a prepared adapter", schedule_id);
            callback.finish();
            return;
        };

        let replaced = lock(&self.execution_callbacks).insert(schedule_id.to_string(), callback);
        if let Some(replaced) = replaced {
            warn!("Execution callback for {} replaced", schedule_id);
            replaced.finish();
        }

        if let Err(e) = wrapper.display() {
            error!("{}", e);

            if let Some(callback) = self.take_execution_callback(schedule_id) {
                callback.finish();
            }
            self.remove_wrapper_if(schedule_id, &wrapper);
            self.executor.execute(move || wrapper.adapter_finished());
            return;
        }

        info!("Displayed {}", schedule_id);
        if wrapper.message().is_reporting_enabled() {
            InAppReportingEvent::display(schedule_id, wrapper.message())
                .with_campaigns(wrapper.campaigns().cloned())
                .with_reporting_context(wrapper.reporting_context().cloned())
                .record(self.analytics.as_ref());
        }

        for listener in self.listeners() {
            listener.on_message_displayed(schedule_id, wrapper.message());
        }
    }

    pub fn on_resolution(&self, schedule_id: &str, resolution: &ResolutionInfo, display_millis: i64) {
        let Some(wrapper) = self.wrapper(schedule_id) else {
            debug!("Resolution for {} without an adapter, ignoring", schedule_id);
            return;
        };

        if wrapper.message().is_reporting_enabled() {
            InAppReportingEvent::resolution(schedule_id, wrapper.message(), display_millis, resolution)
                .with_campaigns(wrapper.campaigns().cloned())
                .with_reporting_context(wrapper.reporting_context().cloned())
                .record(self.analytics.as_ref());
        }
    }

    pub fn on_display_finished(&self, schedule_id: &str, resolution: &ResolutionInfo) {
        let Some(wrapper) = lock(&self.wrappers).remove(schedule_id) else {
            debug!("Display of {} already finished", schedule_id);
            return;
        };

        info!(
            "Display of {} finished: {}",
            schedule_id,
            resolution.resolution_type()
        );

        let runner = lock(&self.action_runner).clone();
        run_actions(runner.as_ref(), wrapper.message().actions());

        for listener in self.listeners() {
            listener.on_message_finished(schedule_id, wrapper.message(), resolution);
        }

        if let Some(callback) = self.take_execution_callback(schedule_id) {
            callback.finish();
        }

        wrapper.display_finished();

        let asset_manager = self.asset_manager.clone();
        self.executor.execute(move || {
            wrapper.adapter_finished();
            asset_manager.on_display_finished(wrapper.schedule_id(), wrapper.message());
        });
    }

    /// Prepared state went stale before execution
    pub fn on_execution_invalidated(&self, schedule_id: &str) {
        let Some(wrapper) = lock(&self.wrappers).remove(schedule_id) else {
            return;
        };

        debug!("Execution of {} invalidated", schedule_id);
        let asset_manager = self.asset_manager.clone();
        self.executor.execute(move || {
            asset_manager.on_display_finished(wrapper.schedule_id(), wrapper.message());
        });
    }

    /// Tear down every prepared adapter once the engine has stopped. Stored
    /// execution callbacks are dropped; a stopped engine no longer waits on
    /// them.
    pub fn release_adapters(&self) {
        let released: Vec<Arc<AdapterWrapper>> =
            lock(&self.wrappers).drain().map(|(_, wrapper)| wrapper).collect();
        let dropped = lock(&self.execution_callbacks).drain().count();
        if released.is_empty() {
            return;
        }

        debug!(
            "Releasing {} prepared adapters ({} executing)",
            released.len(),
            dropped
        );
        for wrapper in released.iter().filter(|w| w.is_displayed()) {
            wrapper.display_finished();
        }

        let asset_manager = self.asset_manager.clone();
        self.executor.execute(move || {
            for wrapper in released {
                wrapper.adapter_finished();
                asset_manager.on_display_finished(wrapper.schedule_id(), wrapper.message());
            }
        });
    }

    /// An execution was cut short (e.g. the app was killed mid-display).
    /// Records a zero-length dismissal.
    pub fn on_execution_interrupted(
        &self,
        schedule_id: &str,
        campaigns: Option<Value>,
        reporting_context: Option<Value>,
        message: Option<InAppMessage>,
    ) {
        let analytics = self.analytics.clone();
        let schedule_id = schedule_id.to_string();

        self.executor.execute(move || {
            if message.as_ref().is_some_and(|m| !m.is_reporting_enabled()) {
                return;
            }
            let source = message
                .as_ref()
                .map(|m| m.source())
                .unwrap_or(MessageSource::RemoteData);

            InAppReportingEvent::interrupted(&schedule_id, source)
                .with_campaigns(campaigns)
                .with_reporting_context(reporting_context)
                .record(analytics.as_ref());
        });
    }

    /// Record an extra event against a prepared display
    pub fn on_add_event(&self, schedule_id: &str, event: InAppReportingEvent) {
        let Some(wrapper) = self.wrapper(schedule_id) else {
            debug!("Event for {} without an adapter, dropping", schedule_id);
            return;
        };

        if wrapper.message().is_reporting_enabled() {
            event
                .with_campaigns(wrapper.campaigns().cloned())
                .with_reporting_context(wrapper.reporting_context().cloned())
                .record(self.analytics.as_ref());
        }
    }

    /// Whether the schedule is currently displayed
    pub fn is_display_allowed(&self, schedule_id: &str) -> bool {
        self.wrapper(schedule_id)
            .is_some_and(|wrapper| wrapper.is_displayed())
    }

    /// Whether a prepared adapter is registered for the schedule
    pub fn is_prepared(&self, schedule_id: &str) -> bool {
        lock(&self.wrappers).contains_key(schedule_id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────────

    fn wrapper(&self, schedule_id: &str) -> Option<Arc<AdapterWrapper>> {
        lock(&self.wrappers).get(schedule_id).cloned()
    }

    fn remove_wrapper_if(&self, schedule_id: &str, wrapper: &Arc<AdapterWrapper>) {
        let mut wrappers = lock(&self.wrappers);
        if wrappers
            .get(schedule_id)
            .is_some_and(|current| Arc::ptr_eq(current, wrapper))
        {
            wrappers.remove(schedule_id);
        }
    }

    fn take_execution_callback(&self, schedule_id: &str) -> Option<ExecutionCallback> {
        lock(&self.execution_callbacks).remove(schedule_id)
    }

    fn listeners(&self) -> Vec<Arc<dyn InAppMessageListener>> {
        lock(&self.listeners).clone()
    }

    fn create_adapter(&self, message: &InAppMessage) -> Result<Box<dyn InAppMessageAdapter>> {
        let factory = lock(&self.factories)
            .get(&message.message_type())
            .cloned()
            .ok_or_else(|| Error::no_adapter(message.message_type().as_str()))?;

        catch_unwind(AssertUnwindSafe(|| factory.create_adapter(message)))
            .unwrap_or_else(|_| Err(Error::adapter("adapter factory panicked")))
    }

    fn resolve_coordinator(&self, message: &InAppMessage) -> Arc<dyn DisplayCoordinator> {
        let request = lock(&self.coordinator_request).clone();
        if let Some(coordinator) = request.and_then(|request| request(message)) {
            return coordinator;
        }

        match message.display_behavior() {
            DisplayBehavior::Immediate => self.immediate_coordinator.clone() as Arc<dyn DisplayCoordinator>,
            DisplayBehavior::Default => self.default_coordinator.clone(),
        }
    }
}

/// Asset manager call inside a prepare stage. A panic is logged and yields
/// `None` so the stage can still answer its callback.
fn asset_call<T>(schedule_id: &str, call: &str, f: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(_) => {
            error!("Asset manager panicked in {} for {}", call, schedule_id);
            None
        }
    }
}

fn extend(extender: Option<&MessageExtender>, message: InAppMessage) -> Result<InAppMessage> {
    match extender {
        Some(extender) => extender(message),
        None => Ok(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::MockAssetManager;
    use crate::test_utils::*;
    use iam_core::{ButtonInfo, JsonMap};
    use iam_executor::BackoffConfig;
    use serde_json::json;
    use crate::assets::Assets;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Fixture {
        manager: InAppMessageManager,
        executor: RetryingExecutor,
        analytics: Arc<RecordingAnalytics>,
        assets: Arc<RecordingAssetManager>,
        factory: Arc<FakeAdapterFactory>,
        listener: Arc<RecordingListener>,
    }

    fn executor() -> RetryingExecutor {
        RetryingExecutor::with_backoff(BackoffConfig::new(
            Duration::from_millis(10),
            Duration::from_millis(40),
        ))
    }

    fn fixture() -> Fixture {
        let executor = executor();
        let analytics = Arc::new(RecordingAnalytics::default());
        let assets = Arc::new(RecordingAssetManager::default());
        let manager = InAppMessageManager::new(
            executor.clone(),
            Arc::new(PreferenceDataStore::in_memory()),
            analytics.clone(),
            assets.clone(),
            Duration::ZERO,
        );
        manager.on_ready();

        let factory = Arc::new(FakeAdapterFactory::default());
        for display_type in DisplayType::ALL {
            manager.set_adapter_factory(display_type, Some(factory.clone()));
        }
        let listener = Arc::new(RecordingListener::default());
        manager.add_listener(listener.clone());

        Fixture {
            manager,
            executor,
            analytics,
            assets,
            factory,
            listener,
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<PrepareResult>>>, PrepareCallback) {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        let callback = PrepareCallback::new(move |result| sink.lock().unwrap().push(result));
        (results, callback)
    }

    fn counting_execution() -> (Arc<AtomicUsize>, ExecutionCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let callback = ExecutionCallback::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (count, callback)
    }

    async fn prepare(f: &Fixture, schedule_id: &str, message: InAppMessage) -> Vec<PrepareResult> {
        let (results, callback) = recorder();
        f.manager
            .on_prepare(schedule_id, Some(test_campaigns()), None, message, callback);
        f.executor.flush().await;
        let results = results.lock().unwrap().clone();
        results
    }

    #[tokio::test]
    async fn test_prepare_registers_wrapper() {
        let f = fixture();
        let results = prepare(&f, "s1", test_message(DisplayType::Banner)).await;

        assert_eq!(results, vec![PrepareResult::Continue]);
        assert!(f.manager.is_prepared("s1"));
        assert_eq!(f.assets.calls(), vec!["prepare:s1"]);
        assert_eq!(f.factory.state.prepare_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_type_penalizes_then_invalidates() {
        let f = fixture();
        f.manager.set_adapter_factory(DisplayType::Html, None);

        let results = prepare(&f, "s1", test_message(DisplayType::Html)).await;

        assert_eq!(results, vec![PrepareResult::Penalize]);
        assert!(!f.manager.is_prepared("s1"));
        assert_eq!(
            f.manager.on_check_execution_readiness("s1"),
            ReadyResult::Invalidate
        );
        assert!(f.assets.calls().is_empty());
    }

    #[tokio::test]
    async fn test_extender_error_penalizes() {
        let f = fixture();
        f.manager
            .set_message_extender(Some(Arc::new(|_: InAppMessage| -> Result<InAppMessage> {
                Err(Error::invalid_message("nope"))
            })));

        let results = prepare(&f, "s1", test_message(DisplayType::Modal)).await;
        assert_eq!(results, vec![PrepareResult::Penalize]);
        assert_eq!(f.factory.created_count(), 0);
    }

    #[tokio::test]
    async fn test_extender_rewrites_message() {
        let f = fixture();
        f.manager.set_message_extender(Some(Arc::new(|message: InAppMessage| {
            message.to_builder().name("extended").build()
        })));

        prepare(&f, "s1", test_message(DisplayType::Modal)).await;
        f.manager.on_execute("s1", ExecutionCallback::new(|| {}));

        let handler = f.factory.state.last_handler().unwrap();
        assert_eq!(handler.schedule_id(), "s1");
        assert_eq!(f.listener.displayed(), vec!["s1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_asset_retry_then_cancel() {
        let f = fixture();
        f.assets.push_prepare_result(AssetPrepareResult::Retry);
        f.assets.push_prepare_result(AssetPrepareResult::Retry);
        f.assets.push_prepare_result(AssetPrepareResult::Cancel);

        let (results, callback) = recorder();
        f.manager
            .on_prepare("s1", None, None, test_message(DisplayType::Banner), callback);
        tokio::time::sleep(Duration::from_secs(1)).await;
        f.executor.flush().await;

        assert_eq!(*results.lock().unwrap(), vec![PrepareResult::Cancel]);
        assert_eq!(f.assets.count("prepare"), 3);
        assert_eq!(f.assets.count("display_finished"), 1);
        assert_eq!(f.factory.state.prepare_count(), 0);
        assert!(!f.manager.is_prepared("s1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_adapter_retry_does_not_repeat_assets() {
        let f = fixture();
        f.factory.state.push_prepare_result(AdapterPrepareResult::Retry);

        let (results, callback) = recorder();
        f.manager
            .on_prepare("s1", None, None, test_message(DisplayType::Banner), callback);
        tokio::time::sleep(Duration::from_secs(1)).await;
        f.executor.flush().await;

        assert_eq!(*results.lock().unwrap(), vec![PrepareResult::Continue]);
        assert_eq!(f.assets.count("prepare"), 1);
        assert_eq!(f.factory.state.prepare_count(), 2);
    }

    #[tokio::test]
    async fn test_adapter_cancel() {
        let f = fixture();
        f.factory.state.push_prepare_result(AdapterPrepareResult::Cancel);

        let results = prepare(&f, "s1", test_message(DisplayType::Banner)).await;

        assert_eq!(results, vec![PrepareResult::Cancel]);
        assert!(!f.manager.is_prepared("s1"));
    }

    #[tokio::test]
    async fn test_reprepare_replaces_wrapper() {
        let f = fixture();
        prepare(&f, "s1", test_message(DisplayType::Banner)).await;
        prepare(&f, "s1", test_message(DisplayType::Banner)).await;

        assert!(f.manager.is_prepared("s1"));
        assert_eq!(f.factory.created_count(), 2);
        // The replaced adapter is torn down
        assert_eq!(f.factory.state.finish_count(), 1);
    }

    #[tokio::test]
    async fn test_readiness() {
        let f = fixture();
        assert_eq!(
            f.manager.on_check_execution_readiness("missing"),
            ReadyResult::Invalidate
        );

        prepare(&f, "s1", test_message(DisplayType::Banner)).await;
        assert_eq!(f.manager.on_check_execution_readiness("s1"), ReadyResult::Continue);

        f.factory.state.set_ready(false);
        assert_eq!(f.manager.on_check_execution_readiness("s1"), ReadyResult::NotReady);
    }

    #[tokio::test]
    async fn test_display_delegate_can_veto() {
        struct Never;
        impl DisplayDelegate for Never {
            fn is_message_ready(&self, _: &str, _: &InAppMessage) -> bool {
                false
            }
        }

        let f = fixture();
        prepare(&f, "s1", test_message(DisplayType::Banner)).await;
        f.manager.set_display_delegate(Some(Arc::new(Never)));

        assert_eq!(f.manager.on_check_execution_readiness("s1"), ReadyResult::NotReady);
    }

    #[tokio::test]
    async fn test_default_coordinator_blocks_second_display() {
        let f = fixture();
        f.manager
            .set_display_interval(Duration::from_secs(30))
            .unwrap();
        prepare(&f, "s1", test_message(DisplayType::Banner)).await;
        prepare(&f, "s2", test_message(DisplayType::Banner)).await;
        prepare(&f, "s3", immediate_message(DisplayType::Banner)).await;

        f.manager.on_execute("s1", ExecutionCallback::new(|| {}));

        assert_eq!(f.manager.on_check_execution_readiness("s2"), ReadyResult::NotReady);
        assert_eq!(f.manager.on_check_execution_readiness("s3"), ReadyResult::Continue);
    }

    #[tokio::test]
    async fn test_coordinator_request_overrides_behavior() {
        let f = fixture();
        let immediate: Arc<dyn DisplayCoordinator> = Arc::new(ImmediateDisplayCoordinator::new());
        f.manager
            .set_coordinator_request(Some(Arc::new(move |_: &InAppMessage| Some(immediate.clone()))));
        f.manager
            .set_display_interval(Duration::from_secs(30))
            .unwrap();

        prepare(&f, "s1", test_message(DisplayType::Banner)).await;
        prepare(&f, "s2", test_message(DisplayType::Banner)).await;
        f.manager.on_execute("s1", ExecutionCallback::new(|| {}));

        assert_eq!(f.manager.on_check_execution_readiness("s2"), ReadyResult::Continue);
    }

    #[tokio::test]
    async fn test_execute_without_wrapper_finishes_immediately() {
        let f = fixture();
        let (count, callback) = counting_execution();

        f.manager.on_execute("missing", callback);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(f.analytics.events().is_empty());
    }

    #[tokio::test]
    async fn test_display_and_finish() {
        let f = fixture();
        prepare(&f, "s1", test_message(DisplayType::Banner)).await;
        let (count, callback) = counting_execution();

        f.manager.on_execute("s1", callback);
        assert!(f.manager.is_display_allowed("s1"));
        assert_eq!(f.listener.displayed(), vec!["s1"]);
        assert_eq!(f.analytics.events_of_type("in_app_display").len(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        let resolution = ResolutionInfo::message_click();
        f.manager.on_resolution("s1", &resolution, 1500);
        f.manager.on_display_finished("s1", &resolution);
        f.executor.flush().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!f.manager.is_prepared("s1"));
        assert!(!f.manager.is_display_allowed("s1"));
        assert_eq!(f.listener.finished(), vec![("s1".to_string(), resolution)]);
        assert_eq!(f.factory.state.finish_count(), 1);
        assert_eq!(f.assets.count("display_finished"), 1);

        let resolutions = f.analytics.events_of_type("in_app_resolution");
        assert_eq!(resolutions.len(), 1);
        assert_eq!(resolutions[0].data["resolution"]["display_time"], "1.500");
        assert_eq!(resolutions[0].data["id"]["message_id"], "s1");
    }

    #[tokio::test]
    async fn test_duplicate_finish_is_noop() {
        let f = fixture();
        prepare(&f, "s1", test_message(DisplayType::Banner)).await;
        let (count, callback) = counting_execution();
        f.manager.on_execute("s1", callback);

        f.manager.on_display_finished("s1", &ResolutionInfo::dismissed());
        f.manager.on_display_finished("s1", &ResolutionInfo::dismissed());
        f.manager.on_resolution("s1", &ResolutionInfo::dismissed(), 10);
        f.executor.flush().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(f.listener.finished().len(), 1);
        assert!(f.analytics.events_of_type("in_app_resolution").is_empty());
        assert_eq!(f.factory.state.finish_count(), 1);
    }

    #[tokio::test]
    async fn test_display_failure_skips_reporting() {
        let f = fixture();
        prepare(&f, "s1", test_message(DisplayType::Banner)).await;
        f.factory.state.set_fail_display(true);
        let (count, callback) = counting_execution();

        f.manager.on_execute("s1", callback);
        f.executor.flush().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(f.analytics.events().is_empty());
        assert!(f.listener.displayed().is_empty());
        assert!(!f.manager.is_prepared("s1"));
        assert_eq!(f.factory.state.finish_count(), 1);
        assert_eq!(
            f.manager.on_check_execution_readiness("s1"),
            ReadyResult::Invalidate
        );
        assert!(!f.manager.is_display_allowed("s1"));
    }

    #[tokio::test]
    async fn test_reporting_disabled() {
        let f = fixture();
        let message = test_message(DisplayType::Banner)
            .to_builder()
            .reporting_enabled(false)
            .build()
            .unwrap();
        prepare(&f, "s1", message).await;

        f.manager.on_execute("s1", ExecutionCallback::new(|| {}));
        f.manager.on_resolution("s1", &ResolutionInfo::timed_out(), 100);
        f.manager.on_display_finished("s1", &ResolutionInfo::timed_out());

        assert!(f.analytics.events().is_empty());
        assert_eq!(f.listener.displayed(), vec!["s1"]);
    }

    #[tokio::test]
    async fn test_button_resolution_event() {
        let f = fixture();
        prepare(&f, "s1", remote_message(DisplayType::Modal)).await;
        f.manager.on_execute("s1", ExecutionCallback::new(|| {}));

        let button = ButtonInfo::new("ok", "A very long button label that goes on");
        f.manager
            .on_resolution("s1", &ResolutionInfo::button_pressed(button), -5);

        let event = &f.analytics.events_of_type("in_app_resolution")[0];
        assert_eq!(event.data["source"], "remote");
        assert_eq!(event.data["id"]["campaigns"], test_campaigns());
        assert_eq!(event.data["resolution"]["display_time"], "0.000");
        assert_eq!(event.data["resolution"]["button_id"], "ok");
        assert_eq!(
            event.data["resolution"]["button_description"]
                .as_str()
                .unwrap()
                .chars()
                .count(),
            30
        );
    }

    #[tokio::test]
    async fn test_actions_run_on_finish() {
        #[derive(Default)]
        struct Runner(Mutex<Vec<String>>);
        impl ActionRunner for Runner {
            fn run(&self, name: &str, _value: &Value) {
                self.0.lock().unwrap().push(name.to_string());
            }
        }

        let f = fixture();
        let runner = Arc::new(Runner::default());
        f.manager.set_action_runner(runner.clone());

        let mut actions = JsonMap::new();
        actions.insert("deep_link_action".into(), json!("app://settings"));
        let message = test_message(DisplayType::Banner)
            .to_builder()
            .actions(actions)
            .build()
            .unwrap();
        prepare(&f, "s1", message).await;
        f.manager.on_execute("s1", ExecutionCallback::new(|| {}));
        f.manager
            .on_display_finished("s1", &ResolutionInfo::message_click());

        assert_eq!(*runner.0.lock().unwrap(), vec!["deep_link_action"]);
    }

    #[tokio::test]
    async fn test_execution_invalidated() {
        let f = fixture();
        prepare(&f, "s1", test_message(DisplayType::Banner)).await;

        f.manager.on_execution_invalidated("s1");
        f.executor.flush().await;

        assert!(!f.manager.is_prepared("s1"));
        assert_eq!(f.assets.count("display_finished"), 1);
        assert_eq!(f.factory.state.finish_count(), 0);
    }

    #[tokio::test]
    async fn test_execution_interrupted_records_dismissal() {
        let f = fixture();
        f.manager.on_execution_interrupted("s1", None, Some(json!({"k": 1})), None);
        f.executor.flush().await;

        let events = f.analytics.events_of_type("in_app_resolution");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data["resolution"]["type"], "user_dismissed");
        assert_eq!(events[0].data["source"], "remote");
        assert_eq!(events[0].data["context"]["reporting_context"]["k"], 1);

        let quiet = test_message(DisplayType::Banner)
            .to_builder()
            .reporting_enabled(false)
            .build()
            .unwrap();
        f.manager.on_execution_interrupted("s2", None, None, Some(quiet));
        f.executor.flush().await;
        assert_eq!(f.analytics.events().len(), 1);
    }

    #[tokio::test]
    async fn test_add_event_uses_wrapper_context() {
        let f = fixture();
        let message = remote_message(DisplayType::Banner);
        f.manager.on_add_event(
            "s1",
            InAppReportingEvent::button_tap("s1", &message, "b"),
        );
        assert!(f.analytics.events().is_empty());

        prepare(&f, "s1", message.clone()).await;
        f.manager.on_add_event(
            "s1",
            InAppReportingEvent::button_tap("s1", &message, "b"),
        );

        let events = f.analytics.events_of_type("in_app_button_tap");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data["id"]["campaigns"], test_campaigns());
    }

    /// Asset manager whose cleanup always panics and whose `assets` lookup
    /// panics a set number of times
    #[derive(Default)]
    struct PanickingAssets {
        cancel: AtomicBool,
        asset_panics: AtomicUsize,
        lookups: AtomicUsize,
    }

    impl AssetManager for PanickingAssets {
        fn on_schedule(&self, _: &str, _: &InAppMessage) {}

        fn on_prepare(&self, _: &str, _: &InAppMessage) -> AssetPrepareResult {
            if self.cancel.load(Ordering::SeqCst) {
                AssetPrepareResult::Cancel
            } else {
                AssetPrepareResult::Ok
            }
        }

        fn on_display_finished(&self, schedule_id: &str, _: &InAppMessage) {
            panic!("cleanup failed for {}", schedule_id);
        }

        fn on_finish(&self, _: &str) {}

        fn assets(&self, schedule_id: &str) -> Option<Assets> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            let remaining = self.asset_panics.load(Ordering::SeqCst);
            if remaining > 0 {
                self.asset_panics.store(remaining - 1, Ordering::SeqCst);
                panic!("asset lookup failed for {}", schedule_id);
            }
            None
        }
    }

    fn manager_with_assets(executor: &RetryingExecutor, assets: Arc<PanickingAssets>) -> InAppMessageManager {
        let manager = InAppMessageManager::new(
            executor.clone(),
            Arc::new(PreferenceDataStore::in_memory()),
            Arc::new(RecordingAnalytics::default()),
            assets,
            Duration::ZERO,
        );
        manager.on_ready();
        manager.set_adapter_factory(
            DisplayType::Banner,
            Some(Arc::new(FakeAdapterFactory::default())),
        );
        manager
    }

    #[tokio::test]
    async fn test_asset_cleanup_panic_still_cancels_prepare() {
        let executor = executor();
        let assets = Arc::new(PanickingAssets::default());
        assets.cancel.store(true, Ordering::SeqCst);
        let manager = manager_with_assets(&executor, assets.clone());

        let (results, callback) = recorder();
        manager.on_prepare("s1", None, None, test_message(DisplayType::Banner), callback);
        executor.flush().await;

        assert_eq!(*results.lock().unwrap(), vec![PrepareResult::Cancel]);
        assert!(!manager.is_prepared("s1"));
        assert_eq!(assets.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_asset_lookup_panic_retries_adapter_stage() {
        let executor = executor();
        let assets = Arc::new(PanickingAssets::default());
        assets.asset_panics.store(1, Ordering::SeqCst);
        let manager = manager_with_assets(&executor, assets.clone());

        let (results, callback) = recorder();
        manager.on_prepare("s1", None, None, test_message(DisplayType::Banner), callback);
        tokio::time::sleep(Duration::from_secs(1)).await;
        executor.flush().await;

        assert_eq!(*results.lock().unwrap(), vec![PrepareResult::Continue]);
        assert_eq!(assets.lookups.load(Ordering::SeqCst), 2);
        assert!(manager.is_prepared("s1"));
    }

    #[tokio::test]
    async fn test_finished_schedule_releases_prepared_adapter() {
        let f = fixture();
        prepare(&f, "s1", test_message(DisplayType::Banner)).await;
        assert!(f.manager.is_prepared("s1"));

        f.manager.on_message_schedule_finished("s1");
        f.executor.flush().await;

        assert!(!f.manager.is_prepared("s1"));
        assert_eq!(
            f.manager.on_check_execution_readiness("s1"),
            ReadyResult::Invalidate
        );
        assert_eq!(f.factory.state.finish_count(), 1);
        assert_eq!(f.assets.calls(), vec!["prepare:s1", "finish:s1"]);
    }

    #[tokio::test]
    async fn test_finished_schedule_keeps_displayed_adapter() {
        let f = fixture();
        prepare(&f, "s1", test_message(DisplayType::Banner)).await;
        let (count, callback) = counting_execution();
        f.manager.on_execute("s1", callback);

        f.manager.on_message_schedule_finished("s1");
        f.executor.flush().await;

        assert!(f.manager.is_display_allowed("s1"));
        assert_eq!(f.factory.state.finish_count(), 0);

        f.manager
            .on_display_finished("s1", &ResolutionInfo::dismissed());
        f.executor.flush().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(f.listener.finished().len(), 1);
        assert_eq!(f.factory.state.finish_count(), 1);
    }

    #[tokio::test]
    async fn test_release_adapters_tears_everything_down() {
        let f = fixture();
        prepare(&f, "s1", test_message(DisplayType::Banner)).await;
        prepare(&f, "s2", test_message(DisplayType::Banner)).await;
        let (count, callback) = counting_execution();
        f.manager.on_execute("s1", callback);

        f.manager.release_adapters();
        f.executor.flush().await;

        assert!(!f.manager.is_prepared("s1"));
        assert!(!f.manager.is_prepared("s2"));
        assert_eq!(f.factory.state.finish_count(), 2);
        assert_eq!(f.assets.count("display_finished"), 2);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // A late finish from the displayed adapter is ignored
        f.manager
            .on_display_finished("s1", &ResolutionInfo::dismissed());
        assert!(f.listener.finished().is_empty());
    }

    #[tokio::test]
    async fn test_schedule_lifecycle_reaches_asset_manager() {
        let f = fixture();
        f.manager
            .on_new_message_schedule("s1", test_message(DisplayType::Banner));
        f.manager.on_message_schedule_finished("s1");
        f.executor.flush().await;

        assert_eq!(f.assets.calls(), vec!["schedule:s1", "finish:s1"]);
    }

    #[tokio::test]
    async fn test_executor_paused_until_ready() {
        let executor = executor();
        let manager = InAppMessageManager::new(
            executor.clone(),
            Arc::new(PreferenceDataStore::in_memory()),
            Arc::new(RecordingAnalytics::default()),
            Arc::new(RecordingAssetManager::default()),
            Duration::ZERO,
        );
        assert!(executor.is_paused());
        manager.on_ready();
        assert!(!executor.is_paused());
    }

    #[tokio::test]
    async fn test_display_interval_persisted() {
        let preferences = Arc::new(PreferenceDataStore::in_memory());
        let manager = InAppMessageManager::new(
            executor(),
            preferences.clone(),
            Arc::new(RecordingAnalytics::default()),
            Arc::new(RecordingAssetManager::default()),
            Duration::from_secs(30),
        );
        assert_eq!(manager.display_interval(), Duration::from_secs(30));

        manager.set_display_interval(Duration::from_secs(5)).unwrap();
        assert_eq!(preferences.get_u64(keys::DISPLAY_INTERVAL, 0), 5_000);

        let reopened = InAppMessageManager::new(
            executor(),
            preferences,
            Arc::new(RecordingAnalytics::default()),
            Arc::new(RecordingAssetManager::default()),
            Duration::from_secs(30),
        );
        assert_eq!(reopened.display_interval(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_coordinator_ready_triggers_schedule_check() {
        let f = fixture();
        let checks = Arc::new(AtomicUsize::new(0));
        let counter = checks.clone();
        f.manager
            .set_schedule_check_callback(Some(Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })));

        prepare(&f, "s1", test_message(DisplayType::Banner)).await;
        f.manager.on_execute("s1", ExecutionCallback::new(|| {}));
        f.manager
            .on_display_finished("s1", &ResolutionInfo::dismissed());

        // Zero interval: the coordinator unlocks as soon as the display ends
        assert_eq!(checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_asset_manager_mock_sees_extended_message() {
        let executor = executor();
        let mut assets = MockAssetManager::new();
        assets
            .expect_on_prepare()
            .withf(|id, message| id == "s1" && message.name() == Some("extended"))
            .times(1)
            .returning(|_, _| AssetPrepareResult::Ok);
        assets.expect_assets().returning(|_| None);

        let manager = InAppMessageManager::new(
            executor.clone(),
            Arc::new(PreferenceDataStore::in_memory()),
            Arc::new(RecordingAnalytics::default()),
            Arc::new(assets),
            Duration::ZERO,
        );
        manager.on_ready();
        manager.set_adapter_factory(
            DisplayType::Banner,
            Some(Arc::new(FakeAdapterFactory::default())),
        );
        manager.set_message_extender(Some(Arc::new(|message: InAppMessage| {
            message.to_builder().name("extended").build()
        })));

        let (results, callback) = recorder();
        manager.on_prepare("s1", None, None, test_message(DisplayType::Banner), callback);
        executor.flush().await;

        assert_eq!(*results.lock().unwrap(), vec![PrepareResult::Continue]);
    }

    #[tokio::test]
    async fn test_remove_listener() {
        let f = fixture();
        let listener: Arc<dyn InAppMessageListener> = f.listener.clone();
        f.manager.remove_listener(&listener);

        prepare(&f, "s1", test_message(DisplayType::Banner)).await;
        f.manager.on_execute("s1", ExecutionCallback::new(|| {}));
        assert!(f.listener.displayed().is_empty());
    }
}
