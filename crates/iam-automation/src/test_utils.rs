//! Test fakes for in-app automation
//!
//! Available with `#[cfg(test)]` inside this crate and to other crates via
//! the `test-helpers` feature.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use iam_core::prelude::*;
use iam_core::{
    DisplayBehavior, DisplayType, InAppMessage, MessageSource, ResolutionInfo, ScheduleInfo,
    Trigger, TriggerType,
};

use crate::adapter::{AdapterFactory, AdapterPrepareResult, InAppMessageAdapter};
use crate::analytics::{Analytics, AnalyticsEvent};
use crate::assets::{AssetManager, AssetPrepareResult, Assets};
use crate::display_handler::DisplayHandler;
use crate::listener::InAppMessageListener;

// ─────────────────────────────────────────────────────────────────────────────
// Messages
// ─────────────────────────────────────────────────────────────────────────────

pub fn test_message(display_type: DisplayType) -> InAppMessage {
    InAppMessage::builder(display_type)
        .display_content(json!({"body": {"text": "Hello"}}))
        .name("test message")
        .build()
        .expect("valid test message")
}

pub fn immediate_message(display_type: DisplayType) -> InAppMessage {
    test_message(display_type)
        .to_builder()
        .display_behavior(DisplayBehavior::Immediate)
        .build()
        .expect("valid test message")
}

pub fn remote_message(display_type: DisplayType) -> InAppMessage {
    test_message(display_type)
        .to_builder()
        .source(MessageSource::RemoteData)
        .build()
        .expect("valid test message")
}

/// Single-execution schedule fired by one foreground event
pub fn test_schedule_info(message: InAppMessage) -> ScheduleInfo {
    ScheduleInfo::new(message, vec![Trigger::new(TriggerType::Foreground, 1.0)])
}

// ─────────────────────────────────────────────────────────────────────────────
// Analytics
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingAnalytics {
    events: Mutex<Vec<AnalyticsEvent>>,
}

impl RecordingAnalytics {
    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<AnalyticsEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

impl Analytics for RecordingAnalytics {
    fn add_event(&self, event: AnalyticsEvent) {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Adapter
// ─────────────────────────────────────────────────────────────────────────────

/// Shared knobs and counters for every [`FakeAdapter`] a factory creates
pub struct FakeAdapterState {
    prepare_results: Mutex<VecDeque<AdapterPrepareResult>>,
    ready: AtomicBool,
    fail_display: AtomicBool,
    pub prepare_calls: AtomicUsize,
    pub display_calls: AtomicUsize,
    pub finish_calls: AtomicUsize,
    handlers: Mutex<Vec<DisplayHandler>>,
}

impl Default for FakeAdapterState {
    fn default() -> Self {
        Self {
            prepare_results: Mutex::new(VecDeque::new()),
            ready: AtomicBool::new(true),
            fail_display: AtomicBool::new(false),
            prepare_calls: AtomicUsize::new(0),
            display_calls: AtomicUsize::new(0),
            finish_calls: AtomicUsize::new(0),
            handlers: Mutex::new(Vec::new()),
        }
    }
}

impl FakeAdapterState {
    /// Queue a prepare result. Once the queue is empty prepares return `Ok`.
    pub fn push_prepare_result(&self, result: AdapterPrepareResult) {
        self.prepare_results
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(result);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_fail_display(&self, fail: bool) {
        self.fail_display.store(fail, Ordering::SeqCst);
    }

    pub fn prepare_count(&self) -> usize {
        self.prepare_calls.load(Ordering::SeqCst)
    }

    pub fn display_count(&self) -> usize {
        self.display_calls.load(Ordering::SeqCst)
    }

    pub fn finish_count(&self) -> usize {
        self.finish_calls.load(Ordering::SeqCst)
    }

    /// Handler from the most recent successful display
    pub fn last_handler(&self) -> Option<DisplayHandler> {
        self.handlers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .last()
            .cloned()
    }
}

pub struct FakeAdapter {
    state: Arc<FakeAdapterState>,
}

impl InAppMessageAdapter for FakeAdapter {
    fn on_prepare(&mut self, _assets: Option<Assets>) -> Result<AdapterPrepareResult> {
        self.state.prepare_calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .state
            .prepare_results
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        Ok(next.unwrap_or(AdapterPrepareResult::Ok))
    }

    fn is_ready(&self) -> Result<bool> {
        Ok(self.state.ready.load(Ordering::SeqCst))
    }

    fn on_display(&mut self, handler: DisplayHandler) -> Result<()> {
        self.state.display_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_display.load(Ordering::SeqCst) {
            return Err(Error::adapter("display failed"));
        }
        self.state
            .handlers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(handler);
        Ok(())
    }

    fn on_finish(&mut self) -> Result<()> {
        self.state.finish_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeAdapterFactory {
    pub state: Arc<FakeAdapterState>,
    created: AtomicUsize,
}

impl FakeAdapterFactory {
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl AdapterFactory for FakeAdapterFactory {
    fn create_adapter(&self, _message: &InAppMessage) -> Result<Box<dyn InAppMessageAdapter>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeAdapter {
            state: self.state.clone(),
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Asset manager
// ─────────────────────────────────────────────────────────────────────────────

/// Asset manager that records calls and answers prepares from a queue
#[derive(Default)]
pub struct RecordingAssetManager {
    prepare_results: Mutex<VecDeque<AssetPrepareResult>>,
    calls: Mutex<Vec<String>>,
}

impl RecordingAssetManager {
    /// Queue a prepare result. Once the queue is empty prepares return `Ok`.
    pub fn push_prepare_result(&self, result: AssetPrepareResult) {
        self.prepare_results
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(result);
    }

    /// Calls as `"<operation>:<schedule_id>"`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        let prefix = format!("{}:", operation);
        self.calls()
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    fn record(&self, operation: &str, schedule_id: &str) {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(format!("{}:{}", operation, schedule_id));
    }
}

impl AssetManager for RecordingAssetManager {
    fn on_schedule(&self, schedule_id: &str, _message: &InAppMessage) {
        self.record("schedule", schedule_id);
    }

    fn on_prepare(&self, schedule_id: &str, _message: &InAppMessage) -> AssetPrepareResult {
        self.record("prepare", schedule_id);
        self.prepare_results
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .unwrap_or(AssetPrepareResult::Ok)
    }

    fn on_display_finished(&self, schedule_id: &str, _message: &InAppMessage) {
        self.record("display_finished", schedule_id);
    }

    fn on_finish(&self, schedule_id: &str) {
        self.record("finish", schedule_id);
    }

    fn assets(&self, _schedule_id: &str) -> Option<Assets> {
        None
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Listener
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingListener {
    displayed: Mutex<Vec<String>>,
    finished: Mutex<Vec<(String, ResolutionInfo)>>,
}

impl RecordingListener {
    pub fn displayed(&self) -> Vec<String> {
        self.displayed.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn finished(&self) -> Vec<(String, ResolutionInfo)> {
        self.finished.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl InAppMessageListener for RecordingListener {
    fn on_message_displayed(&self, schedule_id: &str, _message: &InAppMessage) {
        self.displayed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(schedule_id.to_string());
    }

    fn on_message_finished(
        &self,
        schedule_id: &str,
        _message: &InAppMessage,
        resolution: &ResolutionInfo,
    ) {
        self.finished
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((schedule_id.to_string(), resolution.clone()));
    }
}

/// Campaigns document shaped like a remote-data payload's
pub fn test_campaigns() -> Value {
    json!({"categories": ["onboarding"]})
}
