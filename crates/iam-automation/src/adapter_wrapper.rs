//! Per-schedule adapter holder
//!
//! Adapters are foreign code. Every call into one goes through
//! `catch_unwind`. A recoverable prepare error or a panic becomes a retry,
//! any other prepare error cancels. Readiness failures read as not ready and
//! display failures come back as a typed display error.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::fmt;

use serde_json::Value;

use iam_core::prelude::*;
use iam_core::InAppMessage;

use crate::adapter::{AdapterPrepareResult, InAppMessageAdapter};
use crate::assets::Assets;
use crate::coordinator::DisplayCoordinator;
use crate::display_handler::DisplayHandler;

pub struct AdapterWrapper {
    schedule_id: String,
    message: InAppMessage,
    campaigns: Option<Value>,
    reporting_context: Option<Value>,
    adapter: Mutex<Box<dyn InAppMessageAdapter>>,
    coordinator: Arc<dyn DisplayCoordinator>,
    displayed: AtomicBool,
}

impl fmt::Debug for AdapterWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterWrapper")
            .field("schedule_id", &self.schedule_id)
            .field("message_type", &self.message.message_type())
            .field("coordinator", &self.coordinator)
            .field("displayed", &self.is_displayed())
            .finish()
    }
}

impl AdapterWrapper {
    pub fn new(
        schedule_id: impl Into<String>,
        message: InAppMessage,
        campaigns: Option<Value>,
        reporting_context: Option<Value>,
        adapter: Box<dyn InAppMessageAdapter>,
        coordinator: Arc<dyn DisplayCoordinator>,
    ) -> Self {
        Self {
            schedule_id: schedule_id.into(),
            message,
            campaigns,
            reporting_context,
            adapter: Mutex::new(adapter),
            coordinator,
            displayed: AtomicBool::new(false),
        }
    }

    pub fn schedule_id(&self) -> &str {
        &self.schedule_id
    }

    pub fn message(&self) -> &InAppMessage {
        &self.message
    }

    pub fn campaigns(&self) -> Option<&Value> {
        self.campaigns.as_ref()
    }

    pub fn reporting_context(&self) -> Option<&Value> {
        self.reporting_context.as_ref()
    }

    pub fn is_displayed(&self) -> bool {
        self.displayed.load(Ordering::SeqCst)
    }

    pub fn prepare(&self, assets: Option<Assets>) -> AdapterPrepareResult {
        match catch_unwind(AssertUnwindSafe(|| self.adapter().on_prepare(assets))) {
            Ok(Ok(result)) => result,
            Ok(Err(e)) if e.is_recoverable() => {
                warn!("Adapter failed to prepare {}, retrying: {}", self.schedule_id, e);
                AdapterPrepareResult::Retry
            }
            Ok(Err(e)) => {
                error!("Adapter cannot prepare {}: {}", self.schedule_id, e);
                AdapterPrepareResult::Cancel
            }
            Err(_) => {
                error!("Adapter panicked while preparing {}", self.schedule_id);
                AdapterPrepareResult::Retry
            }
        }
    }

    /// Adapter and coordinator are both ready
    pub fn is_ready(&self) -> bool {
        let adapter_ready = match catch_unwind(AssertUnwindSafe(|| self.adapter().is_ready())) {
            Ok(Ok(ready)) => ready,
            Ok(Err(e)) => {
                error!("Adapter readiness check failed for {}: {}", self.schedule_id, e);
                false
            }
            Err(_) => {
                error!("Adapter panicked in readiness check for {}", self.schedule_id);
                false
            }
        };

        adapter_ready && self.coordinator.is_ready()
    }

    pub fn display(&self) -> Result<()> {
        self.displayed.store(true, Ordering::SeqCst);

        let handler = DisplayHandler::new(
            self.schedule_id.clone(),
            self.message.is_reporting_enabled(),
            self.campaigns.clone().unwrap_or(Value::Null),
            self.reporting_context.clone().unwrap_or(Value::Null),
        );

        match catch_unwind(AssertUnwindSafe(|| self.adapter().on_display(handler))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(Error::display(&self.schedule_id, e.to_string())),
            Err(_) => return Err(Error::display(&self.schedule_id, "adapter panicked")),
        }

        self.coordinator.on_display_started(&self.message);
        Ok(())
    }

    pub fn display_finished(&self) {
        self.coordinator.on_display_finished(&self.message);
    }

    /// Tear the adapter down. Failures are logged.
    pub fn adapter_finished(&self) {
        match catch_unwind(AssertUnwindSafe(|| self.adapter().on_finish())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Adapter teardown failed for {}: {}", self.schedule_id, e),
            Err(_) => error!("Adapter panicked during teardown for {}", self.schedule_id),
        }
    }

    fn adapter(&self) -> MutexGuard<'_, Box<dyn InAppMessageAdapter>> {
        self.adapter.lock().unwrap_or_else(|p| p.into_inner())
    }
}
