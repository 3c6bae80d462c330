//! Handle given to a display adapter for reporting back
//!
//! A [`DisplayHandler`] is a plain value: it can be flattened to a string,
//! carried across a process or UI boundary, and rebuilt. It does not hold a
//! reference to the automation instance; every operation looks up the
//! process-wide instance at call time.

use serde_json::Value;

use iam_core::prelude::*;
use iam_core::ResolutionInfo;

use crate::analytics::InAppReportingEvent;
use crate::automation::InAppAutomation;
use crate::registry;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DisplayHandler {
    schedule_id: String,
    reporting_enabled: bool,
    campaigns: Value,
    reporting_context: Value,
}

impl DisplayHandler {
    pub fn new(
        schedule_id: impl Into<String>,
        reporting_enabled: bool,
        campaigns: Value,
        reporting_context: Value,
    ) -> Self {
        Self {
            schedule_id: schedule_id.into(),
            reporting_enabled,
            campaigns,
            reporting_context,
        }
    }

    pub fn schedule_id(&self) -> &str {
        &self.schedule_id
    }

    pub fn is_reporting_enabled(&self) -> bool {
        self.reporting_enabled
    }

    pub fn campaigns(&self) -> &Value {
        &self.campaigns
    }

    pub fn reporting_context(&self) -> &Value {
        &self.reporting_context
    }

    /// The display ended. Records the resolution, finishes the display and,
    /// for a cancel button, cancels every future display of the schedule.
    pub fn finished(&self, resolution: ResolutionInfo, display_millis: i64) {
        let Some(automation) = self.automation() else {
            return;
        };

        let manager = automation.manager();
        manager.on_resolution(&self.schedule_id, &resolution, display_millis);
        manager.on_display_finished(&self.schedule_id, &resolution);

        if resolution.cancels_schedule() {
            if let Err(e) = automation.cancel_schedule(&self.schedule_id) {
                warn!("Failed to cancel schedule {}: {}", self.schedule_id, e);
            }
        }
    }

    /// Finish the display without recording a resolution event
    pub fn notify_finished(&self, resolution: ResolutionInfo) {
        if let Some(automation) = self.automation() {
            automation
                .manager()
                .on_display_finished(&self.schedule_id, &resolution);
        }
    }

    /// Record an extra event (e.g. a button tap) against this display
    pub fn add_event(&self, event: InAppReportingEvent) {
        if !self.reporting_enabled {
            debug!(
                "Reporting disabled for {}, dropping {}",
                self.schedule_id,
                event.event_type()
            );
            return;
        }
        if let Some(automation) = self.automation() {
            automation.manager().on_add_event(&self.schedule_id, event);
        }
    }

    pub fn cancel_future_displays(&self) {
        if let Some(automation) = self.automation() {
            if let Err(e) = automation.cancel_schedule(&self.schedule_id) {
                warn!("Failed to cancel schedule {}: {}", self.schedule_id, e);
            }
        }
    }

    /// Whether the message is still the one being displayed
    pub fn is_display_allowed(&self) -> bool {
        self.automation()
            .is_some_and(|a| a.manager().is_display_allowed(&self.schedule_id))
    }

    /// Flatten to `[schedule_id, 0|1, campaigns_json, reporting_context_json]`
    pub fn encode(&self) -> String {
        let flat = Value::Array(vec![
            Value::String(self.schedule_id.clone()),
            Value::from(u8::from(self.reporting_enabled)),
            Value::String(self.campaigns.to_string()),
            Value::String(self.reporting_context.to_string()),
        ]);
        flat.to_string()
    }

    /// Rebuild a handler from [`encode`](Self::encode) output. Malformed input
    /// yields an inert default handler.
    pub fn decode(encoded: &str) -> Self {
        match Self::try_decode(encoded) {
            Ok(handler) => handler,
            Err(e) => {
                warn!("Unable to decode display handler: {}", e);
                Self::default()
            }
        }
    }

    fn try_decode(encoded: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(encoded)?;
        let parts = value
            .as_array()
            .filter(|parts| parts.len() == 4)
            .ok_or_else(|| Error::invalid_message("expected a 4 element array"))?;

        let schedule_id = parts[0]
            .as_str()
            .ok_or_else(|| Error::invalid_message("schedule id is not a string"))?;
        let reporting_enabled = match parts[1].as_u64() {
            Some(0) => false,
            Some(1) => true,
            _ => return Err(Error::invalid_message("reporting flag is not 0 or 1")),
        };
        let campaigns = parse_embedded(&parts[2])?;
        let reporting_context = parse_embedded(&parts[3])?;

        Ok(Self::new(
            schedule_id,
            reporting_enabled,
            campaigns,
            reporting_context,
        ))
    }

    fn automation(&self) -> Option<std::sync::Arc<InAppAutomation>> {
        let automation = registry::shared();
        if automation.is_none() {
            error!(
                "In-app automation is not started, ignoring display handler call for {}",
                self.schedule_id
            );
        }
        automation
    }
}

fn parse_embedded(value: &Value) -> Result<Value> {
    let text = value
        .as_str()
        .ok_or_else(|| Error::invalid_message("embedded document is not a string"))?;
    Ok(serde_json::from_str(text)?)
}
