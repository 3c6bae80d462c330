//! Schedule value types shared between the engine and the orchestration core
//!
//! Schedules are owned by the automation engine. The orchestration core only
//! reads them: the id, the message, and the campaign/reporting documents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::message::InAppMessage;

/// Maximum number of triggers a schedule may carry
pub const MAX_TRIGGERS: usize = 10;

/// Kind of event a trigger counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Foreground,
    Background,
    AppInit,
    ActiveSession,
    Screen,
    CustomEventCount,
    CustomEventValue,
    RegionEnter,
    RegionExit,
    Version,
}

/// A trigger: fire once `goal` matching events have been counted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,

    #[serde(default = "default_goal")]
    pub goal: f64,

    /// Optional predicate document evaluated by the engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<Value>,
}

fn default_goal() -> f64 {
    1.0
}

impl Trigger {
    pub fn new(trigger_type: TriggerType, goal: f64) -> Self {
        Self {
            trigger_type,
            goal,
            predicate: None,
        }
    }
}

/// The trigger that fired and the event that fired it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerContext {
    pub trigger: Trigger,
    #[serde(default)]
    pub event: Value,
}

impl TriggerContext {
    pub fn new(trigger: Trigger, event: Value) -> Self {
        Self { trigger, event }
    }
}

fn default_limit() -> u32 {
    1
}

/// Everything needed to create a schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleInfo {
    pub message: InAppMessage,

    pub triggers: Vec<Trigger>,

    /// Maximum number of executions. Zero means unlimited.
    #[serde(default = "default_limit")]
    pub limit: u32,

    /// Lower runs first when several schedules are ready together
    #[serde(default)]
    pub priority: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,

    /// Seconds after expiry or limit during which the schedule may still be edited
    #[serde(default)]
    pub edit_grace_period_secs: u64,

    /// Minimum time between executions, in milliseconds
    #[serde(default)]
    pub interval_ms: u64,

    /// Group id, usually the message id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaigns: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reporting_context: Option<Value>,
}

impl ScheduleInfo {
    pub fn new(message: InAppMessage, triggers: Vec<Trigger>) -> Self {
        Self {
            message,
            triggers,
            limit: default_limit(),
            priority: 0,
            start: None,
            end: None,
            edit_grace_period_secs: 0,
            interval_ms: 0,
            group: None,
            campaigns: None,
            reporting_context: None,
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_window(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_campaigns(mut self, campaigns: Value) -> Self {
        self.campaigns = Some(campaigns);
        self
    }

    pub fn with_reporting_context(mut self, reporting_context: Value) -> Self {
        self.reporting_context = Some(reporting_context);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.triggers.is_empty() {
            return Err(Error::invalid_schedule("at least one trigger is required"));
        }
        if self.triggers.len() > MAX_TRIGGERS {
            return Err(Error::invalid_schedule(format!(
                "no more than {} triggers are allowed",
                MAX_TRIGGERS
            )));
        }
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start > end {
                return Err(Error::invalid_schedule("start must not be after end"));
            }
        }
        Ok(())
    }
}

/// A stored schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,

    /// Opaque metadata, e.g. the remote-data payload metadata the schedule came from
    #[serde(default)]
    pub metadata: Value,

    #[serde(flatten)]
    pub info: ScheduleInfo,
}

impl Schedule {
    pub fn new(id: impl Into<String>, metadata: Value, info: ScheduleInfo) -> Self {
        Self {
            id: id.into(),
            metadata,
            info,
        }
    }

    pub fn message(&self) -> &InAppMessage {
        &self.info.message
    }

    /// Whether the validity window has closed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.info.end.is_some_and(|end| now > end)
    }

    /// Whether the validity window has opened
    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        self.info.start.map_or(true, |start| now >= start)
    }
}

/// Partial update of a schedule. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEdits {
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub edit_grace_period_secs: Option<u64>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub message: Option<InAppMessage>,
}

impl ScheduleEdits {
    pub fn apply(&self, schedule: &mut Schedule) -> Result<()> {
        let mut info = schedule.info.clone();

        if let Some(limit) = self.limit {
            info.limit = limit;
        }
        if let Some(priority) = self.priority {
            info.priority = priority;
        }
        if let Some(start) = self.start {
            info.start = Some(start);
        }
        if let Some(end) = self.end {
            info.end = Some(end);
        }
        if let Some(interval_ms) = self.interval_ms {
            info.interval_ms = interval_ms;
        }
        if let Some(grace) = self.edit_grace_period_secs {
            info.edit_grace_period_secs = grace;
        }
        if let Some(message) = &self.message {
            info.message = message.clone();
        }

        info.validate()?;
        schedule.info = info;

        if let Some(metadata) = &self.metadata {
            schedule.metadata = metadata.clone();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DisplayType;
    use chrono::Duration;
    use serde_json::json;

    fn info() -> ScheduleInfo {
        let message = InAppMessage::builder(DisplayType::Banner)
            .display_content(json!({}))
            .build()
            .unwrap();
        ScheduleInfo::new(message, vec![Trigger::new(TriggerType::Foreground, 1.0)])
    }

    #[test]
    fn test_validate_requires_trigger() {
        let mut info = info();
        assert!(info.validate().is_ok());

        info.triggers.clear();
        assert!(matches!(info.validate(), Err(Error::InvalidSchedule { .. })));
    }

    #[test]
    fn test_validate_window_order() {
        let now = Utc::now();
        let info = info().with_window(Some(now), Some(now - Duration::seconds(1)));
        assert!(info.validate().is_err());
    }

    #[test]
    fn test_expiry_and_start() {
        let now = Utc::now();
        let schedule = Schedule::new(
            "s1",
            Value::Null,
            info().with_window(Some(now + Duration::hours(1)), Some(now + Duration::hours(2))),
        );
        assert!(!schedule.has_started(now));
        assert!(!schedule.is_expired(now));
        assert!(schedule.is_expired(now + Duration::hours(3)));
    }

    #[test]
    fn test_edits_apply() {
        let mut schedule = Schedule::new("s1", Value::Null, info());
        let edits = ScheduleEdits {
            limit: Some(5),
            priority: Some(-1),
            metadata: Some(json!({"updated": true})),
            ..Default::default()
        };
        edits.apply(&mut schedule).unwrap();

        assert_eq!(schedule.info.limit, 5);
        assert_eq!(schedule.info.priority, -1);
        assert_eq!(schedule.metadata["updated"], true);
    }

    #[test]
    fn test_edits_rejected_leave_schedule_untouched() {
        let now = Utc::now();
        let mut schedule = Schedule::new("s1", Value::Null, info().with_window(Some(now), None));
        let edits = ScheduleEdits {
            limit: Some(9),
            end: Some(now - Duration::days(1)),
            ..Default::default()
        };

        assert!(edits.apply(&mut schedule).is_err());
        assert_eq!(schedule.info.limit, 1);
        assert!(schedule.info.end.is_none());
    }

    #[test]
    fn test_schedule_json_is_flat() {
        let schedule = Schedule::new("s1", json!({"k": 1}), info().with_limit(3));
        let value = serde_json::to_value(&schedule).unwrap();
        assert_eq!(value["id"], "s1");
        assert_eq!(value["limit"], 3);
        assert_eq!(value["triggers"][0]["type"], "foreground");
    }
}
