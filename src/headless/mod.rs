//! Headless mode - NDJSON event output for scenario runs
//!
//! `iamctl run` drives the orchestration stack from a scenario file and
//! reports what happened as structured JSON events on stdout, so scripts can
//! assert on a run without scraping log output.
//!
//! # Event Format
//!
//! Events are output as NDJSON (newline-delimited JSON), one event per line.
//! Each event has an "event" field indicating its type, along with event-specific data.
//!
//! # Example Output
//!
//! ```json
//! {"event":"schedule_created","schedule_id":"6f1c...","name":"welcome","timestamp":1704700001000}
//! {"event":"prepared","schedule_id":"6f1c...","timestamp":1704700001010}
//! {"event":"displayed","schedule_id":"6f1c...","timestamp":1704700001011}
//! {"event":"event_recorded","event_type":"in_app_display","data":{...},"timestamp":1704700001011}
//! ```

pub mod runner;

use chrono::Utc;
use serde::Serialize;
use std::io::{self, Write};
use tracing::error;

use iam_automation::AnalyticsEvent;
use iam_core::{JsonMap, ResolutionInfo};

/// Events emitted in headless mode
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HeadlessEvent {
    /// A scenario schedule was handed to the engine
    ScheduleCreated {
        schedule_id: String,
        name: String,
        timestamp: i64,
    },

    /// A schedule finished preparing and is waiting for its display slot
    Prepared { schedule_id: String, timestamp: i64 },

    /// An adapter put a message on screen
    Displayed { schedule_id: String, timestamp: i64 },

    /// A displayed message went away
    Finished {
        schedule_id: String,
        resolution: ResolutionInfo,
        timestamp: i64,
    },

    /// Analytics event produced by the orchestration core
    EventRecorded {
        event_type: String,
        data: JsonMap,
        timestamp: i64,
    },

    /// Error occurred
    Error {
        message: String,
        fatal: bool,
        timestamp: i64,
    },
}

impl HeadlessEvent {
    /// Emit this event to stdout as JSON
    pub fn emit(&self) {
        let json = match serde_json::to_string(self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize headless event: {}", e);
                return;
            }
        };

        let mut stdout = io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{}", json) {
            error!("Failed to write headless event to stdout: {}", e);
            return;
        }

        if let Err(e) = stdout.flush() {
            error!("Failed to flush headless stdout: {}", e);
        }
    }

    /// Value of the `event` field
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ScheduleCreated { .. } => "schedule_created",
            Self::Prepared { .. } => "prepared",
            Self::Displayed { .. } => "displayed",
            Self::Finished { .. } => "finished",
            Self::EventRecorded { .. } => "event_recorded",
            Self::Error { .. } => "error",
        }
    }

    /// Schedule the event is about, if any
    pub fn schedule_id(&self) -> Option<&str> {
        match self {
            Self::ScheduleCreated { schedule_id, .. }
            | Self::Prepared { schedule_id, .. }
            | Self::Displayed { schedule_id, .. }
            | Self::Finished { schedule_id, .. } => Some(schedule_id.as_str()),
            Self::EventRecorded { data, .. } => match data.get("id")? {
                serde_json::Value::String(id) => Some(id.as_str()),
                id => id.get("message_id").and_then(|id| id.as_str()),
            },
            Self::Error { .. } => None,
        }
    }

    /// Get current timestamp in milliseconds
    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    // ─────────────────────────────────────────────────────────
    // Convenience constructors
    // ─────────────────────────────────────────────────────────

    pub fn schedule_created(schedule_id: &str, name: &str) -> Self {
        Self::ScheduleCreated {
            schedule_id: schedule_id.to_string(),
            name: name.to_string(),
            timestamp: Self::now(),
        }
    }

    pub fn prepared(schedule_id: &str) -> Self {
        Self::Prepared {
            schedule_id: schedule_id.to_string(),
            timestamp: Self::now(),
        }
    }

    pub fn displayed(schedule_id: &str) -> Self {
        Self::Displayed {
            schedule_id: schedule_id.to_string(),
            timestamp: Self::now(),
        }
    }

    pub fn finished(schedule_id: &str, resolution: ResolutionInfo) -> Self {
        Self::Finished {
            schedule_id: schedule_id.to_string(),
            resolution,
            timestamp: Self::now(),
        }
    }

    pub fn event_recorded(event: &AnalyticsEvent) -> Self {
        Self::EventRecorded {
            event_type: event.event_type.clone(),
            data: event.data.clone(),
            timestamp: event.timestamp.timestamp_millis(),
        }
    }

    pub fn error(message: String, fatal: bool) -> Self {
        Self::Error {
            message,
            fatal,
            timestamp: Self::now(),
        }
    }
}
