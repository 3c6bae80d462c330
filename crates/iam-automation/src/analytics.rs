//! Reporting events for in-app messages
//!
//! [`InAppReportingEvent`] captures what happened to a schedule's message
//! (displayed, resolved, interrupted, button tapped). Recording it against an
//! [`Analytics`] sink turns it into a flat [`AnalyticsEvent`] with the shared
//! fields (id, source, conversion data, context, locale) filled in.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use iam_core::{InAppMessage, JsonMap, MessageSource, ResolutionInfo};

pub const TYPE_DISPLAY: &str = "in_app_display";
pub const TYPE_RESOLUTION: &str = "in_app_resolution";
pub const TYPE_BUTTON_TAP: &str = "in_app_button_tap";

/// Button labels longer than this are truncated in resolution events
pub const MAX_BUTTON_DESCRIPTION_LENGTH: usize = 30;

const SOURCE_APP_DEFINED: &str = "app-defined";
const SOURCE_REMOTE: &str = "remote";

/// Destination for reporting events
pub trait Analytics: Send + Sync {
    fn add_event(&self, event: AnalyticsEvent);

    /// Send id of the push that opened the app, if any
    fn conversion_send_id(&self) -> Option<String> {
        None
    }

    fn conversion_metadata(&self) -> Option<String> {
        None
    }
}

/// A recorded event, ready for upload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: JsonMap,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InAppReportingEvent {
    event_type: &'static str,
    schedule_id: String,
    source: MessageSource,
    rendered_locale: Option<JsonMap>,
    campaigns: Option<Value>,
    reporting_context: Option<Value>,
    overrides: JsonMap,
}

impl InAppReportingEvent {
    fn new(event_type: &'static str, schedule_id: &str, source: MessageSource) -> Self {
        Self {
            event_type,
            schedule_id: schedule_id.to_string(),
            source,
            rendered_locale: None,
            campaigns: None,
            reporting_context: None,
            overrides: JsonMap::new(),
        }
    }

    fn for_message(event_type: &'static str, schedule_id: &str, message: &InAppMessage) -> Self {
        let mut event = Self::new(event_type, schedule_id, message.source());
        event.rendered_locale = message.rendered_locale().cloned();
        event
    }

    pub fn display(schedule_id: &str, message: &InAppMessage) -> Self {
        Self::for_message(TYPE_DISPLAY, schedule_id, message)
    }

    pub fn resolution(
        schedule_id: &str,
        message: &InAppMessage,
        display_millis: i64,
        resolution: &ResolutionInfo,
    ) -> Self {
        let mut event = Self::for_message(TYPE_RESOLUTION, schedule_id, message);
        event.overrides.insert(
            "resolution".into(),
            resolution_data(resolution, display_millis),
        );
        event
    }

    /// The schedule was interrupted before it finished (e.g. the process died
    /// mid-display)
    pub fn interrupted(schedule_id: &str, source: MessageSource) -> Self {
        let mut event = Self::new(TYPE_RESOLUTION, schedule_id, source);
        event.overrides.insert(
            "resolution".into(),
            resolution_data(&ResolutionInfo::dismissed(), 0),
        );
        event
    }

    pub fn button_tap(schedule_id: &str, message: &InAppMessage, button_id: &str) -> Self {
        let mut event = Self::for_message(TYPE_BUTTON_TAP, schedule_id, message);
        event
            .overrides
            .insert("button_identifier".into(), Value::String(button_id.into()));
        event
    }

    pub fn with_campaigns(mut self, campaigns: Option<Value>) -> Self {
        self.campaigns = campaigns;
        self
    }

    pub fn with_reporting_context(mut self, reporting_context: Option<Value>) -> Self {
        self.reporting_context = reporting_context;
        self
    }

    pub fn event_type(&self) -> &'static str {
        self.event_type
    }

    pub fn schedule_id(&self) -> &str {
        &self.schedule_id
    }

    /// Build the flat event, pulling conversion data from the sink
    pub fn to_event(&self, analytics: &dyn Analytics) -> AnalyticsEvent {
        let mut data = JsonMap::new();
        data.insert("id".into(), self.event_id());

        let source = match self.source {
            MessageSource::AppDefined => SOURCE_APP_DEFINED,
            _ => SOURCE_REMOTE,
        };
        data.insert("source".into(), Value::String(source.into()));

        if let Some(send_id) = analytics.conversion_send_id() {
            data.insert("conversion_send_id".into(), Value::String(send_id));
        }
        if let Some(metadata) = analytics.conversion_metadata() {
            data.insert("conversion_metadata".into(), Value::String(metadata));
        }
        if let Some(reporting_context) = self.reporting_context.as_ref().filter(|v| !v.is_null()) {
            data.insert(
                "context".into(),
                json!({ "reporting_context": reporting_context }),
            );
        }
        if let Some(locale) = &self.rendered_locale {
            data.insert("locale".into(), Value::Object(locale.clone()));
        }

        for (key, value) in &self.overrides {
            data.insert(key.clone(), value.clone());
        }

        AnalyticsEvent {
            event_type: self.event_type.to_string(),
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn record(&self, analytics: &dyn Analytics) {
        analytics.add_event(self.to_event(analytics));
    }

    fn event_id(&self) -> Value {
        match self.source {
            MessageSource::LegacyPush => Value::String(self.schedule_id.clone()),
            MessageSource::RemoteData => json!({
                "message_id": self.schedule_id,
                "campaigns": self.campaigns.clone().unwrap_or(Value::Null),
            }),
            MessageSource::AppDefined => json!({ "message_id": self.schedule_id }),
        }
    }
}

fn resolution_data(resolution: &ResolutionInfo, display_millis: i64) -> Value {
    let mut data = JsonMap::new();
    data.insert(
        "type".into(),
        Value::String(resolution.resolution_type().into()),
    );
    data.insert(
        "display_time".into(),
        Value::String(millis_to_seconds_string(display_millis.max(0))),
    );

    if let Some(button) = resolution.button_info() {
        data.insert("button_id".into(), Value::String(button.id.clone()));
        data.insert(
            "button_description".into(),
            Value::String(
                button
                    .label
                    .chars()
                    .take(MAX_BUTTON_DESCRIPTION_LENGTH)
                    .collect(),
            ),
        );
    }

    Value::Object(data)
}

fn millis_to_seconds_string(millis: i64) -> String {
    format!("{:.3}", millis as f64 / 1000.0)
}
