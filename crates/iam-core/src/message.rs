//! In-app message value types
//!
//! An [`InAppMessage`] is immutable once built. The display payload is kept as
//! an opaque JSON document keyed by [`DisplayType`]; rendering modules interpret
//! it, orchestration never does.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Maximum length of a message name
pub const MAX_NAME_LENGTH: usize = 1024;

/// Maximum length of a button identifier
pub const MAX_BUTTON_ID_LENGTH: usize = 100;

/// JSON object used for extras, actions and other opaque documents
pub type JsonMap = Map<String, Value>;

// ─────────────────────────────────────────────────────────────────────────────
// Enums
// ─────────────────────────────────────────────────────────────────────────────

/// How a message is rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayType {
    Banner,
    Custom,
    Fullscreen,
    Modal,
    Html,
    Layout,
}

impl DisplayType {
    pub const ALL: [DisplayType; 6] = [
        DisplayType::Banner,
        DisplayType::Custom,
        DisplayType::Fullscreen,
        DisplayType::Modal,
        DisplayType::Html,
        DisplayType::Layout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayType::Banner => "banner",
            DisplayType::Custom => "custom",
            DisplayType::Fullscreen => "fullscreen",
            DisplayType::Modal => "modal",
            DisplayType::Html => "html",
            DisplayType::Layout => "layout",
        }
    }
}

impl fmt::Display for DisplayType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DisplayType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        DisplayType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::invalid_message(format!("unknown display type '{}'", s)))
    }
}

/// Where a message came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageSource {
    LegacyPush,
    RemoteData,
    #[default]
    AppDefined,
}

/// Whether a message waits for the shared display interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayBehavior {
    #[default]
    Default,
    Immediate,
}

/// What tapping a button does to the schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ButtonBehavior {
    #[default]
    Dismiss,
    /// Dismiss and cancel all future displays of the schedule
    Cancel,
}

// ─────────────────────────────────────────────────────────────────────────────
// ButtonInfo
// ─────────────────────────────────────────────────────────────────────────────

/// A button shown in a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ButtonInfo {
    pub id: String,

    /// Button label text
    pub label: String,

    #[serde(default)]
    pub behavior: ButtonBehavior,

    #[serde(default)]
    pub actions: JsonMap,
}

impl ButtonInfo {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            behavior: ButtonBehavior::Dismiss,
            actions: JsonMap::new(),
        }
    }

    pub fn with_behavior(mut self, behavior: ButtonBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_actions(mut self, actions: JsonMap) -> Self {
        self.actions = actions;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::invalid_message("button id must not be empty"));
        }
        if self.id.chars().count() > MAX_BUTTON_ID_LENGTH {
            return Err(Error::invalid_message(format!(
                "button id exceeds {} characters",
                MAX_BUTTON_ID_LENGTH
            )));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// InAppMessage
// ─────────────────────────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

/// An in-app message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InAppMessage {
    #[serde(rename = "display_type")]
    message_type: DisplayType,

    #[serde(rename = "display")]
    display_content: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,

    #[serde(default)]
    extras: JsonMap,

    #[serde(default)]
    actions: JsonMap,

    #[serde(default)]
    source: MessageSource,

    #[serde(default)]
    display_behavior: DisplayBehavior,

    #[serde(default = "default_true")]
    reporting_enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    rendered_locale: Option<JsonMap>,
}

impl InAppMessage {
    /// Start building a message of the given type
    pub fn builder(message_type: DisplayType) -> InAppMessageBuilder {
        InAppMessageBuilder::new(message_type)
    }

    /// Parse and validate a message from its JSON document
    pub fn from_json(value: Value) -> Result<Self> {
        let message: InAppMessage = serde_json::from_value(value)?;
        message.validate()?;
        Ok(message)
    }

    pub fn to_json(&self) -> Value {
        // Serialization of this type cannot fail: every field is plain JSON.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Copy this message into a builder so an extender can derive a new one
    pub fn to_builder(&self) -> InAppMessageBuilder {
        InAppMessageBuilder {
            message: self.clone(),
        }
    }

    pub fn message_type(&self) -> DisplayType {
        self.message_type
    }

    pub fn display_content(&self) -> &Value {
        &self.display_content
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn extras(&self) -> &JsonMap {
        &self.extras
    }

    pub fn actions(&self) -> &JsonMap {
        &self.actions
    }

    pub fn source(&self) -> MessageSource {
        self.source
    }

    pub fn display_behavior(&self) -> DisplayBehavior {
        self.display_behavior
    }

    pub fn is_reporting_enabled(&self) -> bool {
        self.reporting_enabled
    }

    pub fn rendered_locale(&self) -> Option<&JsonMap> {
        self.rendered_locale.as_ref()
    }

    fn validate(&self) -> Result<()> {
        if !self.display_content.is_object() {
            return Err(Error::invalid_message(format!(
                "{} message requires an object display payload",
                self.message_type
            )));
        }

        if let Some(name) = &self.name {
            if name.chars().count() > MAX_NAME_LENGTH {
                return Err(Error::invalid_message(format!(
                    "name exceeds {} characters",
                    MAX_NAME_LENGTH
                )));
            }
        }

        Ok(())
    }
}

/// Builder for [`InAppMessage`]
#[derive(Debug, Clone)]
pub struct InAppMessageBuilder {
    message: InAppMessage,
}

impl InAppMessageBuilder {
    fn new(message_type: DisplayType) -> Self {
        Self {
            message: InAppMessage {
                message_type,
                display_content: Value::Null,
                name: None,
                extras: JsonMap::new(),
                actions: JsonMap::new(),
                source: MessageSource::default(),
                display_behavior: DisplayBehavior::default(),
                reporting_enabled: true,
                rendered_locale: None,
            },
        }
    }

    /// Set the display payload. Changing the type keeps the payload.
    pub fn display_content(mut self, content: Value) -> Self {
        self.message.display_content = content;
        self
    }

    pub fn message_type(mut self, message_type: DisplayType) -> Self {
        self.message.message_type = message_type;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.message.name = Some(name.into());
        self
    }

    pub fn extras(mut self, extras: JsonMap) -> Self {
        self.message.extras = extras;
        self
    }

    pub fn actions(mut self, actions: JsonMap) -> Self {
        self.message.actions = actions;
        self
    }

    pub fn source(mut self, source: MessageSource) -> Self {
        self.message.source = source;
        self
    }

    pub fn display_behavior(mut self, behavior: DisplayBehavior) -> Self {
        self.message.display_behavior = behavior;
        self
    }

    pub fn reporting_enabled(mut self, enabled: bool) -> Self {
        self.message.reporting_enabled = enabled;
        self
    }

    pub fn rendered_locale(mut self, locale: Option<JsonMap>) -> Self {
        self.message.rendered_locale = locale;
        self
    }

    pub fn build(self) -> Result<InAppMessage> {
        self.message.validate()?;
        Ok(self.message)
    }
}
