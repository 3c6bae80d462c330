//! Scenario files for `iamctl run`
//!
//! A scenario declares schedules and a list of steps that drive them:
//!
//! ```toml
//! display_interval_ms = 0
//!
//! [[schedules]]
//! name = "welcome"
//! message = { display_type = "banner", display = { body = { text = "Hi" } } }
//!
//! [[steps]]
//! action = "event"
//! trigger = "foreground"
//!
//! [[steps]]
//! action = "resolve"
//! schedule = "welcome"
//! resolution = { type = "message_click" }
//! display_ms = 1500
//! ```

use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use iam_core::prelude::*;
use iam_core::{InAppMessage, ResolutionInfo, ScheduleInfo, Trigger, TriggerType};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Scenario {
    /// Overrides the configured display interval
    #[serde(default)]
    pub display_interval_ms: Option<u64>,

    #[serde(default)]
    pub schedules: Vec<ScenarioSchedule>,

    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let scenario = Self::parse(&content)?;
        debug!(
            "Loaded scenario {} ({} schedules, {} steps)",
            path.display(),
            scenario.schedules.len(),
            scenario.steps.len()
        );
        Ok(scenario)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let scenario: Scenario = toml::from_str(content)?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Names must be unique and every step must name a declared schedule
    fn validate(&self) -> Result<()> {
        for (index, schedule) in self.schedules.iter().enumerate() {
            if self.schedules[..index]
                .iter()
                .any(|other| other.name == schedule.name)
            {
                return Err(Error::config(format!(
                    "duplicate schedule name '{}'",
                    schedule.name
                )));
            }
        }

        for step in &self.steps {
            if let Some(name) = step.schedule_name() {
                if self.schedule(name).is_none() {
                    return Err(Error::config(format!(
                        "step '{}' refers to unknown schedule '{}'",
                        step.action(),
                        name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn schedule(&self, name: &str) -> Option<&ScenarioSchedule> {
        self.schedules.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioSchedule {
    pub name: String,

    /// In-app message JSON document, written as a TOML table
    pub message: Value,

    #[serde(default = "default_triggers")]
    pub triggers: Vec<Trigger>,

    #[serde(default = "default_limit")]
    pub limit: u32,

    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub interval_ms: u64,

    #[serde(default)]
    pub group: Option<String>,

    #[serde(default)]
    pub campaigns: Option<Value>,

    #[serde(default)]
    pub reporting_context: Option<Value>,
}

fn default_triggers() -> Vec<Trigger> {
    vec![Trigger::new(TriggerType::Foreground, 1.0)]
}

fn default_limit() -> u32 {
    1
}

impl ScenarioSchedule {
    pub fn to_info(&self) -> Result<ScheduleInfo> {
        let message = InAppMessage::from_json(self.message.clone())?;

        let mut info = ScheduleInfo::new(message, self.triggers.clone())
            .with_limit(self.limit)
            .with_priority(self.priority);
        info.interval_ms = self.interval_ms;
        if let Some(group) = &self.group {
            info = info.with_group(group.clone());
        }
        if let Some(campaigns) = &self.campaigns {
            info = info.with_campaigns(campaigns.clone());
        }
        if let Some(reporting_context) = &self.reporting_context {
            info = info.with_reporting_context(reporting_context.clone());
        }

        info.validate()?;
        Ok(info)
    }
}

/// One scripted action
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    /// Count an event against every matching trigger
    Event {
        trigger: TriggerType,
        #[serde(default)]
        value: Option<f64>,
    },

    /// Fire a schedule directly
    Trigger { schedule: String },

    /// Simulate the user closing the displayed message
    Resolve {
        schedule: String,
        resolution: ResolutionInfo,
        #[serde(default)]
        display_ms: i64,
    },

    Wait { ms: u64 },

    Pause,

    Resume,

    Cancel { schedule: String },

    SetDisplayInterval { ms: u64 },
}

impl Step {
    pub fn action(&self) -> &'static str {
        match self {
            Self::Event { .. } => "event",
            Self::Trigger { .. } => "trigger",
            Self::Resolve { .. } => "resolve",
            Self::Wait { .. } => "wait",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel { .. } => "cancel",
            Self::SetDisplayInterval { .. } => "set_display_interval",
        }
    }

    fn schedule_name(&self) -> Option<&str> {
        match self {
            Self::Trigger { schedule }
            | Self::Resolve { schedule, .. }
            | Self::Cancel { schedule } => Some(schedule),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iam_core::{ButtonBehavior, DisplayType};

    const WELCOME: &str = r#"
        display_interval_ms = 0

        [[schedules]]
        name = "welcome"
        priority = 2
        message = { display_type = "banner", display = { body = { text = "Hi" } } }

        [[steps]]
        action = "event"
        trigger = "foreground"

        [[steps]]
        action = "resolve"
        schedule = "welcome"
        display_ms = 1500
        resolution = { type = "button_click", button_info = { id = "ok", label = "OK", behavior = "cancel" } }
    "#;

    #[test]
    fn test_parse_scenario() {
        let scenario = Scenario::parse(WELCOME).unwrap();

        assert_eq!(scenario.display_interval_ms, Some(0));
        assert_eq!(scenario.schedules.len(), 1);
        assert_eq!(
            scenario.steps[0],
            Step::Event {
                trigger: TriggerType::Foreground,
                value: None
            }
        );

        let Step::Resolve {
            resolution,
            display_ms,
            ..
        } = &scenario.steps[1]
        else {
            panic!("expected resolve step, got {:?}", scenario.steps[1]);
        };
        assert_eq!(*display_ms, 1500);
        assert_eq!(
            resolution.button_info().map(|b| b.behavior),
            Some(ButtonBehavior::Cancel)
        );
    }

    #[test]
    fn test_schedule_defaults() {
        let scenario = Scenario::parse(WELCOME).unwrap();
        let info = scenario.schedule("welcome").unwrap().to_info().unwrap();

        assert_eq!(info.message.message_type(), DisplayType::Banner);
        assert_eq!(info.limit, 1);
        assert_eq!(info.priority, 2);
        assert_eq!(info.triggers, default_triggers());
    }

    #[test]
    fn test_unknown_schedule_reference_rejected() {
        let content = r#"
            [[steps]]
            action = "trigger"
            schedule = "missing"
        "#;

        let err = Scenario::parse(content).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let content = r#"
            [[schedules]]
            name = "a"
            message = { display_type = "banner", display = {} }

            [[schedules]]
            name = "a"
            message = { display_type = "modal", display = {} }
        "#;

        assert!(Scenario::parse(content).is_err());
    }

    #[test]
    fn test_invalid_message_rejected_on_conversion() {
        let content = r#"
            [[schedules]]
            name = "broken"
            message = { display = {} }
        "#;

        let scenario = Scenario::parse(content).unwrap();
        assert!(scenario.schedules[0].to_info().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scenario.toml");
        std::fs::write(&path, WELCOME).unwrap();

        let scenario = Scenario::load(&path).unwrap();
        assert_eq!(scenario.steps.len(), 2);
    }
}
