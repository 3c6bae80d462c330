//! Why a displayed message went away

use serde::{Deserialize, Serialize};

use crate::message::{ButtonBehavior, ButtonInfo};

/// Outcome reported by the UI layer when a message display ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResolutionInfo {
    /// A button was tapped
    ButtonClick { button_info: ButtonInfo },
    /// The message body was tapped
    MessageClick,
    /// The user dismissed the message
    UserDismissed,
    /// The message timed out
    TimedOut,
}

impl ResolutionInfo {
    pub fn button_pressed(button_info: ButtonInfo) -> Self {
        Self::ButtonClick { button_info }
    }

    pub fn message_click() -> Self {
        Self::MessageClick
    }

    pub fn dismissed() -> Self {
        Self::UserDismissed
    }

    pub fn timed_out() -> Self {
        Self::TimedOut
    }

    /// Wire name of the resolution type
    pub fn resolution_type(&self) -> &'static str {
        match self {
            Self::ButtonClick { .. } => "button_click",
            Self::MessageClick => "message_click",
            Self::UserDismissed => "user_dismissed",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn button_info(&self) -> Option<&ButtonInfo> {
        match self {
            Self::ButtonClick { button_info } => Some(button_info),
            _ => None,
        }
    }

    /// True when a button with cancel behavior ended the display
    pub fn cancels_schedule(&self) -> bool {
        self.button_info()
            .is_some_and(|b| b.behavior == ButtonBehavior::Cancel)
    }
}
