//! Application error types with rich context

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Error types organized by layer/domain
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    // ─────────────────────────────────────────────────────────────
    // Message Model Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Invalid in-app message: {message}")]
    InvalidMessage { message: String },

    #[error("No display adapter registered for message type: {display_type}")]
    NoAdapter { display_type: String },

    // ─────────────────────────────────────────────────────────────
    // Adapter/Display Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Display adapter error: {message}")]
    Adapter { message: String },

    #[error("Failed to display message for schedule {schedule_id}: {reason}")]
    Display { schedule_id: String, reason: String },

    // ─────────────────────────────────────────────────────────────
    // Asset Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Asset error: {message}")]
    Asset { message: String },

    #[error("Asset cache directory unavailable: {path}")]
    AssetCacheUnavailable { path: PathBuf },

    // ─────────────────────────────────────────────────────────────
    // Scheduling Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Schedule not found: {schedule_id}")]
    ScheduleNotFound { schedule_id: String },

    #[error("Invalid schedule: {message}")]
    InvalidSchedule { message: String },

    #[error("Schedule limit of {limit} reached")]
    ScheduleLimitReached { limit: usize },

    #[error("Automation engine is not running")]
    EngineStopped,

    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn invalid_message(message: impl Into<String>) -> Self {
        Self::InvalidMessage {
            message: message.into(),
        }
    }

    pub fn no_adapter(display_type: impl Into<String>) -> Self {
        Self::NoAdapter {
            display_type: display_type.into(),
        }
    }

    pub fn adapter(message: impl Into<String>) -> Self {
        Self::Adapter {
            message: message.into(),
        }
    }

    pub fn display(schedule_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Display {
            schedule_id: schedule_id.into(),
            reason: reason.into(),
        }
    }

    pub fn asset(message: impl Into<String>) -> Self {
        Self::Asset {
            message: message.into(),
        }
    }

    pub fn schedule_not_found(schedule_id: impl Into<String>) -> Self {
        Self::ScheduleNotFound {
            schedule_id: schedule_id.into(),
        }
    }

    pub fn invalid_schedule(message: impl Into<String>) -> Self {
        Self::InvalidSchedule {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Check if this is a recoverable error
    ///
    /// Recoverable errors map to a retry of the failing step rather than
    /// abandoning the schedule.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Adapter { .. } | Error::Asset { .. }
        )
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Context Extensions
// ─────────────────────────────────────────────────────────────────

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", context.into(), err);
            err
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", f(), err);
            err
        })
    }
}
