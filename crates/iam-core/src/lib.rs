//! # iam-core - Core Domain Types
//!
//! Foundation crate for in-app automation. Provides the message and schedule
//! model, resolution outcomes, error handling, and logging setup.
//!
//! This crate has **zero internal dependencies** -- it only depends on external
//! crates (serde, chrono, thiserror, tracing).
//!
//! ## Public API
//!
//! ### Messages (`message`)
//! - [`InAppMessage`] - Immutable message value, built via [`InAppMessageBuilder`]
//! - [`DisplayType`], [`MessageSource`], [`DisplayBehavior`] - Message classification
//! - [`ButtonInfo`], [`ButtonBehavior`] - Buttons and what they do to the schedule
//!
//! ### Resolutions (`resolution`)
//! - [`ResolutionInfo`] - Why a display ended
//!
//! ### Schedules (`schedule`)
//! - [`Schedule`], [`ScheduleInfo`], [`ScheduleEdits`] - Engine-owned schedule data
//! - [`Trigger`], [`TriggerContext`] - What fired a schedule
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Error enum with `recoverable` classification
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//! - [`ResultExt`] - Extension trait for adding error context
//!
//! ## Prelude
//!
//! Import commonly used types with:
//! ```rust
//! use iam_core::prelude::*;
//! ```

pub mod error;
pub mod logging;
pub mod message;
pub mod resolution;
pub mod schedule;

/// Prelude for common imports used throughout all in-app automation crates
pub mod prelude {
    pub use super::error::{Error, Result, ResultExt};
    pub use tracing::{debug, error, info, instrument, trace, warn};
}

// Re-export commonly used types at crate root for convenience
pub use error::{Error, Result, ResultExt};
pub use message::{
    ButtonBehavior, ButtonInfo, DisplayBehavior, DisplayType, InAppMessage, InAppMessageBuilder,
    JsonMap, MessageSource, MAX_BUTTON_ID_LENGTH, MAX_NAME_LENGTH,
};
pub use resolution::ResolutionInfo;
pub use schedule::{
    Schedule, ScheduleEdits, ScheduleInfo, Trigger, TriggerContext, TriggerType, MAX_TRIGGERS,
};
