//! Display coordinators gate how messages are shown against each other.
//!
//! A coordinator answers one question, "may a message be shown right now?",
//! and is told when a display starts and finishes. When it flips from not
//! ready to ready on its own (a cooldown expiring), it invokes its ready
//! callback exactly once so pending schedules get re-checked.

mod default;
mod immediate;

use std::fmt;
use std::sync::Arc;

use iam_core::InAppMessage;

pub use default::DefaultDisplayCoordinator;
pub use immediate::ImmediateDisplayCoordinator;

/// Invoked when a coordinator becomes ready again
pub type ReadyCallback = Arc<dyn Fn() + Send + Sync>;

pub trait DisplayCoordinator: Send + Sync + fmt::Debug {
    /// Whether a message may be displayed now
    fn is_ready(&self) -> bool;

    /// A message started displaying. Safe to call without a prior ready check.
    fn on_display_started(&self, message: &InAppMessage);

    /// A message finished displaying
    fn on_display_finished(&self, message: &InAppMessage);

    /// Replace the became-ready callback
    fn set_ready_callback(&self, callback: Option<ReadyCallback>);
}
