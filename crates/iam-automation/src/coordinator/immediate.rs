use iam_core::InAppMessage;

use super::{DisplayCoordinator, ReadyCallback};

/// Coordinator for messages that ignore display history: always ready.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateDisplayCoordinator;

impl ImmediateDisplayCoordinator {
    pub fn new() -> Self {
        Self
    }
}

impl DisplayCoordinator for ImmediateDisplayCoordinator {
    fn is_ready(&self) -> bool {
        true
    }

    fn on_display_started(&self, _message: &InAppMessage) {}

    fn on_display_finished(&self, _message: &InAppMessage) {}

    // Never transitions, so the callback would never fire.
    fn set_ready_callback(&self, _callback: Option<ReadyCallback>) {}
}
