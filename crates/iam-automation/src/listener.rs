use iam_core::{InAppMessage, ResolutionInfo};

/// Observer of message displays. Both callbacks default to no-ops.
pub trait InAppMessageListener: Send + Sync {
    fn on_message_displayed(&self, _schedule_id: &str, _message: &InAppMessage) {}

    fn on_message_finished(
        &self,
        _schedule_id: &str,
        _message: &InAppMessage,
        _resolution: &ResolutionInfo,
    ) {
    }
}
