//! Display adapter contract
//!
//! An adapter is created per prepared schedule by the [`AdapterFactory`]
//! registered for the message's display type. Rendering lives behind this
//! trait; the orchestration core only sequences the calls.

use iam_core::prelude::*;
use iam_core::InAppMessage;

use crate::assets::Assets;
use crate::display_handler::DisplayHandler;

/// Outcome of preparing an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterPrepareResult {
    Ok,
    /// Not yet able to display, try again after a backoff
    Retry,
    /// Abandon this prepare cycle
    Cancel,
}

#[cfg_attr(test, mockall::automock)]
pub trait InAppMessageAdapter: Send {
    /// Load whatever the display needs. Called on the executor worker.
    fn on_prepare(&mut self, assets: Option<Assets>) -> Result<AdapterPrepareResult>;

    /// Whether the adapter can display right now
    fn is_ready(&self) -> Result<bool>;

    /// Show the message. The handler reports the outcome back.
    fn on_display(&mut self, handler: DisplayHandler) -> Result<()>;

    /// Release resources after display or a failed display
    fn on_finish(&mut self) -> Result<()>;
}

/// Creates adapters for one display type
pub trait AdapterFactory: Send + Sync {
    fn create_adapter(&self, message: &InAppMessage) -> Result<Box<dyn InAppMessageAdapter>>;
}

impl<F> AdapterFactory for F
where
    F: Fn(&InAppMessage) -> Result<Box<dyn InAppMessageAdapter>> + Send + Sync,
{
    fn create_adapter(&self, message: &InAppMessage) -> Result<Box<dyn InAppMessageAdapter>> {
        self(message)
    }
}
