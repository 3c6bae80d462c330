//! Asset preparation
//!
//! The orchestration core talks to an [`AssetManager`]; [`AssetCache`] is the
//! stock file-backed implementation, extended through a
//! [`PrepareAssetsDelegate`] (what to fetch) and a [`CachePolicy`] (when to
//! fetch early and whether to keep files after display).

mod cache;
mod delegate;

use iam_core::InAppMessage;

pub use cache::{AssetCache, Assets, METADATA_FILE};
pub use delegate::{
    CachePolicy, DefaultCachePolicy, LocalMediaDelegate, PrepareAssetsDelegate,
};

/// Outcome of preparing assets for a schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetPrepareResult {
    Ok,
    /// Transient failure, try again after a backoff
    Retry,
    /// Give up on this prepare cycle
    Cancel,
}

/// Prepares and caches binary assets per schedule id
#[cfg_attr(test, mockall::automock)]
pub trait AssetManager: Send + Sync {
    /// A schedule was created. May pre-cache.
    fn on_schedule(&self, schedule_id: &str, message: &InAppMessage);

    /// Prepare assets before the adapter prepares
    fn on_prepare(&self, schedule_id: &str, message: &InAppMessage) -> AssetPrepareResult;

    /// The message finished displaying, or its prepared state was invalidated
    fn on_display_finished(&self, schedule_id: &str, message: &InAppMessage);

    /// The schedule is gone for good
    fn on_finish(&self, schedule_id: &str);

    /// Assets prepared for a schedule, if any
    fn assets(&self, schedule_id: &str) -> Option<Assets>;
}
