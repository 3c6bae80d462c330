//! Remote-data freshness for schedules that came from a remote payload
//!
//! A remote schedule carries the metadata of the payload that produced it
//! under [`REMOTE_DATA_INFO_KEY`]. Before such a schedule is prepared, the
//! observer checks it against the remote data source. An outdated schedule
//! waits for [`RemoteDataObserver::notify_schedules_updated`] while the local
//! copy of remote data is itself stale.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use iam_core::prelude::*;
use iam_core::{MessageSource, Schedule};

use crate::config::{keys, PreferenceDataStore};

/// Schedule metadata key holding the producing payload's metadata
pub const REMOTE_DATA_INFO_KEY: &str = "remote_data_info";

/// Source of remote data
pub trait RemoteData: Send + Sync {
    /// Whether payload metadata still describes the current remote data
    fn is_metadata_current(&self, metadata: &Value) -> bool;

    /// Ask for a refresh. Completion is reported through
    /// [`RemoteDataObserver::notify_schedules_updated`].
    fn request_refresh(&self) {}
}

/// For hosts without remote data: everything is always current
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRemoteData;

impl RemoteData for NoRemoteData {
    fn is_metadata_current(&self, _metadata: &Value) -> bool {
        true
    }
}

type PendingRefresh = Box<dyn FnOnce() + Send>;

struct ObserverInner {
    remote_data: Arc<dyn RemoteData>,
    preferences: Arc<PreferenceDataStore>,
    pending: Mutex<Vec<PendingRefresh>>,
}

#[derive(Clone)]
pub struct RemoteDataObserver {
    inner: Arc<ObserverInner>,
}

impl fmt::Debug for RemoteDataObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteDataObserver")
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl RemoteDataObserver {
    pub fn new(remote_data: Arc<dyn RemoteData>, preferences: Arc<PreferenceDataStore>) -> Self {
        Self {
            inner: Arc::new(ObserverInner {
                remote_data,
                preferences,
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_remote_schedule(&self, schedule: &Schedule) -> bool {
        schedule.message().source() == MessageSource::RemoteData
    }

    /// Non-remote schedules are always valid. Remote ones need current
    /// payload metadata.
    pub fn is_schedule_valid(&self, schedule: &Schedule) -> bool {
        if !self.is_remote_schedule(schedule) {
            return true;
        }
        match schedule.metadata.get(REMOTE_DATA_INFO_KEY) {
            Some(info) => self.inner.remote_data.is_metadata_current(info),
            None => false,
        }
    }

    pub fn last_payload_metadata(&self) -> Option<Value> {
        self.inner
            .preferences
            .get_json(keys::REMOTE_DATA_LAST_METADATA)
    }

    /// Whether the last processed payload is still current. With no payload
    /// processed yet the source decides from `null` metadata.
    pub fn is_up_to_date(&self) -> bool {
        let metadata = self.last_payload_metadata().unwrap_or(Value::Null);
        self.inner.remote_data.is_metadata_current(&metadata)
    }

    /// Run `on_current` now if `schedule` is valid or the local remote data is
    /// current. Otherwise request a refresh and run it after the next update.
    pub fn attempt_refresh(&self, schedule: &Schedule, on_current: impl FnOnce() + Send + 'static) {
        if self.is_schedule_valid(schedule) || self.is_up_to_date() {
            on_current();
            return;
        }

        debug!("Remote data is stale for {}, waiting for refresh", schedule.id);
        self.lock_pending().push(Box::new(on_current));
        self.inner.remote_data.request_refresh();
    }

    /// A remote payload was processed into schedules
    pub fn notify_schedules_updated(&self, metadata: &Value) -> Result<()> {
        self.inner
            .preferences
            .put_json(keys::REMOTE_DATA_LAST_METADATA, metadata)?;

        let pending: Vec<PendingRefresh> = self.lock_pending().drain(..).collect();
        if !pending.is_empty() {
            debug!("Remote data updated, resuming {} prepares", pending.len());
        }
        for on_current in pending {
            on_current();
        }
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Vec<PendingRefresh>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }
}
