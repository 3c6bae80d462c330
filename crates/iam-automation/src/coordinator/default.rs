//! Shared coordinator: one display at a time, then a cooldown
//!
//! After a display finishes the coordinator stays locked for the display
//! interval. Each finish bumps a generation counter so a cooldown timer from
//! an earlier finish cannot unlock a newer cooldown early.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use iam_core::prelude::*;
use iam_core::InAppMessage;

use super::{DisplayCoordinator, ReadyCallback};

struct CoordinatorState {
    interval: Duration,
    displaying: bool,
    locked: bool,
    generation: u64,
    callback: Option<ReadyCallback>,
}

impl CoordinatorState {
    fn is_ready(&self) -> bool {
        !self.displaying && !self.locked
    }
}

#[derive(Clone)]
pub struct DefaultDisplayCoordinator {
    state: Arc<Mutex<CoordinatorState>>,
}

impl fmt::Debug for DefaultDisplayCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("DefaultDisplayCoordinator")
            .field("interval", &state.interval)
            .field("displaying", &state.displaying)
            .field("locked", &state.locked)
            .field("generation", &state.generation)
            .finish()
    }
}

impl DefaultDisplayCoordinator {
    pub fn new(interval: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(CoordinatorState {
                interval,
                displaying: false,
                locked: false,
                generation: 0,
                callback: None,
            })),
        }
    }

    pub fn display_interval(&self) -> Duration {
        self.lock().interval
    }

    /// Change the cooldown. Applies to the next finished display.
    pub fn set_display_interval(&self, interval: Duration) {
        self.lock().interval = interval;
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Unlock if `generation` is still current; returns the callback to fire
    fn unlock(state: &Mutex<CoordinatorState>, generation: u64) -> Option<ReadyCallback> {
        let mut state = state.lock().unwrap_or_else(|p| p.into_inner());
        if state.generation != generation || !state.locked {
            return None;
        }
        state.locked = false;
        if state.is_ready() {
            state.callback.clone()
        } else {
            None
        }
    }
}

impl DisplayCoordinator for DefaultDisplayCoordinator {
    fn is_ready(&self) -> bool {
        self.lock().is_ready()
    }

    fn on_display_started(&self, _message: &InAppMessage) {
        self.lock().displaying = true;
    }

    fn on_display_finished(&self, _message: &InAppMessage) {
        let (generation, interval) = {
            let mut state = self.lock();
            state.displaying = false;
            state.locked = true;
            state.generation += 1;
            (state.generation, state.interval)
        };

        if interval.is_zero() {
            if let Some(callback) = Self::unlock(&self.state, generation) {
                callback();
            }
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let state = Arc::clone(&self.state);
                handle.spawn(async move {
                    tokio::time::sleep(interval).await;
                    if let Some(callback) = Self::unlock(&state, generation) {
                        trace!("Display interval elapsed");
                        callback();
                    }
                });
            }
            Err(_) => {
                warn!("No async runtime for display interval timer, unlocking immediately");
                if let Some(callback) = Self::unlock(&self.state, generation) {
                    callback();
                }
            }
        }
    }

    fn set_ready_callback(&self, callback: Option<ReadyCallback>) {
        self.lock().callback = callback;
    }
}
