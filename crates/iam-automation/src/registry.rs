//! Process-wide automation slot
//!
//! Display handlers outlive the call that created them and may be rebuilt
//! from their encoded form, so they find the automation instance here.

use std::sync::{Arc, RwLock};

use crate::automation::InAppAutomation;

static SHARED: RwLock<Option<Arc<InAppAutomation>>> = RwLock::new(None);

/// Make `automation` the process-wide instance, replacing any previous one
pub fn install(automation: Arc<InAppAutomation>) {
    *SHARED.write().unwrap_or_else(|p| p.into_inner()) = Some(automation);
}

/// The process-wide instance, once it has finished starting
pub fn shared() -> Option<Arc<InAppAutomation>> {
    SHARED
        .read()
        .unwrap_or_else(|p| p.into_inner())
        .as_ref()
        .filter(|automation| automation.is_started())
        .cloned()
}

/// Remove `automation` if it is the installed instance
pub fn uninstall(automation: &InAppAutomation) {
    let mut slot = SHARED.write().unwrap_or_else(|p| p.into_inner());
    if slot
        .as_ref()
        .is_some_and(|installed| std::ptr::eq(Arc::as_ptr(installed), automation))
    {
        *slot = None;
    }
}

pub fn clear() {
    *SHARED.write().unwrap_or_else(|p| p.into_inner()) = None;
}
