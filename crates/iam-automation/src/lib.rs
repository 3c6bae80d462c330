//! # iam-automation - In-App Message Orchestration
//!
//! Decides, for every due in-app message schedule, whether to prepare, retry,
//! invalidate or display it, one display at a time.
//!
//! Depends on `iam-core` for the domain model and `iam-executor` for the
//! serial retrying worker.
//!
//! ## Public API
//!
//! ### Orchestration
//! - [`InAppAutomation`] - Façade: engine driver, pause/enable, remote-data gating
//! - [`InAppMessageManager`] - Prepare / readiness / display / finish pipeline
//! - [`AdapterWrapper`] - Panic-safe holder for one prepared adapter
//! - [`DisplayHandler`] - Encodable handle adapters use to report back
//!
//! ### Contracts
//! - [`InAppMessageAdapter`], [`AdapterFactory`] - Rendering boundary
//! - [`AssetManager`] - Asset prefetch; [`AssetCache`] is the file-backed default
//! - [`DisplayCoordinator`] - Display gating; [`DefaultDisplayCoordinator`],
//!   [`ImmediateDisplayCoordinator`]
//! - [`AutomationEngine`], [`AutomationDriver`] - Scheduling engine boundary;
//!   [`InMemoryEngine`] is a non-persistent engine
//! - [`Analytics`], [`ActionRunner`], [`InAppMessageListener`], [`RemoteData`]
//!
//! ### Configuration
//! - [`Settings`] - `.iam/config.toml`
//! - [`PreferenceDataStore`] - Runtime flags and bookkeeping

pub mod actions;
pub mod adapter;
pub mod adapter_wrapper;
pub mod analytics;
pub mod assets;
pub mod automation;
pub mod config;
pub mod coordinator;
pub mod display_handler;
pub mod engine;
pub mod listener;
pub mod manager;
pub mod registry;
pub mod remote_data;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;

pub use actions::{ActionRunner, LoggingActionRunner};
pub use adapter::{AdapterFactory, AdapterPrepareResult, InAppMessageAdapter};
pub use adapter_wrapper::AdapterWrapper;
pub use analytics::{Analytics, AnalyticsEvent, InAppReportingEvent};
pub use assets::{AssetCache, AssetManager, AssetPrepareResult, Assets};
pub use automation::InAppAutomation;
pub use config::{PreferenceDataStore, Settings};
pub use coordinator::{DefaultDisplayCoordinator, DisplayCoordinator, ImmediateDisplayCoordinator};
pub use display_handler::DisplayHandler;
pub use engine::{
    AutomationDriver, AutomationEngine, ExecutionCallback, InMemoryEngine, PrepareCallback,
    PrepareResult, ReadyResult, ScheduleListener,
};
pub use listener::InAppMessageListener;
pub use manager::{CoordinatorRequest, DisplayDelegate, InAppMessageManager, MessageExtender};
pub use remote_data::{NoRemoteData, RemoteData, RemoteDataObserver};
