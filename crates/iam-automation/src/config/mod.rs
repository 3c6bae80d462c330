//! Configuration for in-app automation
//!
//! - [`Settings`]: static tuning loaded from `<dir>/.iam/config.toml`
//! - [`PreferenceDataStore`]: runtime key/value state (pause, enable,
//!   display interval, remote-data bookkeeping)

pub mod preferences;
pub mod settings;

pub use preferences::{keys, PreferenceDataStore};
pub use settings::{
    load_settings, save_settings, AssetSettings, DisplaySettings, EngineSettings,
    ExecutorSettings, Settings,
};
