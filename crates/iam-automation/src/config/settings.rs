//! Settings parser for .iam/config.toml

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use iam_core::prelude::*;
use iam_executor::BackoffConfig;

const CONFIG_FILENAME: &str = "config.toml";
const IAM_DIR: &str = ".iam";

/// Default minimum time between two displays on the shared coordinator
pub const DEFAULT_DISPLAY_INTERVAL_MS: u64 = 30_000;

/// Default cap on active schedules held by the engine
pub const DEFAULT_SCHEDULE_LIMIT: usize = 1000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub executor: ExecutorSettings,
    pub display: DisplaySettings,
    pub engine: EngineSettings,
    pub assets: AssetSettings,
}

/// `[executor]` retry backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        let backoff = BackoffConfig::default();
        Self {
            initial_backoff_ms: backoff.initial.as_millis() as u64,
            max_backoff_ms: backoff.max.as_millis() as u64,
        }
    }
}

impl ExecutorSettings {
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig::new(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

/// `[display]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplaySettings {
    /// Used until a value is stored in the preference store
    pub interval_ms: u64,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_DISPLAY_INTERVAL_MS,
        }
    }
}

/// `[engine]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub schedule_limit: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            schedule_limit: DEFAULT_SCHEDULE_LIMIT,
        }
    }
}

/// `[assets]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

impl AssetSettings {
    /// Configured cache root, or `<cache dir>/inapp-automation/assets`
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("inapp-automation")
                .join("assets")
        })
    }
}

/// Load settings from `<dir>/.iam/config.toml`
///
/// A missing or unreadable file yields the defaults.
pub fn load_settings(dir: &Path) -> Settings {
    let config_path = dir.join(IAM_DIR).join(CONFIG_FILENAME);

    if !config_path.exists() {
        debug!("No config file at {:?}, using defaults", config_path);
        return Settings::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(settings) => {
                debug!("Loaded settings from {:?}", config_path);
                settings
            }
            Err(e) => {
                warn!("Failed to parse {:?}: {}", config_path, e);
                Settings::default()
            }
        },
        Err(e) => {
            warn!("Failed to read {:?}: {}", config_path, e);
            Settings::default()
        }
    }
}

/// Save settings to `<dir>/.iam/config.toml`
pub fn save_settings(dir: &Path, settings: &Settings) -> Result<()> {
    let iam_dir = dir.join(IAM_DIR);

    if !iam_dir.exists() {
        std::fs::create_dir_all(&iam_dir)
            .map_err(|e| Error::config(format!("Failed to create .iam dir: {}", e)))?;
    }

    let config_path = iam_dir.join(CONFIG_FILENAME);
    let temp_path = iam_dir.join(".config.toml.tmp");

    let content = toml::to_string_pretty(settings)
        .map_err(|e| Error::config(format!("Failed to serialize settings: {}", e)))?;
    let full_content = format!("# In-app automation configuration\n\n{}", content);

    // Atomic write: write to temp, then rename
    std::fs::write(&temp_path, &full_content)
        .map_err(|e| Error::config(format!("Failed to write temp file: {}", e)))?;

    std::fs::rename(&temp_path, &config_path)
        .map_err(|e| Error::config(format!("Failed to rename temp file: {}", e)))?;

    info!("Saved settings to {:?}", config_path);
    Ok(())
}
