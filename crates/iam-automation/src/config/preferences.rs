//! Key/value preference store
//!
//! Values live in memory and, when a path is given, are mirrored to a TOML
//! file after every write. File writes take an exclusive lock so two
//! processes sharing a store never interleave.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs2::FileExt;
use serde_json::Value;

use iam_core::prelude::*;

/// Keys used by in-app automation
pub mod keys {
    /// Display interval override in milliseconds
    pub const DISPLAY_INTERVAL: &str = "iam.display_interval";
    pub const PAUSED: &str = "iam.paused";
    pub const ENABLED: &str = "iam.enabled";
    /// JSON metadata of the last remote-data payload that produced schedules
    pub const REMOTE_DATA_LAST_METADATA: &str = "iam.remote_data.last_metadata";
}

#[derive(Debug)]
pub struct PreferenceDataStore {
    path: Option<PathBuf>,
    values: Mutex<toml::Table>,
}

impl Default for PreferenceDataStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl PreferenceDataStore {
    /// A store that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            values: Mutex::new(toml::Table::new()),
        }
    }

    /// Open a file-backed store, loading existing values if the file exists
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read preferences {:?}", path))?;
            toml::from_str::<toml::Table>(&content)?
        } else {
            toml::Table::new()
        };

        debug!("Opened preference store {:?} ({} keys)", path, values.len());
        Ok(Self {
            path: Some(path),
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.lock()
            .get(key)
            .and_then(toml::Value::as_bool)
            .unwrap_or(default)
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.lock()
            .get(key)
            .and_then(toml::Value::as_integer)
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(default)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.lock()
            .get(key)
            .and_then(toml::Value::as_str)
            .map(str::to_string)
    }

    /// JSON documents are stored as strings since TOML has no null
    pub fn get_json(&self, key: &str) -> Option<Value> {
        let raw = self.get_string(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring malformed JSON preference {}: {}", key, e);
                None
            }
        }
    }

    pub fn put_bool(&self, key: &str, value: bool) -> Result<()> {
        self.put(key, toml::Value::Boolean(value))
    }

    pub fn put_u64(&self, key: &str, value: u64) -> Result<()> {
        let value = i64::try_from(value)
            .map_err(|_| Error::config(format!("{} is out of range for {}", value, key)))?;
        self.put(key, toml::Value::Integer(value))
    }

    pub fn put_string(&self, key: &str, value: impl Into<String>) -> Result<()> {
        self.put(key, toml::Value::String(value.into()))
    }

    pub fn put_json(&self, key: &str, value: &Value) -> Result<()> {
        self.put_string(key, serde_json::to_string(value)?)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let snapshot = {
            let mut values = self.lock();
            if values.remove(key).is_none() {
                return Ok(());
            }
            values.clone()
        };
        self.persist(&snapshot)
    }

    fn put(&self, key: &str, value: toml::Value) -> Result<()> {
        let snapshot = {
            let mut values = self.lock();
            values.insert(key.to_string(), value);
            values.clone()
        };
        self.persist(&snapshot)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, toml::Table> {
        // A panic while holding the lock cannot leave the table half-written.
        self.values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, values: &toml::Table) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let content = toml::to_string(values)
            .map_err(|e| Error::config(format!("Failed to serialize preferences: {}", e)))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::config(format!("Failed to create preferences directory: {}", e))
            })?;
        }

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::config(format!("Failed to open preferences: {}", e)))?;

        file.lock_exclusive()
            .map_err(|e| Error::config(format!("Failed to lock preferences: {}", e)))?;
        file.write_all(content.as_bytes())
            .map_err(|e| Error::config(format!("Failed to write preferences: {}", e)))?;
        file.flush()
            .map_err(|e| Error::config(format!("Failed to flush preferences: {}", e)))?;

        trace!("Saved preferences to {:?}", path);
        Ok(())
    }
}
