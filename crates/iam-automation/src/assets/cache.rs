//! File-backed asset cache, one directory per schedule

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde_json::Value;

use iam_core::prelude::*;
use iam_core::{InAppMessage, JsonMap};

use super::delegate::{CachePolicy, DefaultCachePolicy, LocalMediaDelegate, PrepareAssetsDelegate};
use super::{AssetManager, AssetPrepareResult};

/// Name of the per-schedule metadata document
pub const METADATA_FILE: &str = "metadata.json";

/// Cached files and metadata for one schedule
#[derive(Debug, Clone, PartialEq)]
pub struct Assets {
    root: PathBuf,
    metadata: JsonMap,
}

impl Assets {
    /// Open (creating if needed) the asset directory at `root`
    pub fn load(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            warn!("Failed to create asset directory {:?}: {}", root, e);
            Error::AssetCacheUnavailable { path: root.clone() }
        })?;

        let metadata_path = root.join(METADATA_FILE);
        let metadata = if metadata_path.exists() {
            let content = std::fs::read_to_string(&metadata_path)?;
            match serde_json::from_str::<Value>(&content)? {
                Value::Object(map) => map,
                _ => {
                    warn!("Asset metadata at {:?} is not an object, resetting", metadata_path);
                    JsonMap::new()
                }
            }
        } else {
            JsonMap::new()
        };

        Ok(Self { root, metadata })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path where the asset for `key` (usually a URL) is stored
    pub fn file(&self, key: &str) -> PathBuf {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        self.root.join(format!("asset-{:016x}", hasher.finish()))
    }

    pub fn has_file(&self, key: &str) -> bool {
        self.file(key).is_file()
    }

    pub fn metadata(&self) -> &JsonMap {
        &self.metadata
    }

    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Set a metadata entry and persist the document
    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) -> Result<()> {
        self.metadata.insert(key.into(), value);
        let content = serde_json::to_string(&self.metadata)?;
        std::fs::write(self.root.join(METADATA_FILE), content)
            .with_context(|| format!("Failed to write asset metadata in {:?}", self.root))?;
        Ok(())
    }
}

/// Stock [`AssetManager`]
pub struct AssetCache {
    root: PathBuf,
    delegate: RwLock<Arc<dyn PrepareAssetsDelegate>>,
    policy: RwLock<Arc<dyn CachePolicy>>,
    open: Mutex<HashMap<String, Assets>>,
}

impl fmt::Debug for AssetCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetCache")
            .field("root", &self.root)
            .field("open", &self.lock_open().len())
            .finish()
    }
}

impl AssetCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            delegate: RwLock::new(Arc::new(LocalMediaDelegate)),
            policy: RwLock::new(Arc::new(DefaultCachePolicy)),
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn set_prepare_delegate(&self, delegate: Arc<dyn PrepareAssetsDelegate>) {
        *self.delegate.write().unwrap_or_else(|p| p.into_inner()) = delegate;
    }

    pub fn set_cache_policy(&self, policy: Arc<dyn CachePolicy>) {
        *self.policy.write().unwrap_or_else(|p| p.into_inner()) = policy;
    }

    /// Directory for a schedule's assets
    pub fn schedule_dir(&self, schedule_id: &str) -> PathBuf {
        let name: String = schedule_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(name)
    }

    /// Remove a schedule's assets from memory and disk
    pub fn clear(&self, schedule_id: &str) {
        self.lock_open().remove(schedule_id);

        let dir = self.schedule_dir(schedule_id);
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!("Failed to clear assets for {}: {}", schedule_id, e);
            } else {
                debug!("Cleared assets for {}", schedule_id);
            }
        }
    }

    fn delegate(&self) -> Arc<dyn PrepareAssetsDelegate> {
        self.delegate.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn policy(&self) -> Arc<dyn CachePolicy> {
        self.policy.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn lock_open(&self) -> MutexGuard<'_, HashMap<String, Assets>> {
        self.open.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn get_or_load(&self, schedule_id: &str) -> Result<Assets> {
        if let Some(assets) = self.lock_open().get(schedule_id) {
            return Ok(assets.clone());
        }
        Assets::load(self.schedule_dir(schedule_id))
    }

    fn store(&self, schedule_id: &str, assets: Assets) {
        self.lock_open().insert(schedule_id.to_string(), assets);
    }
}

impl AssetManager for AssetCache {
    fn on_schedule(&self, schedule_id: &str, message: &InAppMessage) {
        if !self.policy().should_cache_on_schedule(schedule_id, message) {
            return;
        }

        match self.get_or_load(schedule_id) {
            Ok(mut assets) => {
                self.delegate().on_schedule(schedule_id, message, &mut assets);
                self.store(schedule_id, assets);
            }
            Err(e) => warn!("Unable to pre-cache assets for {}: {}", schedule_id, e),
        }
    }

    fn on_prepare(&self, schedule_id: &str, message: &InAppMessage) -> AssetPrepareResult {
        let mut assets = match self.get_or_load(schedule_id) {
            Ok(assets) => assets,
            Err(e) => {
                warn!("Unable to open assets for {}: {}", schedule_id, e);
                return AssetPrepareResult::Retry;
            }
        };

        let result = self.delegate().on_prepare(schedule_id, message, &mut assets);
        self.store(schedule_id, assets);
        result
    }

    fn on_display_finished(&self, schedule_id: &str, message: &InAppMessage) {
        if self
            .policy()
            .should_persist_cache_after_display(schedule_id, message)
        {
            self.lock_open().remove(schedule_id);
            return;
        }
        self.clear(schedule_id);
    }

    fn on_finish(&self, schedule_id: &str) {
        self.clear(schedule_id);
    }

    fn assets(&self, schedule_id: &str) -> Option<Assets> {
        if let Some(assets) = self.lock_open().get(schedule_id) {
            return Some(assets.clone());
        }

        let dir = self.schedule_dir(schedule_id);
        if !dir.is_dir() {
            return None;
        }
        Assets::load(dir).ok()
    }
}
