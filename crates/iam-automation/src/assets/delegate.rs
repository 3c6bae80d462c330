//! Hooks that decide what the asset cache fetches and keeps

use std::io::ErrorKind;
use std::path::Path;

use serde_json::{json, Value};

use iam_core::prelude::*;
use iam_core::InAppMessage;

use super::cache::Assets;
use super::AssetPrepareResult;

/// Fetches the assets a message needs into its cache directory
pub trait PrepareAssetsDelegate: Send + Sync {
    /// Pre-cache when the schedule is created. Only called when the cache
    /// policy allows it.
    fn on_schedule(&self, _schedule_id: &str, _message: &InAppMessage, _assets: &mut Assets) {}

    fn on_prepare(
        &self,
        schedule_id: &str,
        message: &InAppMessage,
        assets: &mut Assets,
    ) -> AssetPrepareResult;
}

/// When the asset cache fetches early and what it keeps
pub trait CachePolicy: Send + Sync {
    fn should_cache_on_schedule(&self, _schedule_id: &str, _message: &InAppMessage) -> bool {
        false
    }

    fn should_persist_cache_after_display(
        &self,
        _schedule_id: &str,
        _message: &InAppMessage,
    ) -> bool {
        false
    }
}

/// Fetch at prepare time, discard after display
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCachePolicy;

impl CachePolicy for DefaultCachePolicy {}

/// Copies image media with `file://` URLs into the cache.
///
/// Remote URLs are left for the rendering layer to load. A missing source
/// file cancels the prepare; other I/O failures retry.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalMediaDelegate;

impl LocalMediaDelegate {
    fn cache_media(&self, url: &str, assets: &mut Assets) -> AssetPrepareResult {
        if assets.has_file(url) {
            return AssetPrepareResult::Ok;
        }

        let Some(source) = url.strip_prefix("file://") else {
            trace!("Skipping non-local media {}", url);
            return AssetPrepareResult::Ok;
        };

        let target = assets.file(url);
        match std::fs::copy(Path::new(source), &target) {
            Ok(size) => {
                if let Err(e) = assets.set_metadata(url, json!({ "size": size })) {
                    warn!("Failed to record asset metadata for {}: {}", url, e);
                }
                AssetPrepareResult::Ok
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("Media {} does not exist", url);
                AssetPrepareResult::Cancel
            }
            Err(e) => {
                debug!("Failed to cache media {}: {}", url, e);
                AssetPrepareResult::Retry
            }
        }
    }
}

impl PrepareAssetsDelegate for LocalMediaDelegate {
    fn on_schedule(&self, schedule_id: &str, message: &InAppMessage, assets: &mut Assets) {
        let result = self.on_prepare(schedule_id, message, assets);
        if result != AssetPrepareResult::Ok {
            debug!("Pre-cache for {} returned {:?}", schedule_id, result);
        }
    }

    fn on_prepare(
        &self,
        _schedule_id: &str,
        message: &InAppMessage,
        assets: &mut Assets,
    ) -> AssetPrepareResult {
        let mut urls = Vec::new();
        collect_image_urls(message.display_content(), &mut urls);

        for url in urls {
            match self.cache_media(&url, assets) {
                AssetPrepareResult::Ok => {}
                other => return other,
            }
        }
        AssetPrepareResult::Ok
    }
}

/// Every `media` object of type `image` anywhere in the payload
fn collect_image_urls(value: &Value, urls: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            if let Some(media) = map.get("media") {
                let is_image = media.get("type").and_then(Value::as_str) == Some("image");
                if let (true, Some(url)) = (is_image, media.get("url").and_then(Value::as_str)) {
                    urls.push(url.to_string());
                }
            }
            for (key, child) in map {
                if key != "media" {
                    collect_image_urls(child, urls);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_image_urls(item, urls)),
        _ => {}
    }
}
