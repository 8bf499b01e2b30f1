//! In-process LRU of recently served thumbnails.
//!
//! Sits in front of the index so repeated requests for the same thumbnail
//! skip the catalog lock and the sheet crop entirely. Purely an
//! accelerator: disabling it changes no results.

use std::num::NonZeroUsize;
use std::sync::Arc;

use image::RgbaImage;
use lru::LruCache;
use parking_lot::RwLock;

use crate::types::{SheetId, ThumbKey};

/// Configuration for the hot thumbnail cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of thumbnails held.
    pub max_entries: usize,
    /// Whether to enable the cache.
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1_024,
            enabled: true,
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Current number of entries in the cache.
    pub len: usize,
    /// Maximum capacity of the cache.
    pub cap: usize,
}

#[derive(Debug)]
struct Hot {
    sheet: SheetId,
    bitmap: Arc<RgbaImage>,
}

/// LRU of decoded thumbnails keyed by `(source key, size)`.
#[derive(Debug)]
pub struct HotCache {
    cache: Option<RwLock<LruCache<ThumbKey, Hot>>>,
}

impl HotCache {
    /// Create a cache from its configuration.
    pub fn new(config: &CacheConfig) -> Self {
        let cache = config.enabled.then(|| {
            let size = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
            RwLock::new(LruCache::new(size))
        });
        Self { cache }
    }

    /// A cache that never holds anything.
    pub fn disabled() -> Self {
        Self { cache: None }
    }

    /// Fetch a thumbnail, marking it most recently used.
    pub fn get(&self, key: &ThumbKey) -> Option<Arc<RgbaImage>> {
        let cache = self.cache.as_ref()?;
        cache.write().get(key).map(|hot| Arc::clone(&hot.bitmap))
    }

    /// Remember a thumbnail served from `sheet`.
    pub fn put(&self, key: ThumbKey, sheet: SheetId, bitmap: Arc<RgbaImage>) {
        if let Some(cache) = &self.cache {
            cache.write().put(key, Hot { sheet, bitmap });
        }
    }

    /// Forget every thumbnail served from `sheet`.
    pub fn invalidate_sheet(&self, sheet: &SheetId) -> usize {
        let Some(cache) = &self.cache else {
            return 0;
        };
        let mut cache = cache.write();
        let condemned: Vec<ThumbKey> = cache
            .iter()
            .filter(|(_, hot)| hot.sheet == *sheet)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &condemned {
            cache.pop(key);
        }
        condemned.len()
    }

    /// Get cache statistics.
    ///
    /// Returns `None` if caching is disabled.
    pub fn stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|cache| {
            let cache = cache.read();
            CacheStats {
                len: cache.len(),
                cap: cache.cap().get(),
            }
        })
    }

    /// Drop every cached thumbnail.
    pub fn clear(&self) {
        if let Some(cache) = &self.cache {
            cache.write().clear();
        }
    }
}
