//! Cache configuration.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use image::imageops::FilterType;

use crate::hot_cache::CacheConfig;
use crate::types::Size;

/// Default sheet dimensions.
pub const DEFAULT_SHEET_SIZE: Size = Size::new(2048, 2048);

/// Default mutations a sheet collects before it is written back.
pub const DEFAULT_SHEET_FLUSH_THRESHOLD: u32 = 50;

/// Configuration for a [`ThumbnailCache`](crate::ThumbnailCache).
#[derive(Debug, Clone)]
pub struct AtlasConfig {
    /// Directory holding `index.json` and the `sheets/` directory.
    pub root: PathBuf,
    /// Dimensions of newly opened sheets.
    pub sheet_size: Size,
    /// A sheet is written back on its Nth mutation since the last write
    /// (default: 50, so the 50th blit triggers the write).
    pub sheet_flush_threshold: u32,
    /// Inserts between index saves (default: 1, save after every insert).
    /// Recovery, flush and shutdown always save.
    pub index_save_interval: u32,
    /// Hot thumbnail cache bounds.
    pub hot_cache: CacheConfig,
    /// Filter used when scaling sources down to thumbnails.
    pub filter: FilterType,
}

impl Default for AtlasConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./spritesheets"),
            sheet_size: DEFAULT_SHEET_SIZE,
            sheet_flush_threshold: DEFAULT_SHEET_FLUSH_THRESHOLD,
            index_save_interval: 1,
            hot_cache: CacheConfig::default(),
            filter: FilterType::Triangle,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, value = %raw, "Ignoring invalid value, using default");
            default
        }),
        Err(_) => default,
    }
}

impl AtlasConfig {
    /// Configuration rooted at `root`, defaults elsewhere.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Reads `THUMBNAIL_ATLAS_DIR`, `THUMBNAIL_ATLAS_SHEET_SIZE` (`WxH`),
    /// `THUMBNAIL_ATLAS_SHEET_FLUSH` and `THUMBNAIL_ATLAS_INDEX_SAVE_INTERVAL`.
    /// Unset or invalid values fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let sheet_size = env_or("THUMBNAIL_ATLAS_SHEET_SIZE", defaults.sheet_size);
        Self {
            root: std::env::var_os("THUMBNAIL_ATLAS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| defaults.root.clone()),
            sheet_size: if sheet_size.is_empty() {
                tracing::warn!(size = %sheet_size, "Empty sheet size, using default");
                defaults.sheet_size
            } else {
                sheet_size
            },
            sheet_flush_threshold: env_or("THUMBNAIL_ATLAS_SHEET_FLUSH", defaults.sheet_flush_threshold),
            index_save_interval: env_or(
                "THUMBNAIL_ATLAS_INDEX_SAVE_INTERVAL",
                defaults.index_save_interval,
            ),
            ..defaults
        }
    }

    /// Set the sheet dimensions.
    pub fn with_sheet_size(mut self, size: Size) -> Self {
        self.sheet_size = size;
        self
    }

    /// Set the sheet write-back threshold.
    pub fn with_sheet_flush_threshold(mut self, threshold: u32) -> Self {
        self.sheet_flush_threshold = threshold;
        self
    }

    /// Set how many inserts pass between index saves.
    pub fn with_index_save_interval(mut self, interval: u32) -> Self {
        self.index_save_interval = interval;
        self
    }

    /// Set the hot cache bounds.
    pub fn with_hot_cache(mut self, hot_cache: CacheConfig) -> Self {
        self.hot_cache = hot_cache;
        self
    }

    /// Set the resize filter.
    pub fn with_filter(mut self, filter: FilterType) -> Self {
        self.filter = filter;
        self
    }

    /// Path of the index document.
    pub fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    /// Directory holding the sheet files.
    pub fn sheet_dir(&self) -> PathBuf {
        self.root.join("sheets")
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AtlasConfig::default();
        assert_eq!(config.sheet_size, Size::new(2048, 2048));
        assert_eq!(config.sheet_flush_threshold, 50);
        assert_eq!(config.index_save_interval, 1);
        assert!(config.hot_cache.enabled);
        assert_eq!(config.index_path(), PathBuf::from("./spritesheets/index.json"));
        assert_eq!(config.sheet_dir(), PathBuf::from("./spritesheets/sheets"));
    }

    #[test]
    fn test_builders() {
        let config = AtlasConfig::new("/tmp/atlas")
            .with_sheet_size(Size::new(100, 100))
            .with_sheet_flush_threshold(1)
            .with_index_save_interval(10)
            .with_filter(FilterType::Nearest);
        assert_eq!(config.root(), Path::new("/tmp/atlas"));
        assert_eq!(config.sheet_size, Size::new(100, 100));
        assert_eq!(config.sheet_flush_threshold, 1);
        assert_eq!(config.index_save_interval, 10);
        assert_eq!(config.filter, FilterType::Nearest);
    }

    // All env handling in one test: the process environment is shared
    // between test threads.
    #[test]
    fn test_from_env() {
        std::env::set_var("THUMBNAIL_ATLAS_DIR", "/var/cache/atlas");
        std::env::set_var("THUMBNAIL_ATLAS_SHEET_SIZE", "512x256");
        std::env::set_var("THUMBNAIL_ATLAS_SHEET_FLUSH", "not-a-number");
        std::env::remove_var("THUMBNAIL_ATLAS_INDEX_SAVE_INTERVAL");

        let config = AtlasConfig::from_env();
        assert_eq!(config.root, PathBuf::from("/var/cache/atlas"));
        assert_eq!(config.sheet_size, Size::new(512, 256));
        assert_eq!(config.sheet_flush_threshold, DEFAULT_SHEET_FLUSH_THRESHOLD);
        assert_eq!(config.index_save_interval, 1);

        std::env::set_var("THUMBNAIL_ATLAS_SHEET_SIZE", "0x10");
        assert_eq!(AtlasConfig::from_env().sheet_size, DEFAULT_SHEET_SIZE);

        for var in [
            "THUMBNAIL_ATLAS_DIR",
            "THUMBNAIL_ATLAS_SHEET_SIZE",
            "THUMBNAIL_ATLAS_SHEET_FLUSH",
        ] {
            std::env::remove_var(var);
        }
    }
}
