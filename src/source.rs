//! Source image providers.
//!
//! The cache never enumerates or decodes images on its own; callers hand
//! it an [`ImageSource`].

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use image::{DynamicImage, ImageError};
use parking_lot::Mutex;

use crate::types::SourceKey;

/// Enumerates and decodes source images.
pub trait ImageSource: Sync {
    /// Identifier of one source image.
    type Key: SourceKey;
    /// Decode failure.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Every available key, in an order that is stable across calls.
    fn list(&self) -> Vec<Self::Key>;

    /// Decode one source image. May block for a long time.
    fn decode(&self, key: &Self::Key) -> Result<DynamicImage, Self::Error>;
}

/// Images read from an explicit list of files.
#[derive(Debug, Clone, Default)]
pub struct FileImageSource {
    paths: Vec<PathBuf>,
}

impl FileImageSource {
    /// Source over `paths`, listed in the given order.
    pub fn new(paths: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }
}

impl ImageSource for FileImageSource {
    type Key = PathBuf;
    type Error = ImageError;

    fn list(&self) -> Vec<PathBuf> {
        self.paths.clone()
    }

    fn decode(&self, key: &PathBuf) -> Result<DynamicImage, ImageError> {
        image::open(key)
    }
}

/// Failure decoding from a [`MemoryImageSource`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemorySourceError {
    /// No image is registered under the key.
    #[error("no image named '{0}'")]
    Unknown(String),
    /// The key was marked as failing.
    #[error("decoding '{0}' failed")]
    Injected(String),
}

/// In-memory images for tests and benchmarks.
///
/// Counts decodes, can fail chosen keys and can slow decoding down to
/// widen race windows.
#[derive(Debug, Default)]
pub struct MemoryImageSource {
    images: BTreeMap<String, DynamicImage>,
    failing: Mutex<HashSet<String>>,
    decodes: AtomicUsize,
    delay: Option<Duration>,
}

impl MemoryImageSource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an image.
    pub fn with_image(mut self, key: impl Into<String>, image: impl Into<DynamicImage>) -> Self {
        self.images.insert(key.into(), image.into());
        self
    }

    /// Sleep this long in every decode.
    pub fn with_decode_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make decoding `key` fail (or succeed again).
    pub fn set_failing(&self, key: &str, failing: bool) {
        let mut keys = self.failing.lock();
        if failing {
            keys.insert(key.to_owned());
        } else {
            keys.remove(key);
        }
    }

    /// Number of decode calls so far, failed ones included.
    pub fn decode_count(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }
}

impl ImageSource for MemoryImageSource {
    type Key = String;
    type Error = MemorySourceError;

    /// Keys in lexicographic order.
    fn list(&self) -> Vec<String> {
        self.images.keys().cloned().collect()
    }

    fn decode(&self, key: &String) -> Result<DynamicImage, MemorySourceError> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.failing.lock().contains(key) {
            return Err(MemorySourceError::Injected(key.clone()));
        }
        self.images
            .get(key)
            .cloned()
            .ok_or_else(|| MemorySourceError::Unknown(key.clone()))
    }
}
