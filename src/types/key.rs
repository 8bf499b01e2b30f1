//! Source image identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use super::geometry::Size;

/// Stable identifier for a source image.
///
/// Implementations must return the same text for the same image across
/// process restarts: the text keys the persisted index. Two keys are
/// equal exactly when their canonical texts are equal.
pub trait SourceKey {
    /// Canonical textual encoding of the key.
    fn canonical_text(&self) -> String;
}

impl SourceKey for str {
    fn canonical_text(&self) -> String {
        self.to_owned()
    }
}

impl SourceKey for String {
    fn canonical_text(&self) -> String {
        self.clone()
    }
}

/// Paths encode through their lossy UTF-8 form.
impl SourceKey for Path {
    fn canonical_text(&self) -> String {
        self.to_string_lossy().into_owned()
    }
}

impl SourceKey for PathBuf {
    fn canonical_text(&self) -> String {
        self.as_path().canonical_text()
    }
}

impl SourceKey for u64 {
    fn canonical_text(&self) -> String {
        self.to_string()
    }
}

impl<K: SourceKey + ?Sized> SourceKey for &K {
    fn canonical_text(&self) -> String {
        (**self).canonical_text()
    }
}

/// A `(source key, requested size)` pair.
///
/// Identifies one thumbnail in the index, the hot cache and the
/// in-flight table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ThumbKey {
    /// Canonical text of the source key.
    pub key: String,
    /// Requested bounding box.
    pub size: Size,
}

impl ThumbKey {
    /// Create a thumbnail key from any source key.
    pub fn new<K: SourceKey + ?Sized>(key: &K, size: Size) -> Self {
        Self {
            key: key.canonical_text(),
            size,
        }
    }
}

impl fmt::Display for ThumbKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key, self.size)
    }
}
