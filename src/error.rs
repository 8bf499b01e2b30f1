//! Error type for thumbnail requests.

use crate::index::IndexError;
use crate::packer::PackError;
use crate::store::StoreError;
use crate::types::{SheetId, Size, ThumbKey};

/// Errors returned by [`ThumbnailCache`](crate::ThumbnailCache).
#[derive(Debug, thiserror::Error)]
pub enum AtlasError {
    /// The source image could not be loaded or decoded. Nothing was recorded.
    #[error("failed to decode source '{key}': {source}")]
    Decode {
        /// Canonical text of the source key.
        key: String,
        /// Underlying failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A sheet stayed unreadable after its entries were condemned and the
    /// thumbnail regenerated.
    #[error("sheet {sheet} is still unreadable after recovery")]
    PersistentCacheCorruption {
        /// The sheet that keeps failing.
        sheet: SheetId,
    },

    /// The index already held an entry for a thumbnail being inserted.
    #[error("duplicate index entry for {0}")]
    DuplicateEntry(ThumbKey),

    /// The fitted thumbnail is larger than a sheet.
    #[error("thumbnail of {requested} does not fit in a {sheet} sheet")]
    OversizedThumbnail {
        /// Fitted thumbnail size, or the requested box when no fit can be small enough.
        requested: Size,
        /// Configured sheet size.
        sheet: Size,
    },

    /// The requested size or the source has a zero dimension.
    #[error("cannot produce an empty thumbnail ({0})")]
    EmptyThumbnail(Size),

    /// The cache is shutting down and accepts no new placements.
    #[error("thumbnail cache is shut down")]
    ShuttingDown,

    /// Index persistence failed.
    #[error(transparent)]
    Index(IndexError),

    /// Sheet storage failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The cache directory could not be prepared.
    #[error("cache directory unusable: {0}")]
    Io(#[from] std::io::Error),
}

impl From<IndexError> for AtlasError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::DuplicateEntry(key) => Self::DuplicateEntry(key),
            other => Self::Index(other),
        }
    }
}

impl From<PackError> for AtlasError {
    fn from(err: PackError) -> Self {
        match err {
            PackError::Oversized { requested, sheet } => Self::OversizedThumbnail { requested, sheet },
            PackError::Empty(size) => Self::EmptyThumbnail(size),
        }
    }
}

impl AtlasError {
    /// Wrap a source decode failure.
    pub fn decode<E>(key: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Decode {
            key: key.into(),
            source: Box::new(source),
        }
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Index(IndexError::Io(_)) | Self::Store(StoreError::Backend { .. }) | Self::Io(_)
        )
    }
}
