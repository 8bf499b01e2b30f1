//! # thumbnail-atlas
//!
//! Thumbnail spritesheets with a persisted index.
//!
//! Given a large, slow collection of source images, the atlas produces
//! small preview bitmaps, packs them into fixed-size sheets and remembers
//! where each one went, so the next run crops instead of decoding.
//!
//! ## Architecture
//!
//! ```text
//! get_thumbnail(key, size)
//!     → HotCache ─ hit → bitmap
//!     → AtlasIndex ─ hit → AtlasStore::crop → bitmap
//!                  └ miss → ImageSource::decode → fit → RectPacker::place
//!                           → AtlasStore::blit → AtlasIndex::insert → bitmap
//! ```
//!
//! ## Guarantees
//!
//! - Same layout + same requests → identical placements
//! - Regions on one sheet never overlap
//! - At most one index entry per `(key, size)`, even under concurrent requests
//! - The persisted index only references pixels already written to disk
//! - An unreadable sheet is condemned and its thumbnails regenerated

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod types;
pub mod store;
pub mod packer;
pub mod index;
pub mod canonical;
pub mod config;
pub mod error;
pub mod hot_cache;
pub mod source;
pub mod cache;
mod shutdown;

// Re-exports
pub use types::{ParseSizeError, Rect, SheetId, Size, SourceKey, ThumbKey};
pub use store::{
    AtlasStore, BackendError, FlushReport, FsSheetBackend, MemorySheetBackend, SheetBackend,
    SheetUnavailable, StoreError, Unavailability, WriteBack,
};
pub use packer::{PackError, Placement, RectPacker};
pub use index::{AtlasIndex, IndexEntry, IndexError, IndexSnapshot, INDEX_SCHEMA_VERSION};
pub use canonical::{to_canonical_bytes, canonical_hash, canonical_hash_hex};
pub use config::{AtlasConfig, DEFAULT_SHEET_FLUSH_THRESHOLD, DEFAULT_SHEET_SIZE};
pub use error::AtlasError;
pub use hot_cache::{CacheConfig, CacheStats, HotCache};
pub use source::{FileImageSource, ImageSource, MemoryImageSource, MemorySourceError};
pub use cache::{AtlasStats, ThumbnailCache, WarmReport};
