//! Core types for the thumbnail atlas.

pub mod geometry;
pub mod key;
pub mod sheet;

pub use geometry::{ParseSizeError, Rect, Size};
pub use key::{SourceKey, ThumbKey};
pub use sheet::SheetId;
