//! Sizes and sheet-local rectangles.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex_lite::Regex;

/// A width×height pair.
///
/// Used both as the bounding box a thumbnail must fit inside and as
/// the dimensions of a sheet. Encodes canonically as `"<w>x<h>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "[u32; 2]", from = "[u32; 2]")]
pub struct Size {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Size {
    /// Create a new size.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Whether either dimension is zero.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether `other` fits inside this size in both axes.
    pub fn contains(&self, other: Size) -> bool {
        other.width <= self.width && other.height <= self.height
    }

    /// Largest size with this size's aspect ratio that fits inside `bounds`.
    ///
    /// Sources smaller than `bounds` are scaled up. Each resulting
    /// dimension is truncated and clamped to at least one pixel.
    pub fn fit_within(&self, bounds: Size) -> Size {
        if self.is_empty() || bounds.is_empty() {
            return Size::new(0, 0);
        }
        let (sw, sh) = (self.width as u64, self.height as u64);
        let (bw, bh) = (bounds.width as u64, bounds.height as u64);

        // Integer form of `ratio = max(sw / bw, sh / bh)`, truncating exactly.
        let (width, height) = if sw * bh >= sh * bw {
            (bw, sh * bw / sw)
        } else {
            (sw * bh / sh, bh)
        };
        Size::new(
            (width as u32).clamp(1, bounds.width),
            (height as u32).clamp(1, bounds.height),
        )
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Error parsing a `"<w>x<h>"` size encoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid size encoding '{0}', expected '<width>x<height>'")]
pub struct ParseSizeError(pub String);

fn size_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\d+)x(\d+)$").expect("size pattern is valid"))
}

impl FromStr for Size {
    type Err = ParseSizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = size_pattern()
            .captures(s.trim())
            .ok_or_else(|| ParseSizeError(s.to_string()))?;
        let width = caps[1].parse().map_err(|_| ParseSizeError(s.to_string()))?;
        let height = caps[2].parse().map_err(|_| ParseSizeError(s.to_string()))?;
        Ok(Size::new(width, height))
    }
}

impl From<Size> for [u32; 2] {
    fn from(size: Size) -> Self {
        [size.width, size.height]
    }
}

impl From<[u32; 2]> for Size {
    fn from([width, height]: [u32; 2]) -> Self {
        Size::new(width, height)
    }
}

impl From<(u32, u32)> for Size {
    fn from((width, height): (u32, u32)) -> Self {
        Size::new(width, height)
    }
}

/// An integer rectangle in sheet-local coordinates.
///
/// Candidate placements may temporarily lie at negative coordinates,
/// hence the signed origin. Persists as `[x, y, width, height]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "[i64; 4]", try_from = "[i64; 4]")]
pub struct Rect {
    /// Left edge.
    pub x: i64,
    /// Top edge.
    pub y: i64,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Rect {
    /// Create a new rectangle.
    pub const fn new(x: i64, y: i64, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Rectangle of `size` with its top-left corner at `(x, y)`.
    pub const fn at(x: i64, y: i64, size: Size) -> Self {
        Self::new(x, y, size.width, size.height)
    }

    /// Exclusive right edge.
    pub fn right(&self) -> i64 {
        self.x + self.width as i64
    }

    /// Exclusive bottom edge.
    pub fn bottom(&self) -> i64 {
        self.y + self.height as i64
    }

    /// Dimensions of the rectangle.
    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// Whether the two rectangles share any interior area.
    ///
    /// Rectangles that only touch along an edge do not overlap.
    pub fn overlaps(&self, other: &Rect) -> bool {
        self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }

    /// Whether the rectangle lies entirely inside a sheet of `bounds`.
    pub fn is_within(&self, bounds: Size) -> bool {
        self.x >= 0
            && self.y >= 0
            && self.right() <= bounds.width as i64
            && self.bottom() <= bounds.height as i64
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {}x{})", self.x, self.y, self.width, self.height)
    }
}

impl From<Rect> for [i64; 4] {
    fn from(rect: Rect) -> Self {
        [rect.x, rect.y, rect.width as i64, rect.height as i64]
    }
}

impl TryFrom<[i64; 4]> for Rect {
    type Error = String;

    fn try_from([x, y, width, height]: [i64; 4]) -> Result<Self, Self::Error> {
        let width = u32::try_from(width).map_err(|_| format!("invalid rect width {width}"))?;
        let height = u32::try_from(height).map_err(|_| format!("invalid rect height {height}"))?;
        Ok(Rect::new(x, y, width, height))
    }
}
