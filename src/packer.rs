//! Corner-search rectangle packer.
//!
//! Places new thumbnails next to thumbnails already on a sheet. For each
//! sheet (in the order sheets became known) and each occupied rectangle `r`
//! on it (in placement order), four candidates are tried:
//!
//! 1. top-left of the new rect at `r`'s top-right corner
//! 2. top-left of the new rect at `r`'s bottom-right corner
//! 3. top-right of the new rect at `r`'s top-left corner
//! 4. top-right of the new rect at `r`'s bottom-left corner
//!
//! The first candidate that stays inside the sheet and overlaps nothing
//! else on it wins. When no sheet admits the rectangle, a new sheet is
//! opened and the rectangle goes to its origin.
//!
//! ## Determinism
//!
//! Same initial layout + same request sequence + same id source
//! → identical `(SheetId, Rect)` sequence.

use serde::Serialize;
use uuid::Uuid;

use crate::canonical::canonical_hash_hex;
use crate::types::{Rect, SheetId, Size};

/// Where a rectangle was placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Sheet receiving the rectangle.
    pub sheet: SheetId,
    /// Region on that sheet.
    pub rect: Rect,
    /// Whether the sheet was opened for this placement.
    pub new_sheet: bool,
}

/// Error placing a rectangle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PackError {
    /// The rectangle can never fit on a sheet of the configured size.
    #[error("rectangle {requested} exceeds sheet size {sheet}")]
    Oversized {
        /// Requested rectangle size.
        requested: Size,
        /// Sheet size new sheets are opened with.
        sheet: Size,
    },
    /// Zero-area rectangles are not placed.
    #[error("cannot place an empty rectangle ({0})")]
    Empty(Size),
}

/// How new sheet ids are produced.
#[derive(Debug, Clone)]
enum IdSource {
    Random,
    Sequential(u128),
}

impl IdSource {
    fn next(&mut self) -> SheetId {
        match self {
            Self::Random => SheetId::random(),
            Self::Sequential(next) => {
                let id = SheetId::new(Uuid::from_u128(*next));
                *next += 1;
                id
            }
        }
    }
}

/// Occupancy of one sheet.
#[derive(Debug, Clone, Serialize)]
struct SheetLayout {
    id: SheetId,
    size: Size,
    occupied: Vec<Rect>,
}

impl SheetLayout {
    fn find_spot(&self, size: Size) -> Option<Rect> {
        if self.occupied.is_empty() {
            let origin = Rect::at(0, 0, size);
            return origin.is_within(self.size).then_some(origin);
        }

        for (anchor_idx, anchor) in self.occupied.iter().enumerate() {
            for candidate in corner_candidates(anchor, size) {
                if !candidate.is_within(self.size) {
                    continue;
                }
                let collides = self
                    .occupied
                    .iter()
                    .enumerate()
                    .any(|(idx, rect)| idx != anchor_idx && rect.overlaps(&candidate));
                if !collides {
                    return Some(candidate);
                }
            }
        }
        None
    }
}

/// The four corner candidates around `anchor`, in trial order.
fn corner_candidates(anchor: &Rect, size: Size) -> [Rect; 4] {
    let w = size.width as i64;
    [
        Rect::at(anchor.right(), anchor.y, size),
        Rect::at(anchor.right(), anchor.bottom(), size),
        Rect::at(anchor.x - w, anchor.y, size),
        Rect::at(anchor.x - w, anchor.bottom(), size),
    ]
}

/// Approximate, deterministic rectangle packer over fixed-size sheets.
///
/// Holds only occupancy bookkeeping; bitmaps live in the
/// [`AtlasStore`](crate::store::AtlasStore).
#[derive(Debug, Clone)]
pub struct RectPacker {
    sheet_size: Size,
    sheets: Vec<SheetLayout>,
    ids: IdSource,
}

impl RectPacker {
    /// Create an empty packer opening sheets of `sheet_size` with random ids.
    pub fn new(sheet_size: Size) -> Self {
        Self {
            sheet_size,
            sheets: Vec::new(),
            ids: IdSource::Random,
        }
    }

    /// Create an empty packer whose new sheets get sequential ids
    /// starting at `first` (for reproducible layouts).
    pub fn with_sequential_ids(sheet_size: Size, first: u128) -> Self {
        Self {
            sheet_size,
            sheets: Vec::new(),
            ids: IdSource::Sequential(first),
        }
    }

    /// Size new sheets are opened with.
    pub fn sheet_size(&self) -> Size {
        self.sheet_size
    }

    /// Register an existing sheet of the given dimensions.
    ///
    /// Registering a known sheet updates its dimensions and keeps its
    /// occupancy.
    pub fn add_sheet(&mut self, id: SheetId, size: Size) {
        match self.sheets.iter_mut().find(|s| s.id == id) {
            Some(layout) => layout.size = size,
            None => self.sheets.push(SheetLayout {
                id,
                size,
                occupied: Vec::new(),
            }),
        }
    }

    /// Record a rectangle as occupied on a sheet.
    ///
    /// Unknown sheets are registered with the default sheet size.
    /// Returns `false` (and records nothing) if the rectangle is already
    /// recorded, leaves the sheet, or overlaps a recorded rectangle.
    pub fn occupy(&mut self, id: SheetId, rect: Rect) -> bool {
        if !self.sheets.iter().any(|s| s.id == id) {
            self.add_sheet(id, self.sheet_size);
        }
        let Some(layout) = self.sheets.iter_mut().find(|s| s.id == id) else {
            return false;
        };
        if !rect.is_within(layout.size) || layout.occupied.iter().any(|r| r.overlaps(&rect)) {
            return false;
        }
        layout.occupied.push(rect);
        true
    }

    /// Find a spot for a rectangle of `size`, opening a new sheet if no
    /// existing sheet has room. The rectangle is recorded as occupied.
    pub fn place(&mut self, size: Size) -> Result<Placement, PackError> {
        if size.is_empty() {
            return Err(PackError::Empty(size));
        }
        if !self.sheet_size.contains(size) {
            return Err(PackError::Oversized {
                requested: size,
                sheet: self.sheet_size,
            });
        }

        for layout in &mut self.sheets {
            if let Some(rect) = layout.find_spot(size) {
                layout.occupied.push(rect);
                return Ok(Placement {
                    sheet: layout.id,
                    rect,
                    new_sheet: false,
                });
            }
        }

        let id = self.ids.next();
        let rect = Rect::at(0, 0, size);
        self.sheets.push(SheetLayout {
            id,
            size: self.sheet_size,
            occupied: vec![rect],
        });
        Ok(Placement {
            sheet: id,
            rect,
            new_sheet: true,
        })
    }

    /// Forget a sheet and everything placed on it.
    pub fn discard_sheet(&mut self, id: &SheetId) -> bool {
        let before = self.sheets.len();
        self.sheets.retain(|s| s.id != *id);
        self.sheets.len() != before
    }

    /// Whether the sheet is known.
    pub fn has_sheet(&self, id: &SheetId) -> bool {
        self.sheets.iter().any(|s| s.id == *id)
    }

    /// Dimensions of a known sheet.
    pub fn sheet_dimensions(&self, id: &SheetId) -> Option<Size> {
        self.sheets.iter().find(|s| s.id == *id).map(|s| s.size)
    }

    /// Occupied rectangles of a sheet, in placement order.
    pub fn occupied(&self, id: &SheetId) -> &[Rect] {
        self.sheets
            .iter()
            .find(|s| s.id == *id)
            .map(|s| s.occupied.as_slice())
            .unwrap_or(&[])
    }

    /// Known sheets in iteration order.
    pub fn sheet_ids(&self) -> impl Iterator<Item = SheetId> + '_ {
        self.sheets.iter().map(|s| s.id)
    }

    /// Number of known sheets.
    pub fn sheet_count(&self) -> usize {
        self.sheets.len()
    }

    /// Hash of the full layout (sheet order, sizes, rectangles).
    pub fn layout_fingerprint(&self) -> String {
        canonical_hash_hex(&self.sheets)
    }
}
