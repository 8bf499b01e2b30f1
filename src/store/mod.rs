//! Sheet bitmap storage.
//!
//! [`AtlasStore`] keeps sheet bitmaps in memory, loads them lazily from a
//! [`SheetBackend`] on first use and writes them back once a sheet has
//! collected `flush_threshold` mutations since its last write.
//!
//! ## Locking
//!
//! Each sheet sits behind its own mutex: one writer per sheet, and a slow
//! load or write-back of one sheet never blocks another. The table lock is
//! only held to look up or insert a sheet's slot.

pub mod fs;
pub mod memory;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use image::{imageops, RgbaImage};
use parking_lot::Mutex;

use crate::types::{Rect, SheetId, Size};

pub use fs::FsSheetBackend;
pub use memory::MemorySheetBackend;

/// Why a sheet's bitmap could not be produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unavailability {
    /// No persisted bitmap exists.
    Missing,
    /// The persisted bitmap exists but cannot be decoded or has the wrong shape.
    Corrupt(String),
}

impl fmt::Display for Unavailability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => write!(f, "missing"),
            Self::Corrupt(reason) => write!(f, "corrupt: {reason}"),
        }
    }
}

/// A sheet whose bitmap is missing or unreadable.
///
/// Callers treat the sheet as empty and condemn every index entry that
/// points into it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("sheet {sheet} unavailable ({reason})")]
pub struct SheetUnavailable {
    /// The sheet that failed to load.
    pub sheet: SheetId,
    /// What went wrong.
    pub reason: Unavailability,
}

impl SheetUnavailable {
    /// The sheet has no persisted bitmap.
    pub fn missing(sheet: SheetId) -> Self {
        Self {
            sheet,
            reason: Unavailability::Missing,
        }
    }

    /// The sheet's persisted bitmap is unusable.
    pub fn corrupt(sheet: SheetId, reason: impl Into<String>) -> Self {
        Self {
            sheet,
            reason: Unavailability::Corrupt(reason.into()),
        }
    }
}

/// Failure writing or removing a persisted sheet.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Filesystem failure.
    #[error("sheet I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// Encoding failure.
    #[error("sheet encoding failed: {0}")]
    Image(#[from] image::ImageError),
}

/// Errors from [`AtlasStore`] operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The sheet could not be loaded.
    #[error(transparent)]
    Unavailable(#[from] SheetUnavailable),

    /// The sheet could not be written to or removed from the backend.
    #[error("sheet {sheet} could not be persisted: {source}")]
    Backend {
        /// Sheet being persisted.
        sheet: SheetId,
        /// Backend failure.
        #[source]
        source: BackendError,
    },

    /// A blit's bitmap does not match its target region.
    #[error("bitmap of {bitmap} does not match region {region} on sheet {sheet}")]
    RegionMismatch {
        /// Target sheet.
        sheet: SheetId,
        /// Target region.
        region: Rect,
        /// Size of the bitmap being written.
        bitmap: Size,
    },
}

/// Persistence seam for sheet bitmaps.
///
/// Implementations must be lossless: a written bitmap reads back
/// pixel-identical.
pub trait SheetBackend: Send + Sync {
    /// Read a sheet's persisted bitmap.
    fn read(&self, id: &SheetId) -> Result<RgbaImage, SheetUnavailable>;

    /// Persist a sheet's bitmap, replacing any previous version.
    fn write(&self, id: &SheetId, bitmap: &RgbaImage) -> Result<(), BackendError>;

    /// Delete a sheet's persisted bitmap. Deleting a missing sheet succeeds.
    fn remove(&self, id: &SheetId) -> Result<(), BackendError>;

    /// Whether a persisted bitmap exists for the sheet.
    fn contains(&self, id: &SheetId) -> bool;

    /// Every sheet with a persisted bitmap, in id order.
    fn list(&self) -> Result<Vec<SheetId>, BackendError>;
}

impl<B: SheetBackend + ?Sized> SheetBackend for Arc<B> {
    fn read(&self, id: &SheetId) -> Result<RgbaImage, SheetUnavailable> {
        (**self).read(id)
    }

    fn write(&self, id: &SheetId, bitmap: &RgbaImage) -> Result<(), BackendError> {
        (**self).write(id, bitmap)
    }

    fn remove(&self, id: &SheetId) -> Result<(), BackendError> {
        (**self).remove(id)
    }

    fn contains(&self, id: &SheetId) -> bool {
        (**self).contains(id)
    }

    fn list(&self) -> Result<Vec<SheetId>, BackendError> {
        (**self).list()
    }
}

/// Result of a mutation, for the index's durability bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteBack {
    /// Revision of the sheet after the mutation.
    pub revision: u64,
    /// Revision made durable by a write-back triggered by this mutation.
    pub persisted: Option<u64>,
}

/// Outcome of [`AtlasStore::flush_all`].
#[derive(Debug, Default)]
pub struct FlushReport {
    /// Sheets written, with the revision each write made durable.
    pub persisted: Vec<(SheetId, u64)>,
    /// Sheets whose write failed. They stay in memory for the next flush.
    pub failed: Vec<(SheetId, BackendError)>,
}

impl FlushReport {
    /// Whether every sheet was written.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// An in-memory sheet.
#[derive(Debug)]
struct Sheet {
    bitmap: RgbaImage,
    /// Bumped on every mutation.
    revision: u64,
    /// Mutations since the last successful write-back.
    pending: u32,
}

type Slot = Arc<Mutex<Option<Sheet>>>;

/// Write-back cache of sheet bitmaps.
pub struct AtlasStore<B> {
    backend: B,
    flush_threshold: u32,
    sheets: Mutex<HashMap<SheetId, Slot>>,
}

impl<B: SheetBackend> AtlasStore<B> {
    /// Create a store writing each sheet back on its `flush_threshold`th
    /// mutation since the last write (a threshold of zero behaves like one).
    pub fn new(backend: B, flush_threshold: u32) -> Self {
        Self {
            backend,
            flush_threshold: flush_threshold.max(1),
            sheets: Mutex::new(HashMap::new()),
        }
    }

    /// The persistence backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Mutations a sheet collects before it is written back.
    pub fn flush_threshold(&self) -> u32 {
        self.flush_threshold
    }

    fn slot(&self, id: &SheetId) -> Slot {
        Arc::clone(self.sheets.lock().entry(*id).or_default())
    }

    /// Drop a slot that failed to load, unless someone filled it meanwhile.
    fn forget_if_empty(&self, id: &SheetId, slot: &Slot) {
        let mut sheets = self.sheets.lock();
        if let Some(current) = sheets.get(id) {
            let still_empty = current.try_lock().is_some_and(|sheet| sheet.is_none());
            if Arc::ptr_eq(current, slot) && still_empty {
                sheets.remove(id);
            }
        }
    }

    /// Run `f` on a sheet, loading it from the backend if it is not in memory.
    fn with_sheet<R>(
        &self,
        id: &SheetId,
        f: impl FnOnce(&mut Sheet) -> R,
    ) -> Result<R, SheetUnavailable> {
        let slot = self.slot(id);
        let mut guard = slot.lock();
        if guard.is_none() {
            tracing::debug!(sheet = %id, "Loading sheet from storage");
            match self.backend.read(id) {
                Ok(bitmap) => {
                    *guard = Some(Sheet {
                        bitmap,
                        revision: 0,
                        pending: 0,
                    });
                }
                Err(unavailable) => {
                    tracing::warn!(sheet = %id, reason = %unavailable.reason, "Sheet is broken or missing");
                    drop(guard);
                    self.forget_if_empty(id, &slot);
                    return Err(unavailable);
                }
            }
        }
        match guard.as_mut() {
            Some(sheet) => Ok(f(sheet)),
            None => Err(SheetUnavailable::missing(*id)),
        }
    }

    /// Count one mutation and write the sheet back if the threshold is reached.
    fn record_mutation(&self, id: &SheetId, sheet: &mut Sheet) -> WriteBack {
        sheet.revision += 1;
        sheet.pending += 1;

        let mut persisted = None;
        if sheet.pending >= self.flush_threshold {
            match self.backend.write(id, &sheet.bitmap) {
                Ok(()) => {
                    tracing::info!(sheet = %id, revision = sheet.revision, "Saved sheet");
                    sheet.pending = 0;
                    persisted = Some(sheet.revision);
                }
                Err(e) => {
                    tracing::warn!(sheet = %id, error = %e, "Sheet write-back failed; will retry");
                }
            }
        }

        WriteBack {
            revision: sheet.revision,
            persisted,
        }
    }

    /// Start a blank in-memory sheet.
    ///
    /// Nothing is persisted until the sheet is mutated enough or flushed.
    /// An existing in-memory sheet with the same id is replaced.
    pub fn create(&self, id: SheetId, size: Size) {
        tracing::debug!(sheet = %id, size = %size, "Creating sheet");
        let sheet = Sheet {
            bitmap: RgbaImage::new(size.width, size.height),
            revision: 0,
            pending: 0,
        };
        self.sheets.lock().insert(id, Arc::new(Mutex::new(Some(sheet))));
    }

    /// Copy of a sheet's full bitmap.
    pub fn load(&self, id: &SheetId) -> Result<RgbaImage, SheetUnavailable> {
        self.with_sheet(id, |sheet| sheet.bitmap.clone())
    }

    /// Copy of one region of a sheet.
    ///
    /// A region reaching outside the bitmap means the persisted sheet does
    /// not match what the index recorded, and is reported as corruption.
    pub fn crop(&self, id: &SheetId, region: Rect) -> Result<RgbaImage, SheetUnavailable> {
        self.with_sheet(id, |sheet| {
            let (w, h) = sheet.bitmap.dimensions();
            if !region.is_within(Size::new(w, h)) {
                return Err(SheetUnavailable::corrupt(
                    *id,
                    format!("region {region} outside {w}x{h} bitmap"),
                ));
            }
            Ok(imageops::crop_imm(
                &sheet.bitmap,
                region.x as u32,
                region.y as u32,
                region.width,
                region.height,
            )
            .to_image())
        })?
    }

    /// Replace a sheet's bitmap.
    ///
    /// Memory is updated immediately; the backend only sees the bitmap at
    /// the next write-back.
    pub fn store(&self, id: SheetId, bitmap: RgbaImage) -> WriteBack {
        let slot = self.slot(&id);
        let mut guard = slot.lock();
        match guard.as_mut() {
            Some(sheet) => {
                sheet.bitmap = bitmap;
                self.record_mutation(&id, sheet)
            }
            None => {
                let mut sheet = Sheet {
                    bitmap,
                    revision: 0,
                    pending: 0,
                };
                let write_back = self.record_mutation(&id, &mut sheet);
                *guard = Some(sheet);
                write_back
            }
        }
    }

    /// Copy `image` into `region` of a sheet, loading the sheet if needed.
    pub fn blit(&self, id: &SheetId, region: Rect, image: &RgbaImage) -> Result<WriteBack, StoreError> {
        let (w, h) = image.dimensions();
        if region.size() != Size::new(w, h) {
            return Err(StoreError::RegionMismatch {
                sheet: *id,
                region,
                bitmap: Size::new(w, h),
            });
        }

        let outcome = self.with_sheet(id, |sheet| {
            let (sw, sh) = sheet.bitmap.dimensions();
            if !region.is_within(Size::new(sw, sh)) {
                return Err(SheetUnavailable::corrupt(
                    *id,
                    format!("region {region} outside {sw}x{sh} bitmap"),
                ));
            }
            imageops::replace(&mut sheet.bitmap, image, region.x, region.y);
            Ok(self.record_mutation(id, sheet))
        })?;
        Ok(outcome?)
    }

    /// Write every in-memory sheet to the backend, regardless of its
    /// mutation count.
    pub fn flush_all(&self) -> FlushReport {
        let slots: Vec<(SheetId, Slot)> = {
            let sheets = self.sheets.lock();
            let mut slots: Vec<_> = sheets.iter().map(|(id, slot)| (*id, Arc::clone(slot))).collect();
            slots.sort_by_key(|(id, _)| *id);
            slots
        };

        let mut report = FlushReport::default();
        for (id, slot) in slots {
            let mut guard = slot.lock();
            let Some(sheet) = guard.as_mut() else {
                continue;
            };
            match self.backend.write(&id, &sheet.bitmap) {
                Ok(()) => {
                    sheet.pending = 0;
                    report.persisted.push((id, sheet.revision));
                }
                Err(e) => {
                    tracing::warn!(sheet = %id, error = %e, "Sheet flush failed");
                    report.failed.push((id, e));
                }
            }
        }

        tracing::info!(
            written = report.persisted.len(),
            failed = report.failed.len(),
            "Flushed sheets"
        );
        report
    }

    /// Delete persisted sheets that `keep` rejects and that are not held in
    /// memory. Returns the deleted ids.
    pub fn sweep(&self, keep: impl Fn(&SheetId) -> bool) -> Result<Vec<SheetId>, BackendError> {
        let mut removed = Vec::new();
        for id in self.backend.list()? {
            if keep(&id) || self.sheets.lock().contains_key(&id) {
                continue;
            }
            self.backend.remove(&id)?;
            tracing::info!(sheet = %id, "Deleted unreferenced sheet");
            removed.push(id);
        }
        Ok(removed)
    }

    /// Drop a sheet from memory and delete its persisted bitmap.
    pub fn evict(&self, id: &SheetId) {
        self.sheets.lock().remove(id);
        if let Err(e) = self.backend.remove(id) {
            tracing::warn!(sheet = %id, error = %e, "Failed to delete condemned sheet");
        }
    }

    /// Whether the sheet is held in memory.
    pub fn is_resident(&self, id: &SheetId) -> bool {
        let slot = self.sheets.lock().get(id).cloned();
        slot.is_some_and(|slot| slot.lock().is_some())
    }

    /// Number of sheets held in memory.
    pub fn resident_count(&self) -> usize {
        let slots: Vec<Slot> = self.sheets.lock().values().cloned().collect();
        slots.iter().filter(|slot| slot.lock().is_some()).count()
    }

    /// Mutations a sheet has collected since its last write-back.
    pub fn pending_mutations(&self, id: &SheetId) -> Option<u32> {
        let slot = self.sheets.lock().get(id).cloned()?;
        let guard = slot.lock();
        guard.as_ref().map(|sheet| sheet.pending)
    }
}

impl<B> fmt::Debug for AtlasStore<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtlasStore")
            .field("flush_threshold", &self.flush_threshold)
            .field("sheets", &self.sheets.lock().len())
            .finish()
    }
}
