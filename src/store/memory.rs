//! In-memory sheet backend for testing.

use std::collections::HashMap;
use std::io::{self, Cursor};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use image::{ImageFormat, RgbaImage};
use parking_lot::RwLock;

use crate::types::SheetId;
use super::{BackendError, SheetBackend, SheetUnavailable};

/// In-memory sheet backend for testing.
///
/// Keeps PNG-encoded bytes, so reads go through the same decode path as
/// files on disk. Offers hooks to corrupt or drop sheets and to make
/// writes fail.
#[derive(Debug, Default)]
pub struct MemorySheetBackend {
    /// Encoded sheets by ID.
    sheets: RwLock<HashMap<SheetId, Vec<u8>>>,
    /// Successful writes so far.
    writes: AtomicUsize,
    /// When set, every write fails.
    failing: AtomicBool,
}

impl MemorySheetBackend {
    /// Create a new empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Truncate a sheet's bytes so it no longer decodes.
    pub fn corrupt(&self, id: &SheetId) {
        if let Some(bytes) = self.sheets.write().get_mut(id) {
            bytes.truncate(20);
        }
    }

    /// Remove a sheet as if its file had been deleted.
    pub fn drop_sheet(&self, id: &SheetId) {
        self.sheets.write().remove(id);
    }

    /// Make subsequent writes fail (or succeed again).
    pub fn fail_writes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of persisted sheets.
    pub fn len(&self) -> usize {
        self.sheets.read().len()
    }

    /// Whether no sheet is persisted.
    pub fn is_empty(&self) -> bool {
        self.sheets.read().is_empty()
    }
}

impl SheetBackend for MemorySheetBackend {
    fn read(&self, id: &SheetId) -> Result<RgbaImage, SheetUnavailable> {
        let sheets = self.sheets.read();
        let bytes = sheets.get(id).ok_or_else(|| SheetUnavailable::missing(*id))?;
        image::load_from_memory_with_format(bytes, ImageFormat::Png)
            .map(|img| img.into_rgba8())
            .map_err(|e| SheetUnavailable::corrupt(*id, e.to_string()))
    }

    fn write(&self, id: &SheetId, bitmap: &RgbaImage) -> Result<(), BackendError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected write failure").into());
        }
        let mut bytes = Vec::new();
        bitmap.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        self.sheets.write().insert(*id, bytes);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, id: &SheetId) -> Result<(), BackendError> {
        self.sheets.write().remove(id);
        Ok(())
    }

    fn contains(&self, id: &SheetId) -> bool {
        self.sheets.read().contains_key(id)
    }

    fn list(&self) -> Result<Vec<SheetId>, BackendError> {
        let mut ids: Vec<SheetId> = self.sheets.read().keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}
