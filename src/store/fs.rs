//! Filesystem sheet backend: one PNG file per sheet.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use image::{ImageError, ImageFormat, RgbaImage};

use crate::types::SheetId;
use super::{BackendError, SheetBackend, SheetUnavailable};

/// Stores each sheet as `<dir>/<sheet-id>.png`.
///
/// Writes go to a temporary file that is renamed over the target, so a
/// process killed mid-write leaves the previous version intact.
#[derive(Debug, Clone)]
pub struct FsSheetBackend {
    dir: PathBuf,
}

impl FsSheetBackend {
    /// Create a backend rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Directory holding the sheet files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a sheet's file.
    pub fn path_of(&self, id: &SheetId) -> PathBuf {
        self.dir.join(id.file_name())
    }
}

impl SheetBackend for FsSheetBackend {
    fn read(&self, id: &SheetId) -> Result<RgbaImage, SheetUnavailable> {
        let path = self.path_of(id);
        match image::open(&path) {
            Ok(img) => Ok(img.into_rgba8()),
            Err(ImageError::IoError(e)) if e.kind() == io::ErrorKind::NotFound => {
                Err(SheetUnavailable::missing(*id))
            }
            Err(e) => Err(SheetUnavailable::corrupt(*id, e.to_string())),
        }
    }

    fn write(&self, id: &SheetId, bitmap: &RgbaImage) -> Result<(), BackendError> {
        let path = self.path_of(id);
        let tmp = path.with_extension("png.tmp");
        bitmap.save_with_format(&tmp, ImageFormat::Png)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, id: &SheetId) -> Result<(), BackendError> {
        match fs::remove_file(self.path_of(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn contains(&self, id: &SheetId) -> bool {
        self.path_of(id).is_file()
    }

    fn list(&self) -> Result<Vec<SheetId>, BackendError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("png") {
                continue;
            }
            let parsed = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| SheetId::parse(stem).ok());
            if let Some(id) = parsed {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Unavailability;
    use image::Rgba;
    use uuid::Uuid;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("thumbnail-atlas-fs-{}", Uuid::new_v4()))
    }

    #[test]
    fn test_round_trip_and_file_name() {
        let dir = scratch_dir();
        let backend = FsSheetBackend::new(&dir).unwrap();
        let id = SheetId::new(Uuid::from_u128(42));
        let mut bitmap = RgbaImage::new(32, 32);
        bitmap.put_pixel(31, 0, Rgba([9, 8, 7, 6]));

        backend.write(&id, &bitmap).unwrap();
        assert!(dir.join("00000000-0000-0000-0000-00000000002a.png").is_file());
        assert!(!dir.join("00000000-0000-0000-0000-00000000002a.png.tmp").exists());
        assert_eq!(backend.read(&id).unwrap(), bitmap);

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_missing_truncated_and_removed() {
        let dir = scratch_dir();
        let backend = FsSheetBackend::new(&dir).unwrap();
        let id = SheetId::random();

        assert_eq!(backend.read(&id).unwrap_err().reason, Unavailability::Missing);

        backend.write(&id, &RgbaImage::new(32, 32)).unwrap();
        let bytes = fs::read(backend.path_of(&id)).unwrap();
        fs::write(backend.path_of(&id), &bytes[..20]).unwrap();
        assert!(matches!(
            backend.read(&id).unwrap_err().reason,
            Unavailability::Corrupt(_)
        ));

        backend.remove(&id).unwrap();
        backend.remove(&id).unwrap();
        assert!(!backend.contains(&id));

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_list_skips_foreign_files() {
        let dir = scratch_dir();
        let backend = FsSheetBackend::new(&dir).unwrap();
        let (a, b) = (SheetId::new(Uuid::from_u128(2)), SheetId::new(Uuid::from_u128(1)));
        backend.write(&a, &RgbaImage::new(2, 2)).unwrap();
        backend.write(&b, &RgbaImage::new(2, 2)).unwrap();
        fs::write(dir.join("notes.png"), b"x").unwrap();
        fs::write(dir.join("readme.txt"), b"x").unwrap();

        assert_eq!(backend.list().unwrap(), vec![b, a]);

        fs::remove_dir_all(dir).unwrap();
    }
}
