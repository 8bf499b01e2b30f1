//! Persisted thumbnail index.
//!
//! Maps `(source key, requested size)` to the sheet region holding the
//! thumbnail, plus a table of sheet dimensions. It is the source of truth
//! for "has this thumbnail been placed already".
//!
//! ## On-disk document
//!
//! ```text
//! {
//!   "version": 1,
//!   "saved_at_unix_ms": 1760659200000,
//!   "sheet_sizes": { "<sheet-id>": [2048, 2048] },
//!   "thumbnails": {
//!     "<w>x<h>": { "<source key text>": { "sheet_id": "<sheet-id>", "region": [x, y, w, h] } }
//!   }
//! }
//! ```
//!
//! ## Durability
//!
//! Entries remember the sheet revision their pixels were written at.
//! [`AtlasIndex::persist`] only writes entries whose sheet has been saved at
//! or after that revision, so a persisted index never points at pixels that
//! never reached disk.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::canonical::canonical_hash_hex;
use crate::types::{ParseSizeError, Rect, SheetId, Size, ThumbKey};

/// Current index document version.
pub const INDEX_SCHEMA_VERSION: u32 = 1;

/// Errors from index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// An entry already exists for this thumbnail.
    #[error("index already holds an entry for {0}")]
    DuplicateEntry(ThumbKey),

    /// Reading or writing the index file failed.
    #[error("index I/O failed: {0}")]
    Io(#[from] io::Error),

    /// The index document is not valid JSON of the expected shape.
    #[error("index document is malformed: {0}")]
    Json(#[from] serde_json::Error),

    /// A size key in the document is not `<w>x<h>`.
    #[error(transparent)]
    InvalidSize(#[from] ParseSizeError),

    /// A sheet id in the document is not a UUID.
    #[error("invalid sheet id '{0}'")]
    InvalidSheetId(String),

    /// The document was written by an incompatible version.
    #[error("unsupported index version {0}")]
    UnsupportedVersion(u32),
}

/// Where a thumbnail lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Sheet holding the thumbnail.
    #[serde(rename = "sheet_id")]
    pub sheet: SheetId,
    /// Region of the sheet holding the thumbnail.
    pub region: Rect,
}

#[derive(Debug, Clone, Copy)]
struct Record {
    entry: IndexEntry,
    /// Sheet revision that contains the thumbnail's pixels; 0 when they
    /// are known to be on disk already.
    revision: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexDocument {
    version: u32,
    #[serde(default)]
    saved_at_unix_ms: i64,
    #[serde(default)]
    sheet_sizes: BTreeMap<String, Size>,
    #[serde(default)]
    thumbnails: BTreeMap<String, BTreeMap<String, IndexEntry>>,
}

/// The persisted `(key, size) → (sheet, region)` mapping.
#[derive(Debug, Default)]
pub struct AtlasIndex {
    path: Option<PathBuf>,
    entries: BTreeMap<Size, BTreeMap<String, Record>>,
    sheet_sizes: BTreeMap<SheetId, Size>,
    persisted_revisions: HashMap<SheetId, u64>,
    inserts_since_save: u32,
    /// Bumped by every [`snapshot`](AtlasIndex::snapshot).
    generation: u64,
}

/// A serialized index document, written outside the lock that guards the
/// index.
#[derive(Debug)]
pub struct IndexSnapshot {
    path: PathBuf,
    generation: u64,
    bytes: Vec<u8>,
    entries: usize,
}

impl IndexSnapshot {
    /// Position of this snapshot among those taken from the same index.
    /// Later snapshots supersede earlier ones.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Write the document to a temporary file renamed over the index, so a
    /// crash leaves either the old or the new index.
    pub fn write(self) -> Result<(), IndexError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &self.bytes)?;
        fs::rename(&tmp, &self.path)?;
        tracing::info!(
            path = %self.path.display(),
            generation = self.generation,
            entries = self.entries,
            "Saved index"
        );
        Ok(())
    }
}

impl AtlasIndex {
    /// Create an index that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open the index stored at `path`. A missing file yields an empty index.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, IndexError> {
        let path = path.into();
        let mut index = Self {
            path: Some(path.clone()),
            ..Self::default()
        };

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No index file, starting empty");
                return Ok(index);
            }
            Err(e) => return Err(e.into()),
        };

        let document: IndexDocument = serde_json::from_slice(&bytes)?;
        index.load_document(document)?;
        tracing::info!(
            path = %path.display(),
            entries = index.len(),
            sheets = index.sheet_sizes.len(),
            "Loaded index"
        );
        Ok(index)
    }

    /// Open the index at `path`, setting an unreadable document aside as
    /// `<path>.corrupt` and starting empty instead of failing.
    pub fn open_or_reset(path: impl Into<PathBuf>) -> Result<Self, IndexError> {
        let path = path.into();
        match Self::open(&path) {
            Ok(index) => Ok(index),
            Err(IndexError::Io(e)) => Err(IndexError::Io(e)),
            Err(e) => {
                let aside = path.with_extension("json.corrupt");
                tracing::error!(
                    path = %path.display(),
                    error = %e,
                    moved_to = %aside.display(),
                    "Index is unreadable; discarding all placements"
                );
                fs::rename(&path, &aside)?;
                Ok(Self {
                    path: Some(path),
                    ..Self::default()
                })
            }
        }
    }

    fn load_document(&mut self, document: IndexDocument) -> Result<(), IndexError> {
        if document.version != INDEX_SCHEMA_VERSION {
            return Err(IndexError::UnsupportedVersion(document.version));
        }

        for (id, size) in document.sheet_sizes {
            let id = SheetId::parse(&id).map_err(|_| IndexError::InvalidSheetId(id.clone()))?;
            self.sheet_sizes.insert(id, size);
        }

        for (size_key, thumbs) in document.thumbnails {
            let size: Size = size_key.parse()?;
            for (key, entry) in thumbs {
                if !self.sheet_sizes.contains_key(&entry.sheet) {
                    tracing::warn!(
                        key = %key,
                        size = %size,
                        sheet = %entry.sheet,
                        "Dropping index entry for a sheet with no recorded size"
                    );
                    continue;
                }
                self.entries
                    .entry(size)
                    .or_default()
                    .insert(key, Record { entry, revision: 0 });
            }
        }
        Ok(())
    }

    /// File the index persists to, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Look up a thumbnail.
    pub fn lookup(&self, key: &ThumbKey) -> Option<IndexEntry> {
        self.entries
            .get(&key.size)
            .and_then(|thumbs| thumbs.get(&key.key))
            .map(|record| record.entry)
    }

    /// Record a thumbnail whose pixels are already persisted.
    pub fn insert(&mut self, key: ThumbKey, sheet: SheetId, region: Rect) -> Result<(), IndexError> {
        self.insert_at_revision(key, sheet, region, 0)
    }

    /// Record a thumbnail whose pixels reach disk once `sheet` is saved at
    /// `revision` or later.
    ///
    /// Fails with [`IndexError::DuplicateEntry`] if the thumbnail is
    /// already recorded; the existing entry is left untouched.
    pub fn insert_at_revision(
        &mut self,
        key: ThumbKey,
        sheet: SheetId,
        region: Rect,
        revision: u64,
    ) -> Result<(), IndexError> {
        let thumbs = self.entries.entry(key.size).or_default();
        if thumbs.contains_key(&key.key) {
            return Err(IndexError::DuplicateEntry(key));
        }
        thumbs.insert(
            key.key,
            Record {
                entry: IndexEntry { sheet, region },
                revision,
            },
        );
        self.inserts_since_save += 1;
        Ok(())
    }

    /// Record a sheet's dimensions.
    pub fn register_sheet(&mut self, sheet: SheetId, size: Size) {
        self.sheet_sizes.insert(sheet, size);
    }

    /// Dimensions of a recorded sheet.
    pub fn sheet_size(&self, sheet: &SheetId) -> Option<Size> {
        self.sheet_sizes.get(sheet).copied()
    }

    /// Recorded sheets and their dimensions, ordered by id.
    pub fn sheets(&self) -> impl Iterator<Item = (SheetId, Size)> + '_ {
        self.sheet_sizes.iter().map(|(id, size)| (*id, *size))
    }

    /// Note that `sheet` has been saved at `revision`.
    pub fn mark_persisted(&mut self, sheet: SheetId, revision: u64) {
        let saved = self.persisted_revisions.entry(sheet).or_insert(0);
        *saved = (*saved).max(revision);
    }

    fn is_durable(&self, record: &Record) -> bool {
        record.revision == 0
            || self
                .persisted_revisions
                .get(&record.entry.sheet)
                .is_some_and(|saved| *saved >= record.revision)
    }

    /// Remove one entry.
    pub fn remove(&mut self, key: &ThumbKey) -> Option<IndexEntry> {
        let thumbs = self.entries.get_mut(&key.size)?;
        let record = thumbs.remove(&key.key)?;
        if thumbs.is_empty() {
            self.entries.remove(&key.size);
        }
        Some(record.entry)
    }

    /// Remove every entry on `sheet`, and the sheet itself. Returns the
    /// number of entries removed.
    pub fn remove_by_sheet(&mut self, sheet: &SheetId) -> usize {
        let mut removed = 0;
        for thumbs in self.entries.values_mut() {
            let before = thumbs.len();
            thumbs.retain(|_, record| record.entry.sheet != *sheet);
            removed += before - thumbs.len();
        }
        self.entries.retain(|_, thumbs| !thumbs.is_empty());
        self.sheet_sizes.remove(sheet);
        self.persisted_revisions.remove(sheet);
        removed
    }

    /// All entries, ordered by size then key.
    pub fn iter(&self) -> impl Iterator<Item = (ThumbKey, IndexEntry)> + '_ {
        self.entries.iter().flat_map(|(size, thumbs)| {
            thumbs.iter().map(move |(key, record)| {
                (
                    ThumbKey {
                        key: key.clone(),
                        size: *size,
                    },
                    record.entry,
                )
            })
        })
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    /// Whether the index has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.values().all(BTreeMap::is_empty)
    }

    /// Number of entries whose pixels are not yet known to be on disk.
    pub fn pending_len(&self) -> usize {
        self.entries
            .values()
            .flat_map(BTreeMap::values)
            .filter(|record| !self.is_durable(record))
            .count()
    }

    /// Inserts since the last [`snapshot`](Self::snapshot).
    pub fn inserts_since_save(&self) -> u32 {
        self.inserts_since_save
    }

    fn durable_document(&self) -> IndexDocument {
        let mut thumbnails: BTreeMap<String, BTreeMap<String, IndexEntry>> = BTreeMap::new();
        let mut sheet_sizes = BTreeMap::new();

        for (size, thumbs) in &self.entries {
            for (key, record) in thumbs {
                if !self.is_durable(record) {
                    continue;
                }
                let sheet = record.entry.sheet;
                if let Some(sheet_size) = self.sheet_sizes.get(&sheet) {
                    sheet_sizes.insert(sheet.to_string(), *sheet_size);
                }
                thumbnails
                    .entry(size.to_string())
                    .or_default()
                    .insert(key.clone(), record.entry);
            }
        }

        IndexDocument {
            version: INDEX_SCHEMA_VERSION,
            saved_at_unix_ms: chrono::Utc::now().timestamp_millis(),
            sheet_sizes,
            thumbnails,
        }
    }

    /// Serialize the durable part of the index and reset the insert
    /// counter. In-memory indexes have nothing to write and return `None`.
    pub fn snapshot(&mut self) -> Result<Option<IndexSnapshot>, IndexError> {
        self.inserts_since_save = 0;
        let Some(path) = self.path.clone() else {
            return Ok(None);
        };
        let document = self.durable_document();
        let entries = document.thumbnails.values().map(BTreeMap::len).sum();
        let bytes = serde_json::to_vec_pretty(&document)?;
        self.generation += 1;
        Ok(Some(IndexSnapshot {
            path,
            generation: self.generation,
            bytes,
            entries,
        }))
    }

    /// Write the durable part of the index to its file.
    pub fn persist(&mut self) -> Result<(), IndexError> {
        match self.snapshot()? {
            Some(snapshot) => snapshot.write(),
            None => Ok(()),
        }
    }

    /// Hash of every lookup the index answers and the sheet table.
    ///
    /// Equal fingerprints mean equal lookups; save/load preserves it once
    /// every entry is durable.
    pub fn fingerprint(&self) -> String {
        let entries: Vec<(ThumbKey, IndexEntry)> = self.iter().collect();
        canonical_hash_hex(&(&entries, &self.sheet_sizes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sheet(n: u128) -> SheetId {
        SheetId::new(Uuid::from_u128(n))
    }

    fn key(name: &str) -> ThumbKey {
        ThumbKey::new(name, Size::new(50, 50))
    }

    fn scratch_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("thumbnail-atlas-index-{}", Uuid::new_v4()))
            .join("index.json")
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut index = AtlasIndex::in_memory();
        index.register_sheet(sheet(1), Size::new(100, 100));
        index.insert(key("a"), sheet(1), Rect::new(0, 0, 50, 37)).unwrap();

        let entry = index.lookup(&key("a")).unwrap();
        assert_eq!(entry.sheet, sheet(1));
        assert_eq!(entry.region, Rect::new(0, 0, 50, 37));
        assert!(index.lookup(&key("b")).is_none());
        assert!(index.lookup(&ThumbKey::new("a", Size::new(64, 64))).is_none());
    }

    #[test]
    fn test_duplicate_entry_rejected() {
        let mut index = AtlasIndex::in_memory();
        index.insert(key("a"), sheet(1), Rect::new(0, 0, 50, 37)).unwrap();
        let err = index.insert(key("a"), sheet(2), Rect::new(0, 0, 1, 1)).unwrap_err();
        assert!(matches!(err, IndexError::DuplicateEntry(k) if k == key("a")));
        assert_eq!(index.lookup(&key("a")).unwrap().sheet, sheet(1));
    }

    #[test]
    fn test_remove_by_sheet() {
        let mut index = AtlasIndex::in_memory();
        index.register_sheet(sheet(1), Size::new(100, 100));
        index.register_sheet(sheet(2), Size::new(100, 100));
        index.insert(key("a"), sheet(1), Rect::new(0, 0, 50, 37)).unwrap();
        index.insert(key("b"), sheet(1), Rect::new(50, 0, 50, 37)).unwrap();
        index
            .insert(ThumbKey::new("a", Size::new(20, 20)), sheet(1), Rect::new(0, 37, 20, 15))
            .unwrap();
        index.insert(key("c"), sheet(2), Rect::new(0, 0, 50, 37)).unwrap();

        assert_eq!(index.remove_by_sheet(&sheet(1)), 3);
        assert_eq!(index.len(), 1);
        assert!(index.lookup(&key("a")).is_none());
        assert!(index.lookup(&key("c")).is_some());
        assert!(index.sheet_size(&sheet(1)).is_none());
    }

    #[test]
    fn test_remove_single_entry() {
        let mut index = AtlasIndex::in_memory();
        index.register_sheet(sheet(1), Size::new(100, 100));
        index.insert(key("a"), sheet(1), Rect::new(0, 0, 50, 37)).unwrap();
        index.insert(key("b"), sheet(1), Rect::new(50, 0, 50, 37)).unwrap();

        assert_eq!(index.remove(&key("a")).unwrap().region, Rect::new(0, 0, 50, 37));
        assert!(index.remove(&key("a")).is_none());
        assert!(index.lookup(&key("b")).is_some());
        assert_eq!(index.sheet_size(&sheet(1)), Some(Size::new(100, 100)));
    }

    #[test]
    fn test_later_snapshot_supersedes_earlier() {
        let path = scratch_path();
        let mut index = AtlasIndex::open(&path).unwrap();
        index.register_sheet(sheet(1), Size::new(100, 100));
        index.insert(key("a"), sheet(1), Rect::new(0, 0, 50, 37)).unwrap();
        let first = index.snapshot().unwrap().unwrap();
        index.insert(key("b"), sheet(1), Rect::new(50, 0, 50, 37)).unwrap();
        let second = index.snapshot().unwrap().unwrap();
        assert!(second.generation() > first.generation());
        assert_eq!(index.inserts_since_save(), 0);

        second.write().unwrap();
        assert_eq!(AtlasIndex::open(&path).unwrap().len(), 2);
        assert!(AtlasIndex::in_memory().snapshot().unwrap().is_none());

        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_persist_round_trip() {
        let path = scratch_path();
        let mut index = AtlasIndex::open(&path).unwrap();
        assert!(index.is_empty());

        index.register_sheet(sheet(1), Size::new(100, 100));
        index.insert(key("photos/a.jpg"), sheet(1), Rect::new(0, 0, 50, 37)).unwrap();
        index.insert(key("weird \"key\"\n"), sheet(1), Rect::new(50, 0, 50, 37)).unwrap();
        index.persist().unwrap();
        assert_eq!(index.inserts_since_save(), 0);

        let reopened = AtlasIndex::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.fingerprint(), index.fingerprint());
        assert_eq!(reopened.lookup(&key("weird \"key\"\n")), index.lookup(&key("weird \"key\"\n")));

        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_document_shape() {
        let path = scratch_path();
        let mut index = AtlasIndex::open(&path).unwrap();
        index.register_sheet(sheet(1), Size::new(100, 100));
        index.insert(key("a"), sheet(1), Rect::new(50, 0, 50, 37)).unwrap();
        index.persist().unwrap();

        let doc: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        let id = sheet(1).to_string();
        assert_eq!(doc["version"], 1);
        assert_eq!(doc["sheet_sizes"][&id], serde_json::json!([100, 100]));
        assert_eq!(doc["thumbnails"]["50x50"]["a"]["sheet_id"], serde_json::json!(id));
        assert_eq!(doc["thumbnails"]["50x50"]["a"]["region"], serde_json::json!([50, 0, 50, 37]));

        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_pending_entries_wait_for_sheet_save() {
        let path = scratch_path();
        let mut index = AtlasIndex::open(&path).unwrap();
        index.register_sheet(sheet(1), Size::new(100, 100));
        index.insert_at_revision(key("a"), sheet(1), Rect::new(0, 0, 50, 37), 1).unwrap();
        index.insert_at_revision(key("b"), sheet(1), Rect::new(50, 0, 50, 37), 2).unwrap();
        assert_eq!(index.pending_len(), 2);

        index.mark_persisted(sheet(1), 1);
        assert_eq!(index.pending_len(), 1);
        index.persist().unwrap();

        let reopened = AtlasIndex::open(&path).unwrap();
        assert!(reopened.lookup(&key("a")).is_some());
        assert!(reopened.lookup(&key("b")).is_none());

        index.mark_persisted(sheet(1), 2);
        index.persist().unwrap();
        assert_eq!(AtlasIndex::open(&path).unwrap().len(), 2);

        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_rejects_bad_documents() {
        let path = scratch_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();

        fs::write(&path, r#"{"version": 9}"#).unwrap();
        assert!(matches!(AtlasIndex::open(&path), Err(IndexError::UnsupportedVersion(9))));

        fs::write(&path, r#"{"version": 1, "thumbnails": {"big": {}}}"#).unwrap();
        assert!(matches!(AtlasIndex::open(&path), Err(IndexError::InvalidSize(_))));

        fs::write(&path, r#"{"version": 1, "sheet_sizes": {"nope": [1, 1]}}"#).unwrap();
        assert!(matches!(AtlasIndex::open(&path), Err(IndexError::InvalidSheetId(_))));

        fs::write(&path, "{ truncated").unwrap();
        assert!(matches!(AtlasIndex::open(&path), Err(IndexError::Json(_))));

        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_open_or_reset_sets_corrupt_file_aside() {
        let path = scratch_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{ truncated").unwrap();

        let index = AtlasIndex::open_or_reset(&path).unwrap();
        assert!(index.is_empty());
        assert!(!path.exists());
        assert!(path.with_extension("json.corrupt").exists());

        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_entries_without_sheet_size_dropped_on_load() {
        let path = scratch_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let doc = serde_json::json!({
            "version": 1,
            "sheet_sizes": {},
            "thumbnails": {
                "50x50": { "a": { "sheet_id": sheet(1).to_string(), "region": [0, 0, 50, 37] } }
            }
        });
        fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        let index = AtlasIndex::open(&path).unwrap();
        assert!(index.is_empty());

        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }
}
