//! Thumbnail cache orchestrator.
//!
//! [`ThumbnailCache`] is the public surface: given a source key, a
//! requested size and an [`ImageSource`], it returns the thumbnail,
//! generating and packing it on first request and cropping it out of its
//! sheet afterwards.
//!
//! ## Request flow
//!
//! 1. Hot cache hit → return.
//! 2. Take the per-thumbnail in-flight lock; concurrent requests for the
//!    same `(key, size)` wait here and are then served by the first one.
//! 3. Index hit → crop the region from its sheet.
//! 4. Miss → decode the source (no shared lock held), fit and scale it,
//!    place it, blit it, record it in the index.
//!
//! An unavailable sheet met in step 3 or 4 is condemned and the request
//! retried. Each sheet is condemned at most once per request; a condemned
//! sheet or a sheet the request opened itself failing again is
//! [`AtlasError::PersistentCacheCorruption`].
//!
//! ## Locking
//!
//! | Lock          | Guards                               | Held across decode? |
//! |---------------|--------------------------------------|---------------------|
//! | in-flight     | one `(key, size)`                    | yes                 |
//! | catalog       | packer + index                       | no                  |
//! | sheet (store) | one sheet bitmap                     | no                  |
//! | gate (shared) | a placement through its index insert | no                  |
//! | index writer  | the index file                       | no                  |
//!
//! Index documents are serialized under the catalog lock and written under
//! the index writer lock only, so index hits never wait on file I/O.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use image::{imageops, RgbaImage};
use parking_lot::Mutex;

use crate::config::AtlasConfig;
use crate::error::AtlasError;
use crate::hot_cache::{CacheStats, HotCache};
use crate::index::{AtlasIndex, IndexEntry, IndexError, IndexSnapshot};
use crate::packer::RectPacker;
use crate::shutdown::ShutdownGate;
use crate::source::ImageSource;
use crate::store::{AtlasStore, FsSheetBackend, SheetBackend, SheetUnavailable, StoreError};
use crate::types::{Rect, SheetId, Size, SourceKey, ThumbKey};

/// Placement bookkeeping that must change together.
#[derive(Debug)]
struct Catalog {
    index: AtlasIndex,
    packer: RectPacker,
}

/// Sheets condemned while serving one request.
#[derive(Debug, Default)]
struct RecoveryBudget {
    condemned: BTreeSet<SheetId>,
    opened: Option<SheetId>,
}

impl RecoveryBudget {
    /// Allow condemning `sheet`, unless this request already condemned it
    /// or opened it.
    fn admit(&mut self, sheet: SheetId) -> Result<(), AtlasError> {
        if self.opened == Some(sheet) || !self.condemned.insert(sheet) {
            return Err(AtlasError::PersistentCacheCorruption { sheet });
        }
        Ok(())
    }
}

/// Snapshot of cache occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtlasStats {
    /// Sheets known to the packer.
    pub sheets: usize,
    /// Sheets whose bitmap is held in memory.
    pub resident_sheets: usize,
    /// Thumbnails recorded in the index.
    pub entries: usize,
    /// Entries whose pixels are not yet known to be on disk.
    pub pending_entries: usize,
    /// Hot cache occupancy, `None` when disabled.
    pub hot_cache: Option<CacheStats>,
}

/// Outcome of [`ThumbnailCache::warm`].
#[derive(Debug, Default)]
pub struct WarmReport {
    /// Thumbnails generated by this run.
    pub generated: usize,
    /// Thumbnails that were already cached.
    pub hits: usize,
    /// Keys that failed, with the reason.
    pub failed: Vec<(String, AtlasError)>,
}

/// Thumbnail atlas manager.
///
/// Safe to share between threads. Dropping the cache shuts it down,
/// flushing sheets and index.
pub struct ThumbnailCache<B: SheetBackend = FsSheetBackend> {
    config: AtlasConfig,
    store: AtlasStore<B>,
    catalog: Mutex<Catalog>,
    hot: HotCache,
    in_flight: Mutex<HashMap<ThumbKey, Arc<Mutex<()>>>>,
    /// Generation of the last index snapshot written.
    index_writer: Mutex<u64>,
    gate: ShutdownGate,
}

impl ThumbnailCache<FsSheetBackend> {
    /// Open the cache stored under `config.root`, creating it if needed.
    pub fn open(config: AtlasConfig) -> Result<Self, AtlasError> {
        let backend = FsSheetBackend::new(config.sheet_dir())?;
        Self::with_backend(config, backend)
    }
}

impl<B: SheetBackend> ThumbnailCache<B> {
    /// Open the cache with a custom sheet backend. The index still lives at
    /// `config.index_path()`.
    ///
    /// An unreadable index is set aside and the cache starts empty.
    /// Persisted sheets the index does not reference are deleted.
    pub fn with_backend(config: AtlasConfig, backend: B) -> Result<Self, AtlasError> {
        let index = AtlasIndex::open_or_reset(config.index_path())?;
        let cache = Self::from_parts(config, backend, index);
        cache.sweep_unreferenced_sheets();
        Ok(cache)
    }

    /// Assemble a cache from an already opened index.
    ///
    /// Entries whose region overlaps an earlier entry or leaves its sheet
    /// are dropped from the index.
    pub fn from_parts(config: AtlasConfig, backend: B, mut index: AtlasIndex) -> Self {
        let (packer, rejected) = rebuild_packer(&index, config.sheet_size);
        if !rejected.is_empty() {
            for key in &rejected {
                index.remove(key);
            }
            if let Err(e) = index.persist() {
                tracing::warn!(error = %e, "Index save after dropping bad entries failed");
            }
        }
        tracing::info!(
            root = %config.root.display(),
            sheet_size = %config.sheet_size,
            sheets = packer.sheet_count(),
            entries = index.len(),
            "Opened thumbnail cache"
        );
        Self {
            store: AtlasStore::new(backend, config.sheet_flush_threshold),
            hot: HotCache::new(&config.hot_cache),
            catalog: Mutex::new(Catalog { index, packer }),
            in_flight: Mutex::new(HashMap::new()),
            index_writer: Mutex::new(0),
            gate: ShutdownGate::default(),
            config,
        }
    }

    fn sweep_unreferenced_sheets(&self) {
        let catalog = self.catalog.lock();
        match self.store.sweep(|id| catalog.index.sheet_size(id).is_some()) {
            Ok(removed) if !removed.is_empty() => {
                tracing::info!(removed = removed.len(), "Deleted sheets the index does not reference");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Sweeping unreferenced sheets failed"),
        }
    }

    /// Write a snapshot unless a later one has been written already.
    fn write_index(&self, snapshot: Option<IndexSnapshot>) -> Result<(), IndexError> {
        let Some(snapshot) = snapshot else {
            return Ok(());
        };
        let mut written = self.index_writer.lock();
        if snapshot.generation() <= *written {
            tracing::debug!(generation = snapshot.generation(), "Skipping superseded index snapshot");
            return Ok(());
        }
        let generation = snapshot.generation();
        snapshot.write()?;
        *written = generation;
        Ok(())
    }

    /// The configuration the cache was opened with.
    pub fn config(&self) -> &AtlasConfig {
        &self.config
    }

    /// The sheet store.
    pub fn store(&self) -> &AtlasStore<B> {
        &self.store
    }

    /// Return the thumbnail of `key` fitted inside `size`.
    ///
    /// After shutdown, thumbnails already in the index are still served;
    /// anything that would need a new placement fails with
    /// [`AtlasError::ShuttingDown`].
    pub fn get_thumbnail<S: ImageSource>(
        &self,
        key: &S::Key,
        size: Size,
        source: &S,
    ) -> Result<Arc<RgbaImage>, AtlasError> {
        let thumb = ThumbKey::new(key, size);
        if let Some(hit) = self.hot.get(&thumb) {
            tracing::trace!(key = %thumb, "Hot cache hit");
            return Ok(hit);
        }
        if size.is_empty() {
            return Err(AtlasError::EmptyThumbnail(size));
        }

        let lock = self.key_lock(&thumb);
        let result = {
            let _in_flight = lock.lock();
            self.resolve(&thumb, key, source)
        };
        self.release_key_lock(&thumb, lock);
        result
    }

    fn key_lock(&self, thumb: &ThumbKey) -> Arc<Mutex<()>> {
        Arc::clone(self.in_flight.lock().entry(thumb.clone()).or_default())
    }

    fn release_key_lock(&self, thumb: &ThumbKey, lock: Arc<Mutex<()>>) {
        let mut in_flight = self.in_flight.lock();
        // Clones are only taken under this lock: two owners means the
        // table's and ours, so nobody is waiting.
        if Arc::strong_count(&lock) == 2 {
            in_flight.remove(thumb);
        }
    }

    fn resolve<S: ImageSource>(
        &self,
        thumb: &ThumbKey,
        key: &S::Key,
        source: &S,
    ) -> Result<Arc<RgbaImage>, AtlasError> {
        // A request we waited on may have produced it.
        if let Some(hit) = self.hot.get(thumb) {
            return Ok(hit);
        }

        let mut budget = RecoveryBudget::default();
        loop {
            let outcome = match self.lookup_entry(thumb) {
                Some(entry) => self.crop_entry(thumb, entry),
                None => self.generate(thumb, key, source, &mut budget),
            };

            let unavailable = match outcome {
                Err(AtlasError::Store(StoreError::Unavailable(unavailable))) => unavailable,
                other => return other,
            };
            if let Err(e) = budget.admit(unavailable.sheet) {
                tracing::error!(
                    key = %thumb,
                    sheet = %unavailable.sheet,
                    reason = %unavailable.reason,
                    "Sheet unavailable again after recovery"
                );
                return Err(e);
            }
            self.recover(&unavailable)?;
        }
    }

    fn lookup_entry(&self, thumb: &ThumbKey) -> Option<IndexEntry> {
        self.catalog.lock().index.lookup(thumb)
    }

    fn crop_entry(&self, thumb: &ThumbKey, entry: IndexEntry) -> Result<Arc<RgbaImage>, AtlasError> {
        let bitmap = Arc::new(
            self.store
                .crop(&entry.sheet, entry.region)
                .map_err(StoreError::from)?,
        );
        tracing::debug!(key = %thumb, sheet = %entry.sheet, region = %entry.region, "Index hit");
        self.hot.put(thumb.clone(), entry.sheet, Arc::clone(&bitmap));
        Ok(bitmap)
    }

    fn generate<S: ImageSource>(
        &self,
        thumb: &ThumbKey,
        key: &S::Key,
        source: &S,
        budget: &mut RecoveryBudget,
    ) -> Result<Arc<RgbaImage>, AtlasError> {
        // The fit keeps one side equal to the box, so a box exceeding the
        // sheet both ways never fits.
        let sheet_size = self.config.sheet_size;
        if thumb.size.width > sheet_size.width && thumb.size.height > sheet_size.height {
            return Err(AtlasError::OversizedThumbnail {
                requested: thumb.size,
                sheet: sheet_size,
            });
        }

        let original = source
            .decode(key)
            .map_err(|e| AtlasError::decode(thumb.key.clone(), e))?
            .into_rgba8();
        let (w, h) = original.dimensions();
        let fitted = Size::new(w, h).fit_within(thumb.size);
        if fitted.is_empty() {
            return Err(AtlasError::EmptyThumbnail(Size::new(w, h)));
        }
        let scaled = if fitted == Size::new(w, h) {
            original
        } else {
            imageops::resize(&original, fitted.width, fitted.height, self.config.filter)
        };

        let _entered = self.gate.enter()?;
        let placement = {
            let mut catalog = self.catalog.lock();
            let placement = catalog.packer.place(fitted)?;
            if placement.new_sheet {
                let sheet_size = catalog.packer.sheet_size();
                catalog.index.register_sheet(placement.sheet, sheet_size);
                self.store.create(placement.sheet, sheet_size);
                budget.opened = Some(placement.sheet);
                tracing::info!(sheet = %placement.sheet, size = %sheet_size, "Opened new sheet");
            }
            placement
        };
        tracing::debug!(
            key = %thumb,
            fitted = %fitted,
            sheet = %placement.sheet,
            region = %placement.rect,
            "Placed thumbnail"
        );

        let write_back = self.store.blit(&placement.sheet, placement.rect, &scaled)?;

        let snapshot = {
            let mut catalog = self.catalog.lock();
            if !catalog.packer.has_sheet(&placement.sheet) {
                // Condemned while we were blitting.
                return Err(StoreError::from(SheetUnavailable::missing(placement.sheet)).into());
            }
            if let Err(e) = catalog.index.insert_at_revision(
                thumb.clone(),
                placement.sheet,
                placement.rect,
                write_back.revision,
            ) {
                tracing::error!(key = %thumb, error = %e, "Thumbnail placed twice");
                return Err(e.into());
            }
            if let Some(revision) = write_back.persisted {
                catalog.index.mark_persisted(placement.sheet, revision);
            }
            if catalog.index.inserts_since_save() >= self.config.index_save_interval.max(1) {
                catalog.index.snapshot().unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "Index serialization failed");
                    None
                })
            } else {
                None
            }
        };
        if let Err(e) = self.write_index(snapshot) {
            tracing::warn!(error = %e, "Index save failed; the next save covers it");
        }

        let bitmap = Arc::new(scaled);
        self.hot.put(thumb.clone(), placement.sheet, Arc::clone(&bitmap));
        Ok(bitmap)
    }

    /// Condemn an unavailable sheet: drop its entries, its occupancy and
    /// its file, then save the index.
    fn recover(&self, unavailable: &SheetUnavailable) -> Result<(), AtlasError> {
        let _entered = self.gate.enter()?;
        let sheet = unavailable.sheet;
        let snapshot = {
            let mut catalog = self.catalog.lock();
            let removed = catalog.index.remove_by_sheet(&sheet);
            catalog.packer.discard_sheet(&sheet);
            self.store.evict(&sheet);
            self.hot.invalidate_sheet(&sheet);
            tracing::error!(
                sheet = %sheet,
                reason = %unavailable.reason,
                removed,
                "Condemned sheet; its thumbnails will be regenerated"
            );
            catalog.index.snapshot()?
        };
        if let Err(e) = self.write_index(snapshot) {
            tracing::warn!(error = %e, "Index save after recovery failed; the next save covers it");
        }
        Ok(())
    }

    /// Generate thumbnails for every key `source` lists, in list order.
    ///
    /// Failures are collected rather than aborting the run, except that
    /// shutdown stops it.
    pub fn warm<S: ImageSource>(&self, source: &S, size: Size) -> WarmReport {
        let mut report = WarmReport::default();
        for key in source.list() {
            let cached = self.contains(&key, size);
            match self.get_thumbnail(&key, size, source) {
                Ok(_) if cached => report.hits += 1,
                Ok(_) => report.generated += 1,
                Err(AtlasError::ShuttingDown) => {
                    report.failed.push((key.canonical_text(), AtlasError::ShuttingDown));
                    break;
                }
                Err(e) => {
                    tracing::warn!(key = %key.canonical_text(), error = %e, "Warming failed");
                    report.failed.push((key.canonical_text(), e));
                }
            }
        }
        tracing::info!(
            size = %size,
            generated = report.generated,
            hits = report.hits,
            failed = report.failed.len(),
            "Warmed thumbnails"
        );
        report
    }

    /// Whether the index records a thumbnail for `key` at `size`.
    pub fn contains<K: SourceKey + ?Sized>(&self, key: &K, size: Size) -> bool {
        self.lookup(key, size).is_some()
    }

    /// The index entry for `key` at `size`.
    pub fn lookup<K: SourceKey + ?Sized>(&self, key: &K, size: Size) -> Option<IndexEntry> {
        self.lookup_entry(&ThumbKey::new(key, size))
    }

    /// Write every sheet and the index to disk without shutting down.
    ///
    /// Mutations wait until the checkpoint is done.
    pub fn flush(&self) -> Result<(), AtlasError> {
        let closed = self.gate.barrier();
        if *closed {
            return Err(AtlasError::ShuttingDown);
        }
        self.checkpoint()
    }

    /// Stop accepting new placements, wait for in-flight ones, then write
    /// every sheet and the index. Later calls do nothing.
    pub fn shutdown(&self) -> Result<(), AtlasError> {
        let mut closed = self.gate.barrier();
        if *closed {
            return Ok(());
        }
        *closed = true;
        tracing::info!("Shutting down thumbnail cache");
        self.checkpoint()
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        self.gate.is_closed()
    }

    /// Flush sheets, then save the index with every entry they made durable.
    /// Caller holds the gate exclusively.
    fn checkpoint(&self) -> Result<(), AtlasError> {
        let report = self.store.flush_all();
        let snapshot = {
            let mut catalog = self.catalog.lock();
            for (sheet, revision) in &report.persisted {
                catalog.index.mark_persisted(*sheet, *revision);
            }
            catalog.index.snapshot()?
        };
        self.write_index(snapshot)?;

        match report.failed.into_iter().next() {
            Some((sheet, source)) => Err(StoreError::Backend { sheet, source }.into()),
            None => Ok(()),
        }
    }

    /// Current occupancy.
    pub fn stats(&self) -> AtlasStats {
        let (sheets, entries, pending_entries) = {
            let catalog = self.catalog.lock();
            (
                catalog.packer.sheet_count(),
                catalog.index.len(),
                catalog.index.pending_len(),
            )
        };
        AtlasStats {
            sheets,
            resident_sheets: self.store.resident_count(),
            entries,
            pending_entries,
            hot_cache: self.hot.stats(),
        }
    }

    /// Fingerprint of every lookup the index answers.
    pub fn index_fingerprint(&self) -> String {
        self.catalog.lock().index.fingerprint()
    }

    /// Fingerprint of the packer's sheet layout.
    pub fn layout_fingerprint(&self) -> String {
        self.catalog.lock().packer.layout_fingerprint()
    }

    /// Drop every hot-cached thumbnail.
    pub fn clear_hot_cache(&self) {
        self.hot.clear();
    }
}

impl<B: SheetBackend> Drop for ThumbnailCache<B> {
    fn drop(&mut self) {
        if self.gate.is_closed() {
            return;
        }
        if let Err(e) = self.shutdown() {
            tracing::error!(error = %e, "Shutdown on drop failed");
        }
    }
}

impl<B: SheetBackend> std::fmt::Debug for ThumbnailCache<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThumbnailCache")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("shut_down", &self.gate.is_closed())
            .finish()
    }
}

/// Rebuild packer occupancy from the index: sheets by id, each sheet's
/// regions in coordinate order. Returns the entries whose region could not
/// be occupied.
fn rebuild_packer(index: &AtlasIndex, sheet_size: Size) -> (RectPacker, Vec<ThumbKey>) {
    let mut packer = RectPacker::new(sheet_size);
    for (sheet, size) in index.sheets() {
        packer.add_sheet(sheet, size);
    }

    let mut regions: BTreeMap<SheetId, Vec<(Rect, ThumbKey)>> = BTreeMap::new();
    for (key, entry) in index.iter() {
        regions.entry(entry.sheet).or_default().push((entry.region, key));
    }
    let mut rejected = Vec::new();
    for (sheet, mut rects) in regions {
        rects.sort();
        for (rect, key) in rects {
            if !packer.occupy(sheet, rect) {
                tracing::warn!(
                    key = %key,
                    sheet = %sheet,
                    region = %rect,
                    "Dropping index entry that overlaps another or leaves its sheet"
                );
                rejected.push(key);
            }
        }
    }
    (packer, rejected)
}
