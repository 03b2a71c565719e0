//! The page cache: a bounded set of frames shared by every open page file.
//!
//! Pages are keyed by `(FileId, PageId)`. A [`PageGuard`] pins its frame for
//! as long as it lives, and pinned frames are never evicted. Replacement is
//! least-recently-used among unpinned frames. Before a dirty page reaches
//! disk the journal is flushed up to the page's LSN, and a dirty page that
//! carries no LSN yet is never chosen as a victim.
//!
//! The cache also owns the table of open files. Each [`FileSlot`] holds the
//! file's pager together with its structure latch and corruption flag.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::failpoint;
use crate::page::{FileHeader, Page, HEADER_PAGE_ID};
use crate::pager::Pager;
use crate::wal::Lsn;
use crate::{Error, FileId, PageId, Result};

/// Anything that can make the journal durable up to an LSN.
pub trait WalFlush: Send + Sync {
    fn flush_to(&self, lsn: Lsn) -> Result<()>;
}

#[derive(Debug)]
struct Frame {
    page: RwLock<Page>,
    dirty: AtomicBool,
    pin_count: AtomicU32,
}

impl Frame {
    fn empty() -> Self {
        Self {
            page: RwLock::new(Page::new(0, 0, 0)),
            dirty: AtomicBool::new(false),
            pin_count: AtomicU32::new(0),
        }
    }
}

/// A pinned page. The frame is unpinned when the guard is dropped.
pub struct PageGuard {
    frame: Arc<Frame>,
    file: FileId,
    page_id: PageId,
}

impl PageGuard {
    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.frame.page.read()
    }

    /// Exclusive access to the page. Callers must stamp the page LSN and then
    /// call [`PageCache::mark_dirty`].
    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        self.frame.page.write()
    }

    pub fn file(&self) -> FileId {
        self.file
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        self.frame.pin_count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// An open page file.
pub struct FileSlot {
    id: FileId,
    name: String,
    path: PathBuf,
    page_size: usize,
    pager: Mutex<Pager>,
    latch: RwLock<()>,
    unusable: AtomicBool,
}

impl FileSlot {
    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Structure latch: shared for lookups and scans, exclusive for updates.
    pub fn latch(&self) -> &RwLock<()> {
        &self.latch
    }

    pub fn is_unusable(&self) -> bool {
        self.unusable.load(Ordering::Acquire)
    }

    pub fn mark_unusable(&self) {
        if !self.unusable.swap(true, Ordering::AcqRel) {
            warn!(file = self.id, name = %self.name, "file marked unusable until rebuilt");
        }
    }

    pub(crate) fn clear_unusable(&self) {
        self.unusable.store(false, Ordering::Release);
    }

    pub(crate) fn pager(&self) -> &Mutex<Pager> {
        &self.pager
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub capacity: usize,
    pub resident: usize,
    pub dirty: usize,
    pub pinned: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct Frames {
    lru: LruCache<(FileId, PageId), usize>,
    frames: Vec<Arc<Frame>>,
    free: Vec<usize>,
}

pub struct PageCache {
    capacity: usize,
    files: RwLock<HashMap<FileId, Arc<FileSlot>>>,
    frames: Mutex<Frames>,
    wal: RwLock<Option<Arc<dyn WalFlush>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl PageCache {
    /// Smallest useful capacity: a B-tree split pins a handful of pages at once.
    pub const MIN_CAPACITY: usize = 16;

    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(Self::MIN_CAPACITY);
        Self {
            capacity,
            files: RwLock::new(HashMap::new()),
            frames: Mutex::new(Frames {
                lru: LruCache::unbounded(),
                frames: Vec::new(),
                free: Vec::new(),
            }),
            wal: RwLock::new(None),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn with_wal(capacity: usize, wal: Arc<dyn WalFlush>) -> Self {
        let cache = Self::new(capacity);
        cache.set_wal(wal);
        cache
    }

    pub fn set_wal(&self, wal: Arc<dyn WalFlush>) {
        *self.wal.write() = Some(wal);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // --- file table ---

    /// Adds an open pager to the file table under its persisted file id.
    pub fn register_file(&self, pager: Pager, name: &str) -> Result<Arc<FileSlot>> {
        let id = pager.file_id();
        let mut files = self.files.write();
        if let Some(existing) = files.get(&id) {
            return Err(Error::InvalidState(format!(
                "file id {id} of {:?} already used by {}",
                pager.path(),
                existing.name
            )));
        }
        let slot = Arc::new(FileSlot {
            id,
            name: name.to_string(),
            path: pager.path().to_path_buf(),
            page_size: pager.page_size(),
            pager: Mutex::new(pager),
            latch: RwLock::new(()),
            unusable: AtomicBool::new(false),
        });
        files.insert(id, Arc::clone(&slot));
        info!(file = id, name, "registered page file");
        Ok(slot)
    }

    /// Writes back and forgets every page of `file`, then closes it.
    pub fn unregister_file(&self, file: FileId) -> Result<()> {
        self.sync(file)?;
        self.discard(file)?;
        self.files.write().remove(&file);
        debug!(file, "unregistered page file");
        Ok(())
    }

    pub fn file(&self, file: FileId) -> Result<Arc<FileSlot>> {
        self.files
            .read()
            .get(&file)
            .cloned()
            .ok_or(Error::UnknownFile(file))
    }

    pub fn file_by_name(&self, name: &str) -> Option<Arc<FileSlot>> {
        self.files.read().values().find(|s| s.name == name).cloned()
    }

    pub fn files(&self) -> Vec<Arc<FileSlot>> {
        let mut files: Vec<_> = self.files.read().values().cloned().collect();
        files.sort_by_key(|s| s.id);
        files
    }

    // --- pages ---

    /// Returns the page pinned, reading it from disk on a miss.
    pub fn get_or_load(&self, file: FileId, page_id: PageId) -> Result<PageGuard> {
        let slot = self.file(file)?;
        let mut frames = self.frames.lock();
        if let Some(&idx) = frames.lru.get(&(file, page_id)) {
            let frame = Arc::clone(&frames.frames[idx]);
            frame.pin_count.fetch_add(1, Ordering::AcqRel);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(PageGuard {
                frame,
                file,
                page_id,
            });
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let idx = self.obtain_frame(&mut frames)?;
        let frame = Arc::clone(&frames.frames[idx]);
        let page = match slot.pager.lock().read_page(page_id) {
            Ok(page) => page,
            Err(e) => {
                frames.free.push(idx);
                return Err(e);
            }
        };
        *frame.page.write() = page;
        frame.dirty.store(false, Ordering::Release);
        frame.pin_count.store(1, Ordering::Release);
        frames.lru.put((file, page_id), idx);
        Ok(PageGuard {
            frame,
            file,
            page_id,
        })
    }

    pub fn mark_dirty(&self, guard: &PageGuard) {
        guard.frame.dirty.store(true, Ordering::Release);
    }

    /// Decoded header page of `file`.
    pub fn header(&self, file: FileId) -> Result<FileHeader> {
        let guard = self.get_or_load(file, HEADER_PAGE_ID)?;
        let header = guard.read().file_header();
        Ok(header)
    }

    /// Writes every dirty page of `file` and syncs the file.
    pub fn sync(&self, file: FileId) -> Result<()> {
        let slot = self.file(file)?;
        let resident: Vec<Arc<Frame>> = {
            let frames = self.frames.lock();
            frames
                .lru
                .iter()
                .filter(|(key, _)| key.0 == file)
                .map(|(_, &idx)| Arc::clone(&frames.frames[idx]))
                .collect()
        };
        let mut written = 0usize;
        for frame in resident {
            if frame.dirty.load(Ordering::Acquire) {
                let page = frame.page.read();
                // the frame may have been recycled since the snapshot
                if page.file != file {
                    continue;
                }
                self.write_back(&slot, &frame, &page)?;
                written += 1;
            }
        }
        slot.pager.lock().flush()?;
        debug!(file, written, "synced page file");
        Ok(())
    }

    pub fn sync_all(&self) -> Result<()> {
        for slot in self.files() {
            self.sync(slot.id)?;
        }
        Ok(())
    }

    /// Evicts least-recently-used pages until a tenth of the capacity is free.
    /// Returns how many pages were evicted.
    pub fn evict_if_needed(&self) -> Result<usize> {
        let target = (self.capacity / 10).max(1);
        let mut frames = self.frames.lock();
        let mut evicted = 0;
        while frames.free.len() + (self.capacity - frames.frames.len()) < target {
            let Some((key, idx)) = find_victim(&frames) else {
                break;
            };
            self.evict(&mut frames, key, idx)?;
            frames.free.push(idx);
            evicted += 1;
        }
        Ok(evicted)
    }

    /// Drops every cached page of `file` without writing it back.
    pub(crate) fn discard(&self, file: FileId) -> Result<()> {
        let mut frames = self.frames.lock();
        let keys: Vec<_> = frames
            .lru
            .iter()
            .filter(|(key, _)| key.0 == file)
            .map(|(key, &idx)| (*key, idx))
            .collect();
        for (key, idx) in keys {
            let frame = &frames.frames[idx];
            if frame.pin_count.load(Ordering::Acquire) > 0 {
                return Err(Error::InvalidState(format!(
                    "page {} of file {file} is still pinned",
                    key.1
                )));
            }
            frame.dirty.store(false, Ordering::Release);
            frames.lru.pop(&key);
            frames.free.push(idx);
        }
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        let frames = self.frames.lock();
        let mut dirty = 0;
        let mut pinned = 0;
        for (_, &idx) in frames.lru.iter() {
            let frame = &frames.frames[idx];
            if frame.dirty.load(Ordering::Relaxed) {
                dirty += 1;
            }
            if frame.pin_count.load(Ordering::Relaxed) > 0 {
                pinned += 1;
            }
        }
        CacheStats {
            capacity: self.capacity,
            resident: frames.lru.len(),
            dirty,
            pinned,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn obtain_frame(&self, frames: &mut Frames) -> Result<usize> {
        if let Some(idx) = frames.free.pop() {
            return Ok(idx);
        }
        if frames.frames.len() < self.capacity {
            frames.frames.push(Arc::new(Frame::empty()));
            return Ok(frames.frames.len() - 1);
        }
        let (key, idx) = find_victim(frames).ok_or(Error::CacheExhausted {
            capacity: self.capacity,
        })?;
        self.evict(frames, key, idx)?;
        Ok(idx)
    }

    fn evict(&self, frames: &mut Frames, key: (FileId, PageId), idx: usize) -> Result<()> {
        let frame = Arc::clone(&frames.frames[idx]);
        if frame.dirty.load(Ordering::Acquire) {
            let slot = self.file(key.0)?;
            let page = frame.page.read();
            self.write_back(&slot, &frame, &page)?;
        }
        frames.lru.pop(&key);
        self.evictions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Flushes the journal to the page LSN, then hands the page to the pager.
    /// Holding the page read lock keeps writers out while the dirty flag is cleared.
    fn write_back(&self, slot: &FileSlot, frame: &Frame, page: &Page) -> Result<()> {
        let lsn = page.lsn();
        if lsn.is_valid() {
            if let Some(wal) = self.wal.read().as_ref() {
                wal.flush_to(lsn)?;
            }
        }
        failpoint::maybe_fail("cache.write_back").map_err(|e| Error::storage(&slot.path, e))?;
        frame.dirty.store(false, Ordering::Release);
        if let Err(e) = slot.pager.lock().write_page(page) {
            frame.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }
}

/// Least-recently-used frame that is unpinned and, when dirty, already logged.
fn find_victim(frames: &Frames) -> Option<((FileId, PageId), usize)> {
    frames
        .lru
        .iter()
        .rev()
        .find(|(_, &idx)| {
            let frame = &frames.frames[idx];
            frame.pin_count.load(Ordering::Acquire) == 0
                && (!frame.dirty.load(Ordering::Acquire) || frame.page.read().lsn().is_valid())
        })
        .map(|(key, &idx)| (*key, idx))
}
