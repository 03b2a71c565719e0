//! Journaled page allocation and raw page access for one page file.
//!
//! Every mutation goes through the page cache and is logged before the page
//! is changed. The free list is a singly linked chain threaded through free
//! pages, with its head in the file header.
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cache::{FileSlot, PageCache};
use crate::error::RecoveryError;
use crate::loggable::LogKind;
use crate::page::{FileHeader, Page, PageType, HEADER_PAGE_ID, PAGE_HEADER_SIZE};
use crate::pager::Pager;
use crate::transaction::Txn;
use crate::wal::Lsn;
use crate::{Error, FileId, PageId, Result, INVALID_PAGE_ID};

pub struct PageStore {
    cache: Arc<PageCache>,
    slot: Arc<FileSlot>,
}

impl PageStore {
    /// Creates a new page file and registers it with the cache.
    pub fn create<P: AsRef<Path>>(
        cache: Arc<PageCache>,
        path: P,
        file_id: FileId,
        page_size: usize,
    ) -> Result<Self> {
        let pager = Pager::create(path.as_ref(), file_id, page_size)?;
        let slot = cache.register_file(pager, &file_name(path.as_ref()))?;
        Ok(Self { cache, slot })
    }

    /// Opens an existing page file and registers it with the cache.
    pub fn open<P: AsRef<Path>>(cache: Arc<PageCache>, path: P) -> Result<Self> {
        let pager = Pager::open(path.as_ref())?;
        let slot = cache.register_file(pager, &file_name(path.as_ref()))?;
        Ok(Self { cache, slot })
    }

    /// A handle on a file already registered with the cache.
    pub fn new(cache: Arc<PageCache>, file: FileId) -> Result<Self> {
        let slot = cache.file(file)?;
        Ok(Self { cache, slot })
    }

    pub fn file_id(&self) -> FileId {
        self.slot.id()
    }

    pub fn page_size(&self) -> usize {
        self.slot.page_size()
    }

    pub fn slot(&self) -> &Arc<FileSlot> {
        &self.slot
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub fn header(&self) -> Result<FileHeader> {
        self.cache.header(self.file_id())
    }

    /// Takes a page from the free list, or extends the file when the list is
    /// empty. The page comes back empty and typed [`PageType::Raw`]. If `txn`
    /// aborts the page goes back on the free list.
    pub fn allocate_page(&self, txn: &mut Txn) -> Result<PageId> {
        self.allocate(txn, false)
    }

    /// Allocation for a B-tree structure change, which stays in place when
    /// the transaction aborts.
    pub(crate) fn allocate_structural(&self, txn: &mut Txn) -> Result<PageId> {
        self.allocate(txn, true)
    }

    fn allocate(&self, txn: &mut Txn, structural: bool) -> Result<PageId> {
        let file = self.file_id();
        let header_guard = self.cache.get_or_load(file, HEADER_PAGE_ID)?;
        let mut header_page = header_guard.write();
        let mut header = header_page.file_header();

        let (page_id, free_head_after, page_count_after) =
            if header.free_list_head != INVALID_PAGE_ID {
                let head = header.free_list_head;
                let guard = self.cache.get_or_load(file, head)?;
                let page = guard.read();
                if page.page_type() != Some(PageType::Free) {
                    return Err(Error::corruption(file, head, "free list head is not a free page"));
                }
                (head, page.next_free(), header.page_count)
            } else {
                (header.page_count, INVALID_PAGE_ID, header.page_count + 1)
            };

        let lsn = txn.log(LogKind::PageAlloc {
            file,
            page: page_id,
            free_head_before: header.free_list_head,
            free_head_after,
            page_count_before: header.page_count,
            page_count_after,
            structural,
        })?;

        header.free_list_head = free_head_after;
        header.page_count = page_count_after;
        header_page.write_file_header(&header);
        header_page.set_lsn(lsn);
        drop(header_page);
        self.cache.mark_dirty(&header_guard);

        let guard = self.cache.get_or_load(file, page_id)?;
        {
            let mut page = guard.write();
            page.reset(PageType::Raw);
            page.set_lsn(lsn);
        }
        self.cache.mark_dirty(&guard);
        debug!(file, page_id, "allocated page");
        Ok(page_id)
    }

    /// Returns a page to the head of the free list. If `txn` aborts the page
    /// is taken back and its content restored.
    pub fn free_page(&self, page_id: PageId, txn: &mut Txn) -> Result<()> {
        self.release(page_id, txn, false)
    }

    pub(crate) fn free_structural(&self, page_id: PageId, txn: &mut Txn) -> Result<()> {
        self.release(page_id, txn, true)
    }

    fn release(&self, page_id: PageId, txn: &mut Txn, structural: bool) -> Result<()> {
        let file = self.file_id();
        let header_guard = self.cache.get_or_load(file, HEADER_PAGE_ID)?;
        let mut header_page = header_guard.write();
        let mut header = header_page.file_header();
        check_page(file, page_id, &header)?;

        let guard = self.cache.get_or_load(file, page_id)?;
        let mut page = guard.write();
        if page.page_type() == Some(PageType::Free) {
            return Err(Error::InvalidState(format!(
                "page {page_id} of file {file} is already free"
            )));
        }

        let lsn = txn.log(LogKind::PageFree {
            file,
            page: page_id,
            free_head_before: header.free_list_head,
            structural,
            before: if structural { Vec::new() } else { page.data.clone() },
        })?;

        page.make_free(header.free_list_head);
        page.set_lsn(lsn);
        drop(page);
        self.cache.mark_dirty(&guard);

        header.free_list_head = page_id;
        header_page.write_file_header(&header);
        header_page.set_lsn(lsn);
        drop(header_page);
        self.cache.mark_dirty(&header_guard);
        Ok(())
    }

    /// Puts a page allocated by a rolled-back transaction on the free list.
    /// The file does not shrink; the next allocation reuses the page.
    pub(crate) fn undo_alloc(&self, page_id: PageId, txn: &mut Txn) -> Result<()> {
        self.release(page_id, txn, false)
    }

    /// Takes a page freed by a rolled-back transaction off the free list and
    /// restores `before`.
    pub(crate) fn undo_free(&self, page_id: PageId, before: &[u8], txn: &mut Txn) -> Result<()> {
        let file = self.file_id();
        let header_guard = self.cache.get_or_load(file, HEADER_PAGE_ID)?;
        let mut header_page = header_guard.write();
        let mut header = header_page.file_header();
        check_page(file, page_id, &header)?;

        let guard = self.cache.get_or_load(file, page_id)?;
        let mut page = guard.write();
        if page.page_type() != Some(PageType::Free) {
            warn!(file, page_id, "freed page was reused before rollback; leaving it");
            return Ok(());
        }
        let next = page.next_free();
        let free_head_after = if header.free_list_head == page_id {
            next
        } else {
            if !self.unlink_free(page_id, next, &header, txn)? {
                return Err(Error::corruption(file, page_id, "free page is not on the free list"));
            }
            header.free_list_head
        };

        let lsn = txn.log(LogKind::PageAlloc {
            file,
            page: page_id,
            free_head_before: header.free_list_head,
            free_head_after,
            page_count_before: header.page_count,
            page_count_after: header.page_count,
            structural: false,
        })?;
        header.free_list_head = free_head_after;
        header_page.write_file_header(&header);
        header_page.set_lsn(lsn);
        drop(header_page);
        self.cache.mark_dirty(&header_guard);

        page.reset(PageType::Raw);
        page.set_lsn(lsn);
        if !before.is_empty() {
            let lsn = txn.log(LogKind::PageWrite {
                file,
                page: page_id,
                before: page.data.clone(),
                after: before.to_vec(),
            })?;
            page.apply_image(before, lsn);
        }
        drop(page);
        self.cache.mark_dirty(&guard);
        debug!(file, page_id, "took freed page back");
        Ok(())
    }

    /// Points the free-list predecessor of `page_id` at `next`. Returns
    /// false when `page_id` is not on the list.
    fn unlink_free(
        &self,
        page_id: PageId,
        next: PageId,
        header: &FileHeader,
        txn: &mut Txn,
    ) -> Result<bool> {
        let file = self.file_id();
        let mut prev = header.free_list_head;
        for _ in 0..header.page_count {
            if prev == INVALID_PAGE_ID {
                break;
            }
            let guard = self.cache.get_or_load(file, prev)?;
            let mut prev_page = guard.write();
            if prev_page.next_free() != page_id {
                prev = prev_page.next_free();
                continue;
            }
            let mut after = prev_page.clone();
            after.make_free(next);
            let lsn = txn.log(LogKind::PageWrite {
                file,
                page: prev,
                before: prev_page.data.clone(),
                after: after.data.clone(),
            })?;
            prev_page.apply_image(&after.data, lsn);
            drop(prev_page);
            self.cache.mark_dirty(&guard);
            return Ok(true);
        }
        Ok(false)
    }

    /// The payload of a raw page (everything after the page header).
    pub fn read_page(&self, page_id: PageId) -> Result<Vec<u8>> {
        let header = self.header()?;
        check_page(self.file_id(), page_id, &header)?;
        let guard = self.cache.get_or_load(self.file_id(), page_id)?;
        let body = guard.read().body().to_vec();
        Ok(body)
    }

    /// Replaces the payload of a raw page. Shorter payloads are zero-padded.
    pub fn write_page(&self, page_id: PageId, payload: &[u8], txn: &mut Txn) -> Result<Lsn> {
        let file = self.file_id();
        let max = self.page_size() - PAGE_HEADER_SIZE;
        if payload.len() > max {
            return Err(Error::InvalidState(format!(
                "payload of {} bytes does not fit a page ({max} bytes)",
                payload.len()
            )));
        }
        let header = self.header()?;
        check_page(file, page_id, &header)?;

        let guard = self.cache.get_or_load(file, page_id)?;
        let mut page = guard.write();
        if page.page_type() != Some(PageType::Raw) {
            return Err(Error::InvalidState(format!(
                "page {page_id} of file {file} is not a raw page"
            )));
        }
        let mut after = page.clone();
        after.body_mut().fill(0);
        after.body_mut()[..payload.len()].copy_from_slice(payload);

        let lsn = txn.log(LogKind::PageWrite {
            file,
            page: page_id,
            before: page.data.clone(),
            after: after.data.clone(),
        })?;
        page.apply_image(&after.data, lsn);
        drop(page);
        self.cache.mark_dirty(&guard);
        Ok(lsn)
    }

    /// Replaces a whole page image, logging the before and after images.
    pub(crate) fn write_image(&self, page_id: PageId, image: &[u8], txn: &mut Txn) -> Result<Lsn> {
        let file = self.file_id();
        let header = self.header()?;
        check_page(file, page_id, &header)?;
        let guard = self.cache.get_or_load(file, page_id)?;
        let mut page = guard.write();
        let lsn = txn.log(LogKind::PageWrite {
            file,
            page: page_id,
            before: page.data.clone(),
            after: image.to_vec(),
        })?;
        page.apply_image(image, lsn);
        drop(page);
        self.cache.mark_dirty(&guard);
        Ok(lsn)
    }

    /// Logs and installs a structural page image (redo-only).
    pub(crate) fn put_image(&self, page: &Page, txn: &mut Txn) -> Result<Lsn> {
        let file = self.file_id();
        let guard = self.cache.get_or_load(file, page.id)?;
        let mut current = guard.write();
        let lsn = txn.log(LogKind::PageImage {
            file,
            page: page.id,
            image: page.data.clone(),
        })?;
        current.apply_image(&page.data, lsn);
        drop(current);
        self.cache.mark_dirty(&guard);
        Ok(lsn)
    }

    pub(crate) fn set_root(&self, new_root: PageId, txn: &mut Txn) -> Result<()> {
        let file = self.file_id();
        let guard = self.cache.get_or_load(file, HEADER_PAGE_ID)?;
        let mut page = guard.write();
        let mut header = page.file_header();
        let lsn = txn.log(LogKind::RootChange {
            file,
            old_root: header.root_page,
            new_root,
        })?;
        header.root_page = new_root;
        page.write_file_header(&header);
        page.set_lsn(lsn);
        drop(page);
        self.cache.mark_dirty(&guard);
        Ok(())
    }

    /// Hands out the next insertion sequence number of this file.
    pub(crate) fn take_seq(&self) -> Result<u64> {
        let guard = self.cache.get_or_load(self.file_id(), HEADER_PAGE_ID)?;
        let mut page = guard.write();
        let mut header = page.file_header();
        let seq = header.next_seq;
        header.next_seq += 1;
        page.write_file_header(&header);
        drop(page);
        self.cache.mark_dirty(&guard);
        Ok(seq)
    }

    /// Writes every dirty page of this file and syncs it.
    pub fn flush(&self) -> Result<()> {
        self.cache.sync(self.file_id())
    }

    /// Drops every page except the header and resets the header.
    ///
    /// Not journaled: callers must make sure no transaction has pending
    /// changes in this file and take a checkpoint afterwards.
    pub fn truncate(&self) -> Result<()> {
        let _latch = self.slot.latch().write();
        self.cache.discard(self.file_id())?;
        self.slot.pager().lock().truncate()?;
        self.slot.clear_unusable();
        info!(file = self.file_id(), name = self.slot.name(), "truncated page file");
        Ok(())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn check_page(file: FileId, page_id: PageId, header: &FileHeader) -> Result<()> {
    if page_id == HEADER_PAGE_ID || page_id >= header.page_count {
        return Err(Error::InvalidState(format!(
            "page {page_id} is outside file {file} ({} pages)",
            header.page_count
        )));
    }
    Ok(())
}

// --- redo ---

/// Applies `f` to a page whose LSN is older than `lsn`, then stamps `lsn`.
pub(crate) fn redo_page(
    cache: &PageCache,
    lsn: Lsn,
    file: FileId,
    page_id: PageId,
    f: impl FnOnce(&mut Page) -> Result<()>,
) -> Result<bool> {
    let guard = cache.get_or_load(file, page_id)?;
    let mut page = guard.write();
    if page.lsn() >= lsn {
        return Ok(false);
    }
    f(&mut page)?;
    page.set_lsn(lsn);
    drop(page);
    cache.mark_dirty(&guard);
    Ok(true)
}

/// Fails recovery when a record names a file that is not open.
pub(crate) fn require_file(cache: &PageCache, lsn: Lsn, file: FileId) -> Result<()> {
    cache
        .file(file)
        .map(|_| ())
        .map_err(|_| RecoveryError::MissingFile { lsn, file }.into())
}

/// Fails recovery when a record names a page beyond the end of its file.
pub(crate) fn require_page(cache: &PageCache, lsn: Lsn, file: FileId, page: PageId) -> Result<()> {
    require_file(cache, lsn, file)?;
    let header = cache.header(file)?;
    if page == HEADER_PAGE_ID || page >= header.page_count {
        return Err(RecoveryError::MissingPage { lsn, file, page }.into());
    }
    Ok(())
}

pub(crate) fn redo_alloc(
    cache: &PageCache,
    lsn: Lsn,
    file: FileId,
    page: PageId,
    free_head_after: PageId,
    page_count_after: u32,
) -> Result<()> {
    require_file(cache, lsn, file)?;
    redo_page(cache, lsn, file, HEADER_PAGE_ID, |p| {
        let mut header = p.file_header();
        header.free_list_head = free_head_after;
        header.page_count = header.page_count.max(page_count_after);
        p.write_file_header(&header);
        Ok(())
    })?;
    require_page(cache, lsn, file, page)?;
    redo_page(cache, lsn, file, page, |p| {
        p.reset(PageType::Raw);
        Ok(())
    })?;
    Ok(())
}

pub(crate) fn redo_free(
    cache: &PageCache,
    lsn: Lsn,
    file: FileId,
    page: PageId,
    free_head_before: PageId,
) -> Result<()> {
    require_page(cache, lsn, file, page)?;
    redo_page(cache, lsn, file, page, |p| {
        p.make_free(free_head_before);
        Ok(())
    })?;
    redo_page(cache, lsn, file, HEADER_PAGE_ID, |p| {
        let mut header = p.file_header();
        header.free_list_head = page;
        p.write_file_header(&header);
        Ok(())
    })?;
    Ok(())
}

pub(crate) fn redo_image(
    cache: &PageCache,
    lsn: Lsn,
    file: FileId,
    page: PageId,
    image: &[u8],
) -> Result<()> {
    require_page(cache, lsn, file, page)?;
    redo_page(cache, lsn, file, page, |p| {
        p.apply_image(image, lsn);
        Ok(())
    })?;
    Ok(())
}

pub(crate) fn redo_root(cache: &PageCache, lsn: Lsn, file: FileId, new_root: PageId) -> Result<()> {
    require_file(cache, lsn, file)?;
    redo_page(cache, lsn, file, HEADER_PAGE_ID, |p| {
        let mut header = p.file_header();
        header.root_page = new_root;
        p.write_file_header(&header);
        Ok(())
    })?;
    Ok(())
}

/// Raises the file's next sequence number past `seq`. Not LSN-gated: the
/// counter only moves forward.
pub(crate) fn bump_seq(cache: &PageCache, file: FileId, seq: u64) -> Result<()> {
    let guard = cache.get_or_load(file, HEADER_PAGE_ID)?;
    let mut page = guard.write();
    let mut header = page.file_header();
    if header.next_seq <= seq {
        header.next_seq = seq + 1;
        page.write_file_header(&header);
        drop(page);
        cache.mark_dirty(&guard);
    }
    Ok(())
}
