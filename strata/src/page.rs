//! The layout of a page on disk.
//!
//! Every page except the file header starts with a 13 byte page header:
//!
//! ```text
//! [page_lsn.file:u32][page_lsn.offset:u64][page_type:u8][body ...]
//! ```
//!
//! Page 0 of each file is the file header page. Its fields come first and the
//! page LSN is stored after them:
//!
//! ```text
//! [format_version:u16][page_size:u32][free_list_head:u32][file_id:u16]
//! [page_count:u32][root_page:u32][next_seq:u64][page_lsn:12 bytes]
//! ```
//!
//! All integers are big-endian.
use crate::wal::Lsn;
use crate::{Error, FileId, PageId, Result, INVALID_PAGE_ID};

pub const FORMAT_VERSION: u16 = 1;
pub const HEADER_PAGE_ID: PageId = 0;

/// Size of the common header of a non-header page.
pub const PAGE_HEADER_SIZE: usize = 13;

const LSN_SIZE: usize = 12;
const TYPE_OFFSET: usize = LSN_SIZE;

const FH_VERSION: usize = 0;
const FH_PAGE_SIZE: usize = 2;
const FH_FREE_HEAD: usize = 6;
const FH_FILE_ID: usize = 10;
const FH_PAGE_COUNT: usize = 12;
const FH_ROOT: usize = 16;
const FH_NEXT_SEQ: usize = 20;
const FH_LSN: usize = 28;

/// What a page is currently used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    /// Never written; reads beyond the end of a file produce these.
    Unused = 0,
    Free = 1,
    Leaf = 2,
    Internal = 3,
    Overflow = 4,
    Raw = 5,
}

impl PageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => PageType::Unused,
            1 => PageType::Free,
            2 => PageType::Leaf,
            3 => PageType::Internal,
            4 => PageType::Overflow,
            5 => PageType::Raw,
            _ => return None,
        })
    }
}

/// Decoded copy of the file header page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub format_version: u16,
    pub page_size: u32,
    pub free_list_head: PageId,
    pub file_id: FileId,
    pub page_count: u32,
    pub root_page: PageId,
    pub next_seq: u64,
}

impl FileHeader {
    pub fn new(file_id: FileId, page_size: usize) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            page_size: page_size as u32,
            free_list_head: INVALID_PAGE_ID,
            file_id,
            page_count: 1,
            root_page: INVALID_PAGE_ID,
            next_seq: 1,
        }
    }
}

/// A fixed-size block read from or written to a page file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub file: FileId,
    pub id: PageId,
    pub data: Vec<u8>,
}

impl Page {
    /// A zeroed page of the given size.
    pub fn new(file: FileId, id: PageId, page_size: usize) -> Self {
        Self {
            file,
            id,
            data: vec![0; page_size],
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    fn lsn_offset(&self) -> usize {
        if self.id == HEADER_PAGE_ID {
            FH_LSN
        } else {
            0
        }
    }

    /// LSN of the latest loggable applied to this page.
    pub fn lsn(&self) -> Lsn {
        let off = self.lsn_offset();
        Lsn::new(read_u32(&self.data, off), read_u64(&self.data, off + 4))
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        let off = self.lsn_offset();
        write_u32(&mut self.data, off, lsn.file);
        write_u64(&mut self.data, off + 4, lsn.offset);
    }

    pub fn page_type(&self) -> Option<PageType> {
        PageType::from_u8(self.data[TYPE_OFFSET])
    }

    pub fn set_page_type(&mut self, page_type: PageType) {
        self.data[TYPE_OFFSET] = page_type as u8;
    }

    /// Bytes after the page header.
    pub fn body(&self) -> &[u8] {
        &self.data[PAGE_HEADER_SIZE..]
    }

    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.data[PAGE_HEADER_SIZE..]
    }

    /// Resets the page to an empty page of the given type, keeping its LSN.
    pub fn reset(&mut self, page_type: PageType) {
        let lsn = self.lsn();
        self.data.fill(0);
        self.set_lsn(lsn);
        self.set_page_type(page_type);
    }

    /// Replaces the page content with `image`, then stamps `lsn`.
    pub fn apply_image(&mut self, image: &[u8], lsn: Lsn) {
        let n = image.len().min(self.data.len());
        self.data[..n].copy_from_slice(&image[..n]);
        self.data[n..].fill(0);
        self.set_lsn(lsn);
    }

    // --- free pages ---

    pub fn next_free(&self) -> PageId {
        read_u32(&self.data, PAGE_HEADER_SIZE)
    }

    pub fn make_free(&mut self, next_free: PageId) {
        self.reset(PageType::Free);
        write_u32(&mut self.data, PAGE_HEADER_SIZE, next_free);
    }

    // --- overflow pages: [next:u32][len:u32][bytes] ---

    pub const OVERFLOW_HEADER: usize = 8;

    pub fn overflow_capacity(page_size: usize) -> usize {
        page_size - PAGE_HEADER_SIZE - Self::OVERFLOW_HEADER
    }

    pub fn write_overflow(&mut self, next: PageId, chunk: &[u8]) {
        self.reset(PageType::Overflow);
        write_u32(&mut self.data, PAGE_HEADER_SIZE, next);
        write_u32(&mut self.data, PAGE_HEADER_SIZE + 4, chunk.len() as u32);
        let start = PAGE_HEADER_SIZE + Self::OVERFLOW_HEADER;
        self.data[start..start + chunk.len()].copy_from_slice(chunk);
    }

    /// Returns `(next page, chunk)` of an overflow page.
    pub fn read_overflow(&self) -> Result<(PageId, &[u8])> {
        if self.page_type() != Some(PageType::Overflow) {
            return Err(Error::corruption(self.file, self.id, "expected overflow page"));
        }
        let next = read_u32(&self.data, PAGE_HEADER_SIZE);
        let len = read_u32(&self.data, PAGE_HEADER_SIZE + 4) as usize;
        let start = PAGE_HEADER_SIZE + Self::OVERFLOW_HEADER;
        if start + len > self.data.len() {
            return Err(Error::corruption(self.file, self.id, "overflow chunk length out of bounds"));
        }
        Ok((next, &self.data[start..start + len]))
    }

    // --- header page ---

    pub fn file_header(&self) -> FileHeader {
        FileHeader {
            format_version: read_u16(&self.data, FH_VERSION),
            page_size: read_u32(&self.data, FH_PAGE_SIZE),
            free_list_head: read_u32(&self.data, FH_FREE_HEAD),
            file_id: read_u16(&self.data, FH_FILE_ID),
            page_count: read_u32(&self.data, FH_PAGE_COUNT),
            root_page: read_u32(&self.data, FH_ROOT),
            next_seq: read_u64(&self.data, FH_NEXT_SEQ),
        }
    }

    pub fn write_file_header(&mut self, header: &FileHeader) {
        write_u16(&mut self.data, FH_VERSION, header.format_version);
        write_u32(&mut self.data, FH_PAGE_SIZE, header.page_size);
        write_u32(&mut self.data, FH_FREE_HEAD, header.free_list_head);
        write_u16(&mut self.data, FH_FILE_ID, header.file_id);
        write_u32(&mut self.data, FH_PAGE_COUNT, header.page_count);
        write_u32(&mut self.data, FH_ROOT, header.root_page);
        write_u64(&mut self.data, FH_NEXT_SEQ, header.next_seq);
    }
}

pub(crate) fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

pub(crate) fn read_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_be_bytes(b)
}

pub(crate) fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_be_bytes(b)
}

pub(crate) fn write_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_be_bytes());
}

pub(crate) fn write_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_be_bytes());
}

pub(crate) fn write_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_be_bytes());
}
