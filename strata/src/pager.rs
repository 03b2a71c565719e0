//! The Pager is responsible for reading and writing raw pages of one page file.
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::failpoint;
use crate::page::{FileHeader, Page, FORMAT_VERSION, HEADER_PAGE_ID};
use crate::{Error, FileId, PageId, Result, MAX_PAGE_SIZE, MIN_PAGE_SIZE};

/// Size of the prefix of page 0 needed to learn a file's page size.
const HEADER_PREFIX_LEN: usize = 64;

/// Block I/O over a single page file.
pub struct Pager {
    file: File,
    path: PathBuf,
    file_id: FileId,
    page_size: usize,
    pub num_pages: u32,
}

impl Pager {
    /// Creates a new page file with an empty header page. Fails if the file exists.
    pub fn create<P: AsRef<Path>>(path: P, file_id: FileId, page_size: usize) -> Result<Self> {
        let path_ref = path.as_ref();
        if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(Error::InvalidState(format!(
                "page size {page_size} must be a power of two between {MIN_PAGE_SIZE} and {MAX_PAGE_SIZE}"
            )));
        }
        if let Some(parent) = path_ref.parent() {
            create_dir_all(parent).map_err(|e| Error::storage(path_ref, e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path_ref)
            .map_err(|e| Error::storage(path_ref, e))?;

        let mut pager = Self {
            file,
            path: path_ref.to_path_buf(),
            file_id,
            page_size,
            num_pages: 0,
        };
        let mut header_page = Page::new(file_id, HEADER_PAGE_ID, page_size);
        header_page.write_file_header(&FileHeader::new(file_id, page_size));
        pager.write_page(&header_page)?;
        pager.flush()?;
        info!(path = ?path_ref, file_id, page_size, "created page file");
        Ok(pager)
    }

    /// Opens an existing page file and validates its header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path_ref)
            .map_err(|e| Error::storage(path_ref, e))?;

        let mut prefix = [0u8; HEADER_PREFIX_LEN];
        file.read_exact(&mut prefix)
            .map_err(|e| Error::storage(path_ref, e))?;
        let mut header_page = Page::new(0, HEADER_PAGE_ID, HEADER_PREFIX_LEN);
        header_page.data.copy_from_slice(&prefix);
        let header = header_page.file_header();

        if header.format_version != FORMAT_VERSION {
            return Err(Error::storage(
                path_ref,
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unsupported format version {}", header.format_version),
                ),
            ));
        }
        let page_size = header.page_size as usize;
        if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(Error::storage(
                path_ref,
                io::Error::new(io::ErrorKind::InvalidData, format!("bad page size {page_size}")),
            ));
        }

        let file_size = file
            .metadata()
            .map_err(|e| Error::storage(path_ref, e))?
            .len();
        let num_pages = file_size.div_ceil(page_size as u64) as u32;
        debug!(path = ?path_ref, file_id = header.file_id, num_pages, "opened page file");

        Ok(Self {
            file,
            path: path_ref.to_path_buf(),
            file_id: header.file_id,
            page_size,
            num_pages,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Reads a page from the file. Pages beyond the end of the file read as zeroed pages.
    pub fn read_page(&mut self, page_id: PageId) -> Result<Page> {
        let mut page = Page::new(self.file_id, page_id, self.page_size);
        if page_id >= self.num_pages {
            debug!(file_id = self.file_id, page_id, "page beyond end of file, using zeroed page");
            return Ok(page);
        }

        let offset = page_id as u64 * self.page_size as u64;
        let path = &self.path;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Error::storage(path, e))?;

        let mut filled = 0;
        while filled < self.page_size {
            let n = self
                .file
                .read(&mut page.data[filled..])
                .map_err(|e| Error::storage(path, e))?;
            if n == 0 {
                // short tail from an interrupted extension; the rest stays zeroed
                break;
            }
            filled += n;
        }
        Ok(page)
    }

    /// Writes a page into the OS buffer. Durable only after [`Pager::flush`].
    pub fn write_page(&mut self, page: &Page) -> Result<()> {
        failpoint::maybe_fail("pager.write").map_err(|e| Error::storage(&self.path, e))?;
        debug_assert_eq!(page.data.len(), self.page_size);
        let offset = page.id as u64 * self.page_size as u64;
        let path = &self.path;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Error::storage(path, e))?;
        self.file
            .write_all(&page.data)
            .map_err(|e| Error::storage(path, e))?;
        if page.id >= self.num_pages {
            self.num_pages = page.id + 1;
        }
        Ok(())
    }

    /// Forces written pages to stable storage.
    pub fn flush(&mut self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| Error::storage(&self.path, e))
    }

    /// Shrinks the file to just its header page.
    pub fn truncate(&mut self) -> Result<()> {
        let path = &self.path;
        self.file
            .set_len(self.page_size as u64)
            .map_err(|e| Error::storage(path, e))?;
        self.num_pages = 1;
        let mut header_page = Page::new(self.file_id, HEADER_PAGE_ID, self.page_size);
        header_page.write_file_header(&FileHeader::new(self.file_id, self.page_size));
        self.write_page(&header_page)?;
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageType;
    use crate::wal::Lsn;
    use tempfile::tempdir;

    #[test]
    fn test_pager() {
        let temp_dir = tempdir().unwrap();
        let temp_path = temp_dir.path().join("test.dbx");

        let mut pager = Pager::create(&temp_path, 4, 4096).unwrap();
        assert_eq!(pager.num_pages, 1);

        let mut page = pager.read_page(1).unwrap();
        page.set_page_type(PageType::Raw);
        page.set_lsn(Lsn::new(1, 123));
        pager.write_page(&page).unwrap();
        pager.flush().unwrap();

        // Re-open the pager and check if the page is there
        drop(pager);
        let mut pager = Pager::open(&temp_path).unwrap();
        assert_eq!(pager.file_id(), 4);
        assert_eq!(pager.page_size(), 4096);
        assert_eq!(pager.num_pages, 2);
        let page = pager.read_page(1).unwrap();
        assert_eq!(page.lsn(), Lsn::new(1, 123));
        assert_eq!(page.page_type(), Some(PageType::Raw));
    }

    #[test]
    fn test_create_rejects_existing_file_and_bad_page_size() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("a.dbx");
        Pager::create(&path, 1, 4096).unwrap();
        assert!(matches!(
            Pager::create(&path, 1, 4096),
            Err(Error::StorageFault { .. })
        ));
        assert!(Pager::create(temp_dir.path().join("b.dbx"), 1, 5000).is_err());
    }

    #[test]
    fn test_truncate_resets_header() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("t.dbx");
        let mut pager = Pager::create(&path, 2, 4096).unwrap();
        for id in 1..5 {
            let page = Page::new(2, id, 4096);
            pager.write_page(&page).unwrap();
        }
        assert_eq!(pager.num_pages, 5);
        pager.truncate().unwrap();
        assert_eq!(pager.num_pages, 1);
        let header = pager.read_page(HEADER_PAGE_ID).unwrap().file_header();
        assert_eq!(header.page_count, 1);
        assert_eq!(header.file_id, 2);
    }
}
