//! # Memory-Mapped File Access
//!
//! `MmapFile` presents a single index file as an array of fixed-size pages
//! over a shared memory mapping. Reads and writes operate directly on the
//! mapped region, so a page access is pointer arithmetic and the OS page
//! cache does the caching.
//!
//! ## Safety Model
//!
//! A memory-mapped region becomes invalid when the file is resized and
//! remapped. Instead of runtime guards, the borrow checker enforces
//! safety at compile time:
//!
//! ```text
//! page(&self) -> &[u8]              // immutable borrow of self
//! page_mut(&mut self) -> &mut [u8]  // exclusive borrow of self
//! grow(&mut self) / truncate(&mut self)  // exclusive borrow
//! ```
//!
//! Because resizing requires `&mut self`, no page reference can be alive
//! across a remap. This also gives the store its lease discipline for
//! free: a page borrow is a lease, and every exit path ends it.
//!
//! ## File Format
//!
//! The file is a plain concatenation of pages. Page 0 carries the file
//! header in its first bytes; the file size is always a whole number of
//! pages. The page size is a runtime property recorded in the file header
//! and validated on open.
//!
//! ## Durability
//!
//! The mapping is `MAP_SHARED`: stores reach the kernel immediately and
//! `sync()` (`msync`) makes them durable. Between mutation and `sync` the
//! data is visible to the process but not guaranteed on disk.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

#[derive(Debug)]
pub struct MmapFile {
    file: File,
    mmap: MmapMut,
    page_size: usize,
    page_count: u32,
}

impl MmapFile {
    /// Opens an existing index file. The file must be non-empty and a
    /// whole number of pages long.
    pub fn open<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open index file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(
            file_size > 0,
            "cannot open empty index file '{}'",
            path.display()
        );

        ensure!(
            file_size % page_size as u64 == 0,
            "index file '{}' size {} is not a multiple of page size {}",
            path.display(),
            file_size,
            page_size
        );

        let page_count = (file_size / page_size as u64) as u32;

        // SAFETY: mapping a file mutably is unsafe because another process
        // could mutate it underneath us. This is sound for index files
        // because:
        // 1. The file is opened read+write by this process alone; index
        //    directories are not meant to be shared between processes.
        // 2. The mapping's lifetime is tied to MmapFile, so it cannot
        //    outlive the file handle.
        // 3. All access goes through page()/page_mut(), which bounds-check
        //    the address.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_size,
            page_count,
        })
    }

    /// Creates (or truncates) an index file with `initial_pages` zeroed
    /// pages.
    pub fn create<P: AsRef<Path>>(path: P, page_size: usize, initial_pages: u32) -> Result<Self> {
        let path = path.as_ref();

        ensure!(initial_pages > 0, "initial page count must be at least 1");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create index file '{}'", path.display()))?;

        let file_size = initial_pages as u64 * page_size as u64;

        file.set_len(file_size)
            .wrap_err_with(|| format!("failed to size '{}' to {} bytes", path.display(), file_size))?;

        // SAFETY: same argument as open(); additionally the file was just
        // created with truncate, so no stale mapping of it can exist.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_size,
            page_count: initial_pages,
        })
    }

    pub fn page(&self, page_no: u32) -> Result<&[u8]> {
        ensure!(
            page_no < self.page_count,
            "page {} out of bounds (page_count={})",
            page_no,
            self.page_count
        );

        let offset = page_no as usize * self.page_size;
        Ok(&self.mmap[offset..offset + self.page_size])
    }

    pub fn page_mut(&mut self, page_no: u32) -> Result<&mut [u8]> {
        ensure!(
            page_no < self.page_count,
            "page {} out of bounds (page_count={})",
            page_no,
            self.page_count
        );

        let offset = page_no as usize * self.page_size;
        Ok(&mut self.mmap[offset..offset + self.page_size])
    }

    /// Extends the file to `new_page_count` pages and remaps. A no-op if
    /// the file is already large enough.
    pub fn grow(&mut self, new_page_count: u32) -> Result<()> {
        if new_page_count <= self.page_count {
            return Ok(());
        }
        self.resize(new_page_count)
    }

    /// Shrinks the file to `new_page_count` pages and remaps.
    pub fn truncate(&mut self, new_page_count: u32) -> Result<()> {
        ensure!(new_page_count > 0, "cannot truncate below one page");
        if new_page_count >= self.page_count {
            return Ok(());
        }
        self.resize(new_page_count)
    }

    fn resize(&mut self, new_page_count: u32) -> Result<()> {
        self.mmap
            .flush()
            .wrap_err("failed to flush mapping before resize")?;

        let new_size = new_page_count as u64 * self.page_size as u64;

        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to resize index file to {} bytes", new_size))?;

        // SAFETY: resize() holds &mut self, so the borrow checker
        // guarantees no page reference survives into the remap. The old
        // mapping was flushed above and is dropped by the assignment.
        self.mmap =
            unsafe { MmapMut::map_mut(&self.file).wrap_err("failed to remap after resize")? };

        self.page_count = new_page_count;

        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to sync mapping to disk")
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    /// Hints the kernel to fault in a page range ahead of a sequential
    /// sweep. Advisory; never fails.
    pub fn prefetch(&self, start_page: u32, count: u32) {
        if start_page >= self.page_count {
            return;
        }

        let end_page = (start_page + count).min(self.page_count);
        let start_offset = start_page as usize * self.page_size;
        let len = (end_page - start_page) as usize * self.page_size;

        #[cfg(unix)]
        // SAFETY: start_page is bounds-checked above and end_page is
        // clamped to page_count, so the advised range lies inside the
        // mapping. madvise(MADV_WILLNEED) is a hint with no aliasing
        // requirements.
        unsafe {
            libc::madvise(
                self.mmap.as_ptr().add(start_offset) as *mut libc::c_void,
                len,
                libc::MADV_WILLNEED,
            );
        }

        #[cfg(not(unix))]
        let _ = (start_offset, len);
    }
}
