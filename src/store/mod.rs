//! # Page Store
//!
//! This module presents an index file as an array of fixed-size pages with
//! allocation, a freelist, a persistent root pointer and a bulk-load
//! migration path. The tree layer above it never touches the filesystem
//! directly.
//!
//! ## File Layout
//!
//! ```text
//! <root>/b.tree
//!
//! Page 0:           128-byte FileHeader, remainder unused
//! Pages 1..next:    data pages (leaf / node / freelist trunk)
//! ```
//!
//! Addresses are zero-based page indexes; address 0 is reserved for the
//! header page, so the tree only ever sees addresses `>= 1`.
//!
//! ## Page Access and Leases
//!
//! `page()` and `page_mut()` return borrows into the shared mapping. The
//! borrow *is* the page lease: it is released on every exit path by the
//! borrow checker, a mutation reaches the mapping immediately, and
//! `flush()` is the durability barrier that carries everything mutated
//! since the last flush to disk together with the header.
//!
//! ## Allocation
//!
//! `alloc` prefers the freelist and falls back to the `next_page`
//! watermark, doubling the mapping when the watermark passes the end of
//! the file. Freed pages go back through [`Freelist`] and are skipped by
//! `iter`.
//!
//! ## Migration
//!
//! Bulk load wants to lay a whole tree out page after page without going
//! through alloc/free bookkeeping. [`Store::begin_migration`] hands out a
//! writer that appends pages sequentially from address 1; nothing the
//! writer does is visible to a reopened file until `finish(root)` commits
//! the new root, watermark and an empty freelist in one header update.
//!
//! ## Error Semantics
//!
//! I/O failures, bad magic/version/geometry and unknown kind bytes are
//! fatal: they abort the operation and the store should be considered
//! poisoned. Only bounds errors on explicitly caller-supplied addresses
//! are plain bugs on the caller's side.

mod freelist;
mod header;
mod mmap;
mod page;

pub use freelist::{Freelist, TrunkHeader, TRUNK_HEADER_SIZE};
pub use header::{FileHeader, INDEX_MAGIC};
pub use mmap::MmapFile;
pub use page::{PageHeader, PageKind, KIND_FREE, MAX_NODE_DEPTH};

use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use tracing::{debug, trace};
use zerocopy::IntoBytes;

use crate::config::{Params, FILE_HEADER_SIZE};

/// Zero-based page index within the index file.
pub type Address = u32;

/// Name of the index file inside the tree's root directory.
pub const INDEX_FILE_NAME: &str = "b.tree";

#[derive(Debug)]
pub struct Store {
    file: MmapFile,
    params: Params,
    root_dir: PathBuf,
    root: Address,
    next_page: Address,
    freelist: Freelist,
}

impl Store {
    /// Opens `root_dir/b.tree`, creating the directory and the file if
    /// absent. A fresh file starts as a single empty leaf root at
    /// address 1.
    pub fn open<P: AsRef<Path>>(root_dir: P, params: Params) -> Result<Self> {
        let root_dir = root_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&root_dir)
            .wrap_err_with(|| format!("failed to create index directory '{}'", root_dir.display()))?;

        let path = root_dir.join(INDEX_FILE_NAME);
        let exists = path
            .metadata()
            .map(|metadata| metadata.len() > 0)
            .unwrap_or(false);

        if !exists {
            let file = MmapFile::create(&path, params.page_size, 2)?;
            let mut store = Self {
                file,
                params,
                root_dir,
                root: 1,
                next_page: 2,
                freelist: Freelist::new(),
            };
            store.stamp_page(1, PageKind::Leaf)?;
            store.write_header()?;
            store.file.sync()?;
            debug!(path = %path.display(), "created index file");
            return Ok(store);
        }

        let file = MmapFile::open(&path, params.page_size)?;
        let (root, next_page, freelist_head, freelist_len) = {
            let page0 = file.page(0)?;
            let header = FileHeader::from_bytes_checked(&page0[..FILE_HEADER_SIZE], &params)?;
            (
                header.root(),
                header.next_page(),
                header.freelist_head(),
                header.freelist_len(),
            )
        };

        ensure!(
            next_page >= 2 && next_page as u64 <= file.page_count() as u64,
            "corrupt header: next_page {} outside file of {} pages",
            next_page,
            file.page_count()
        );
        ensure!(
            root >= 1 && root < next_page,
            "corrupt header: root {} outside allocated range 1..{}",
            root,
            next_page
        );
        ensure!(
            freelist_head < next_page,
            "corrupt header: freelist head {} outside allocated range",
            freelist_head
        );

        debug!(path = %path.display(), root, next_page, "opened index file");

        Ok(Self {
            file,
            params,
            root_dir,
            root,
            next_page,
            freelist: Freelist::with_head(freelist_head, freelist_len),
        })
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Borrows a data page read-only.
    pub fn page(&self, addr: Address) -> Result<&[u8]> {
        ensure!(
            addr >= 1 && addr < self.next_page,
            "page {} outside allocated range 1..{}",
            addr,
            self.next_page
        );
        self.file.page(addr)
    }

    /// Borrows a data page for mutation.
    pub fn page_mut(&mut self, addr: Address) -> Result<&mut [u8]> {
        ensure!(
            addr >= 1 && addr < self.next_page,
            "page {} outside allocated range 1..{}",
            addr,
            self.next_page
        );
        self.file.page_mut(addr)
    }

    /// The kind of the page at `addr`.
    pub fn page_kind(&self, addr: Address) -> Result<PageKind> {
        PageHeader::from_bytes(self.page(addr)?)?.kind()
    }

    pub fn root(&self) -> Address {
        self.root
    }

    /// Replaces the root pointer. This is the only way the root changes.
    pub fn reroot(&mut self, addr: Address) -> Result<()> {
        ensure!(
            addr >= 1 && addr < self.next_page,
            "cannot reroot to unallocated page {}",
            addr
        );
        self.root = addr;
        self.write_header()
    }

    /// Obtains a zeroed page stamped with `kind`, preferring the freelist
    /// over extending the file.
    pub fn alloc(&mut self, kind: PageKind) -> Result<Address> {
        let addr = match self.freelist.pop(&mut self.file)? {
            Some(addr) => addr,
            None => {
                let addr = self.next_page;
                self.next_page += 1;
                if addr >= self.file.page_count() {
                    let target = (self.file.page_count() * 2).max(addr + 1);
                    self.file.grow(target)?;
                }
                addr
            }
        };

        self.stamp_page(addr, kind)?;
        self.write_header()?;

        if self.params.debug {
            trace!(addr, ?kind, "allocated page");
        }

        Ok(addr)
    }

    /// Releases a page into the freelist.
    pub fn free(&mut self, addr: Address) -> Result<()> {
        ensure!(
            addr >= 1 && addr < self.next_page,
            "cannot free unallocated page {}",
            addr
        );
        ensure!(addr != self.root, "cannot free the root page {}", addr);

        self.freelist.push(&mut self.file, addr)?;
        self.write_header()?;

        if self.params.debug {
            trace!(addr, "freed page");
        }

        Ok(())
    }

    /// Calls `f` on every live page in address order, skipping freelist
    /// trunks and their listed members.
    pub fn iter<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(Address, &[u8]) -> Result<()>,
    {
        let dead = self.freelist.collect(&self.file)?;
        self.file.prefetch(1, self.next_page.saturating_sub(1));

        for addr in 1..self.next_page {
            if dead.contains(&addr) {
                continue;
            }
            f(addr, self.file.page(addr)?)?;
        }

        Ok(())
    }

    /// Durability barrier: persists the header and every page mutated
    /// since the last flush.
    pub fn flush(&mut self) -> Result<()> {
        self.write_header()?;
        self.file.sync()
    }

    /// Resets the store to a single empty leaf root and an empty
    /// freelist, truncating the file.
    pub fn clear(&mut self) -> Result<()> {
        self.file.truncate(2)?;
        self.root = 1;
        self.next_page = 2;
        self.freelist = Freelist::new();
        self.stamp_page(1, PageKind::Leaf)?;
        self.write_header()?;
        self.file.sync()?;

        debug!(path = %self.root_dir.display(), "cleared index");
        Ok(())
    }

    /// Flushes and releases the file handle.
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        debug!(path = %self.root_dir.display(), "closed index file");
        Ok(())
    }

    /// Starts a bulk-load migration. See the module docs.
    pub fn begin_migration(&mut self) -> Migration<'_> {
        Migration {
            store: self,
            next: 1,
        }
    }

    fn stamp_page(&mut self, addr: Address, kind: PageKind) -> Result<()> {
        let page = self.file.page_mut(addr)?;
        page.fill(0);
        PageHeader::new(kind).write_to(page)
    }

    fn write_header(&mut self) -> Result<()> {
        let mut header = FileHeader::new(&self.params);
        header.set_root(self.root);
        header.set_next_page(self.next_page);
        header.set_freelist(self.freelist.head(), self.freelist.len());

        let page0 = self.file.page_mut(0)?;
        page0[..FILE_HEADER_SIZE].copy_from_slice(header.as_bytes());
        Ok(())
    }
}

/// Sequential page writer for bulk loads. Pages are appended from address
/// 1; nothing is committed until [`Migration::finish`].
#[derive(Debug)]
pub struct Migration<'a> {
    store: &'a mut Store,
    next: Address,
}

impl Migration<'_> {
    /// Address the next `write_page` call will use.
    pub fn next_addr(&self) -> Address {
        self.next
    }

    /// Appends one page, zeroed, then filled by `fill`.
    pub fn write_page<F>(&mut self, fill: F) -> Result<Address>
    where
        F: FnOnce(&mut [u8]) -> Result<()>,
    {
        let addr = self.next;
        self.next += 1;

        if addr >= self.store.file.page_count() {
            let target = (self.store.file.page_count() * 2).max(addr + 1);
            self.store.file.grow(target)?;
        }

        let page = self.store.file.page_mut(addr)?;
        page.fill(0);
        fill(page)?;

        Ok(addr)
    }

    /// Commits the migration: new watermark, new root, empty freelist,
    /// all in one header update, then flushes.
    pub fn finish(self, root: Address) -> Result<()> {
        ensure!(
            root >= 1 && root < self.next,
            "migration root {} was never written (next={})",
            root,
            self.next
        );

        self.store.root = root;
        self.store.next_page = self.next;
        self.store.freelist = Freelist::new();
        self.store.write_header()?;
        self.store.file.sync()?;

        debug!(root, pages = self.next - 1, "migration committed");
        Ok(())
    }
}
