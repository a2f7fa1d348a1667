//! # Freelist Management
//!
//! Pages released by tree merges and root shrinks are not returned to the
//! filesystem; they are chained into a freelist and handed back out by the
//! next allocation. The freelist is a linked chain of trunk pages, each
//! listing the addresses of dead pages.
//!
//! ## Trunk Page Layout
//!
//! ```text
//! Offset  Size      Description
//! ------  --------  ----------------------------------------
//! 0       8         PageHeader (kind = Free)
//! 8       4         next: address of the next trunk (0 = none)
//! 12      4         count: entries stored in this trunk
//! 16      4*N       addresses of free pages
//! ```
//!
//! ## Push
//!
//! A released page is appended to the head trunk's array. When there is no
//! trunk, or the head trunk is full, the released page *itself* becomes
//! the new head trunk. Trunk pages therefore cost nothing: they are
//! carved out of the garbage they track.
//!
//! ## Pop
//!
//! Allocation pops the head trunk's last entry. A drained trunk is not
//! skipped over but returned as the allocation itself, so every page that
//! enters the freelist eventually leaves it and no address is leaked.
//!
//! ## Persistence
//!
//! Only the head address and total length live in memory (and in the file
//! header); trunk contents are read and written through the mapping on
//! demand. `len` counts listed entries plus the trunk pages themselves.

use eyre::{ensure, Result};
use hashbrown::HashSet;
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::PAGE_HEADER_SIZE;

use super::mmap::MmapFile;
use super::page::{PageHeader, PageKind};

pub const TRUNK_HEADER_SIZE: usize = 8;

/// Entries a single trunk page can list.
pub fn trunk_capacity(page_size: usize) -> usize {
    (page_size - PAGE_HEADER_SIZE - TRUNK_HEADER_SIZE) / 4
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct TrunkHeader {
    next: U32,
    count: U32,
}

impl TrunkHeader {
    pub fn new(next: u32) -> Self {
        Self {
            next: U32::new(next),
            count: U32::new(0),
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= size_of::<Self>(),
            "buffer too small for TrunkHeader: {} < {}",
            data.len(),
            size_of::<Self>()
        );

        Self::ref_from_bytes(&data[..size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to read TrunkHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= size_of::<Self>(),
            "buffer too small for TrunkHeader: {} < {}",
            data.len(),
            size_of::<Self>()
        );

        Self::mut_from_bytes(&mut data[..size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to read TrunkHeader: {:?}", e))
    }

    pub fn next(&self) -> u32 {
        self.next.get()
    }

    pub fn count(&self) -> u32 {
        self.count.get()
    }

    pub fn set_count(&mut self, count: u32) {
        self.count = U32::new(count);
    }
}

#[derive(Debug)]
pub struct Freelist {
    head: u32,
    len: u32,
}

impl Freelist {
    pub fn new() -> Self {
        Self { head: 0, len: 0 }
    }

    pub fn with_head(head: u32, len: u32) -> Self {
        Self { head, len }
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Releases `addr` into the freelist.
    pub fn push(&mut self, file: &mut MmapFile, addr: u32) -> Result<()> {
        let head_has_room = if self.head == 0 {
            false
        } else {
            let page = file.page(self.head)?;
            let trunk = TrunkHeader::from_bytes(&page[PAGE_HEADER_SIZE..])?;
            (trunk.count() as usize) < trunk_capacity(file.page_size())
        };

        if head_has_room {
            let page = file.page_mut(self.head)?;
            let count = {
                let trunk = TrunkHeader::from_bytes(&page[PAGE_HEADER_SIZE..])?;
                trunk.count()
            };

            let entry_offset = PAGE_HEADER_SIZE + TRUNK_HEADER_SIZE + count as usize * 4;
            page[entry_offset..entry_offset + 4].copy_from_slice(&addr.to_le_bytes());

            let trunk = TrunkHeader::from_bytes_mut(&mut page[PAGE_HEADER_SIZE..])?;
            trunk.set_count(count + 1);
        } else {
            // The released page becomes the new head trunk.
            let next = self.head;
            let page = file.page_mut(addr)?;
            page.fill(0);
            PageHeader::new(PageKind::Free).write_to(page)?;
            page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + TRUNK_HEADER_SIZE]
                .copy_from_slice(TrunkHeader::new(next).as_bytes());
            self.head = addr;
        }

        self.len += 1;
        Ok(())
    }

    /// Takes a page back out of the freelist, if any.
    pub fn pop(&mut self, file: &mut MmapFile) -> Result<Option<u32>> {
        if self.head == 0 {
            return Ok(None);
        }

        let page = file.page_mut(self.head)?;
        let (count, next) = {
            let trunk = TrunkHeader::from_bytes(&page[PAGE_HEADER_SIZE..])?;
            (trunk.count(), trunk.next())
        };

        if count > 0 {
            let entry_offset = PAGE_HEADER_SIZE + TRUNK_HEADER_SIZE + (count - 1) as usize * 4;
            let addr = u32::from_le_bytes(
                page[entry_offset..entry_offset + 4]
                    .try_into()
                    .expect("4-byte slice"),
            );

            let trunk = TrunkHeader::from_bytes_mut(&mut page[PAGE_HEADER_SIZE..])?;
            trunk.set_count(count - 1);
            self.len -= 1;

            return Ok(Some(addr));
        }

        // Drained trunk: the trunk page itself is the allocation.
        let drained = self.head;
        self.head = next;
        self.len -= 1;

        Ok(Some(drained))
    }

    /// The complete set of dead pages: every trunk plus every listed
    /// entry. `Store::iter` uses this to skip pages that are not part of
    /// the tree.
    pub fn collect(&self, file: &MmapFile) -> Result<HashSet<u32>> {
        let mut dead = HashSet::with_capacity(self.len as usize);
        let mut trunk_addr = self.head;

        while trunk_addr != 0 {
            ensure!(
                dead.insert(trunk_addr),
                "freelist trunk chain contains a cycle at page {}",
                trunk_addr
            );

            let page = file.page(trunk_addr)?;
            let trunk = TrunkHeader::from_bytes(&page[PAGE_HEADER_SIZE..])?;

            for i in 0..trunk.count() as usize {
                let entry_offset = PAGE_HEADER_SIZE + TRUNK_HEADER_SIZE + i * 4;
                let addr = u32::from_le_bytes(
                    page[entry_offset..entry_offset + 4]
                        .try_into()
                        .expect("4-byte slice"),
                );
                dead.insert(addr);
            }

            trunk_addr = trunk.next();
        }

        Ok(dead)
    }
}

impl Default for Freelist {
    fn default() -> Self {
        Self::new()
    }
}
