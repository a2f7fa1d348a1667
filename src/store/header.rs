//! # File Header
//!
//! The first 128 bytes of page 0 hold the file header: magic bytes, format
//! version, the record geometry the file was built with, the root address,
//! the allocation watermark and the freelist anchor. The remainder of page
//! 0 is unused; data pages start at address 1.
//!
//! ## Header Layout (128 bytes)
//!
//! ```text
//! Offset  Size  Field          Description
//! ------  ----  -------------  -------------------------------------
//! 0       16    magic          b"arbordb index\0\0\0"
//! 16      4     version        On-disk format version
//! 20      4     page_size      Page size the file was built with
//! 24      4     key_size       Encoded key width
//! 28      4     value_size     Encoded value width
//! 32      4     root           Address of the root page
//! 36      4     next_page      First never-allocated address
//! 40      4     freelist_head  First freelist trunk page (0 = empty)
//! 44      4     freelist_len   Total free pages across all trunks
//! 48      80    reserved       Zero
//! ```
//!
//! All multi-byte fields are little-endian. Opening a file whose magic,
//! version or geometry disagrees with the caller's [`Params`] is fatal:
//! record offsets are pure arithmetic over the geometry, so a mismatch
//! would silently misread every page.
//!
//! [`Params`]: crate::config::Params

use eyre::{ensure, Result};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{Params, FILE_HEADER_SIZE, FORMAT_VERSION};

pub const INDEX_MAGIC: &[u8; 16] = b"arbordb index\0\0\0";

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileHeader {
    magic: [u8; 16],
    version: U32,
    page_size: U32,
    key_size: U32,
    value_size: U32,
    root: U32,
    next_page: U32,
    freelist_head: U32,
    freelist_len: U32,
    reserved: [u8; 80],
}

const _: () = assert!(size_of::<FileHeader>() == FILE_HEADER_SIZE);

impl FileHeader {
    /// A header for a freshly created file: root leaf at page 1, nothing
    /// allocated beyond it, empty freelist.
    pub fn new(params: &Params) -> Self {
        Self {
            magic: *INDEX_MAGIC,
            version: U32::new(FORMAT_VERSION),
            page_size: U32::new(params.page_size as u32),
            key_size: U32::new(params.key_size as u32),
            value_size: U32::new(params.value_size as u32),
            root: U32::new(1),
            next_page: U32::new(2),
            freelist_head: U32::new(0),
            freelist_len: U32::new(0),
            reserved: [0u8; 80],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for FileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );

        let header = Self::ref_from_bytes(&bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse FileHeader: {:?}", e))?;

        ensure!(
            &header.magic == INDEX_MAGIC,
            "invalid magic bytes in index file"
        );

        ensure!(
            header.version.get() == FORMAT_VERSION,
            "unsupported index format version: {} (expected {})",
            header.version.get(),
            FORMAT_VERSION
        );

        Ok(header)
    }

    /// Parses the header and checks it against the caller's geometry.
    pub fn from_bytes_checked<'a>(bytes: &'a [u8], params: &Params) -> Result<&'a Self> {
        let header = Self::from_bytes(bytes)?;

        ensure!(
            header.page_size() == params.page_size,
            "page size mismatch: file has {}, params want {}",
            header.page_size(),
            params.page_size
        );
        ensure!(
            header.key_size() == params.key_size,
            "key size mismatch: file has {}, params want {}",
            header.key_size(),
            params.key_size
        );
        ensure!(
            header.value_size() == params.value_size,
            "value size mismatch: file has {}, params want {}",
            header.value_size(),
            params.value_size
        );

        Ok(header)
    }

    pub fn version(&self) -> u32 {
        self.version.get()
    }

    pub fn page_size(&self) -> usize {
        self.page_size.get() as usize
    }

    pub fn key_size(&self) -> usize {
        self.key_size.get() as usize
    }

    pub fn value_size(&self) -> usize {
        self.value_size.get() as usize
    }

    pub fn root(&self) -> u32 {
        self.root.get()
    }

    pub fn set_root(&mut self, addr: u32) {
        self.root = U32::new(addr);
    }

    pub fn next_page(&self) -> u32 {
        self.next_page.get()
    }

    pub fn set_next_page(&mut self, addr: u32) {
        self.next_page = U32::new(addr);
    }

    pub fn freelist_head(&self) -> u32 {
        self.freelist_head.get()
    }

    pub fn freelist_len(&self) -> u32 {
        self.freelist_len.get()
    }

    pub fn set_freelist(&mut self, head: u32, len: u32) {
        self.freelist_head = U32::new(head);
        self.freelist_len = U32::new(len);
    }
}
