//! # Configuration Constants and Index Geometry
//!
//! This module centralizes the page-layout constants and the runtime
//! [`Params`] struct that derives the tree geometry from the key and value
//! widths. Constants that depend on each other are co-located and checked
//! with compile-time assertions to prevent mismatch bugs.
//!
//! ## Layout Relationships
//!
//! ```text
//! DEFAULT_PAGE_SIZE (4096 bytes)
//!       │
//!       ├─> PAGE_HEADER_SIZE (8 bytes, every data page)
//!       │
//!       └─> FILE_HEADER_SIZE (128 bytes, page 0 only)
//!
//! fanout = min(leaf_capacity, node_capacity) - 1
//!       leaf_capacity = (page_size - PAGE_HEADER_SIZE) / (key_size + value_size)
//!       node_capacity = (page_size - PAGE_HEADER_SIZE) / (key_size + CHILD_PTR_SIZE)
//! ```
//!
//! The `- 1` reserves physical room for one extra record: an insert is
//! allowed to push a page to `fanout + 1` entries, which is the overflow
//! state that triggers a split. Without the headroom the overflowing record
//! would have nowhere to live between the insert and the split.
//!
//! ## Overriding the Fanout
//!
//! [`Params::with_fanout`] lowers the fanout below the derived maximum.
//! This exists for tests that want small trees (a fanout of 4 forces splits
//! after five inserts) and is validated against the physical capacity.

use eyre::{ensure, Result};

use crate::types::{IndexKey, IndexValue};

/// Default size of each page in bytes.
/// This is the fundamental unit of I/O; one tree node occupies one page.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Size of the per-page header: kind byte, reserved byte, entry count,
/// four reserved bytes.
pub const PAGE_HEADER_SIZE: usize = 8;

/// Size of the file header occupying the start of page 0.
pub const FILE_HEADER_SIZE: usize = 128;

/// Width of a child page address inside a node record.
pub const CHILD_PTR_SIZE: usize = 4;

/// On-disk format version, written to the file header. Opening a file with
/// a different version is fatal.
pub const FORMAT_VERSION: u32 = 1;

/// Smallest page size the geometry arithmetic supports.
pub const MIN_PAGE_SIZE: usize = 256;

const _: () = assert!(
    FILE_HEADER_SIZE < MIN_PAGE_SIZE,
    "file header must fit inside the smallest page"
);

const _: () = assert!(
    PAGE_HEADER_SIZE < MIN_PAGE_SIZE,
    "page header must fit inside the smallest page"
);

/// Index geometry: page size, record widths and the derived fanout.
///
/// `Params` is validated at construction and then trusted everywhere else;
/// the store persists the geometry in the file header and refuses to open a
/// file whose recorded geometry differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Params {
    pub page_size: usize,
    pub key_size: usize,
    pub value_size: usize,
    pub fanout: usize,
    pub debug: bool,
}

impl Params {
    /// Geometry for `K`/`V` records on [`DEFAULT_PAGE_SIZE`] pages.
    pub fn new<K: IndexKey, V: IndexValue>() -> Result<Self> {
        Self::with_page_size::<K, V>(DEFAULT_PAGE_SIZE)
    }

    /// Geometry for `K`/`V` records on pages of `page_size` bytes.
    pub fn with_page_size<K: IndexKey, V: IndexValue>(page_size: usize) -> Result<Self> {
        ensure!(
            page_size >= MIN_PAGE_SIZE,
            "page size {} below minimum {}",
            page_size,
            MIN_PAGE_SIZE
        );
        ensure!(K::SIZE > 0, "key size must be non-zero");
        ensure!(V::SIZE > 0, "value size must be non-zero");

        let capacity = min_capacity(page_size, K::SIZE, V::SIZE);
        ensure!(
            capacity >= 3,
            "page size {} holds only {} records of {}+{} bytes; need at least 3",
            page_size,
            capacity,
            K::SIZE,
            V::SIZE
        );

        Ok(Self {
            page_size,
            key_size: K::SIZE,
            value_size: V::SIZE,
            fanout: capacity - 1,
            debug: false,
        })
    }

    /// Lowers the fanout below the derived maximum. The physical page must
    /// still hold `fanout + 1` records so the overflow state stays
    /// representable.
    pub fn with_fanout(mut self, fanout: usize) -> Result<Self> {
        let capacity = min_capacity(self.page_size, self.key_size, self.value_size);
        ensure!(fanout >= 2, "fanout {} too small; need at least 2", fanout);
        ensure!(
            fanout + 1 <= capacity,
            "fanout {} exceeds page capacity {} (page_size={})",
            fanout,
            capacity - 1,
            self.page_size
        );
        self.fanout = fanout;
        Ok(self)
    }

    /// Enables per-operation trace logging.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Width of one leaf record.
    pub fn leaf_entry_size(&self) -> usize {
        self.key_size + self.value_size
    }

    /// Width of one node record.
    pub fn node_entry_size(&self) -> usize {
        self.key_size + CHILD_PTR_SIZE
    }

    /// Entry count below which a non-root page underflows.
    pub fn min_entries(&self) -> usize {
        self.fanout / 2
    }
}

fn min_capacity(page_size: usize, key_size: usize, value_size: usize) -> usize {
    let usable = page_size - PAGE_HEADER_SIZE;
    let leaf_capacity = usable / (key_size + value_size);
    let node_capacity = usable / (key_size + CHILD_PTR_SIZE);
    leaf_capacity.min(node_capacity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_derives_fanout_from_page_geometry() {
        let params = Params::new::<u64, u64>().unwrap();

        let leaf_capacity = (DEFAULT_PAGE_SIZE - PAGE_HEADER_SIZE) / 16;
        let node_capacity = (DEFAULT_PAGE_SIZE - PAGE_HEADER_SIZE) / 12;

        assert_eq!(params.fanout, leaf_capacity.min(node_capacity) - 1);
        assert_eq!(params.key_size, 8);
        assert_eq!(params.value_size, 8);
        assert!(!params.debug);
    }

    #[test]
    fn params_node_capacity_can_be_the_bound() {
        // 4-byte keys, 1-byte values: node records (4+4) are wider than
        // leaf records (4+1), so the node capacity limits the fanout.
        let params = Params::with_page_size::<u32, [u8; 1]>(256).unwrap();

        let node_capacity = (256 - PAGE_HEADER_SIZE) / 8;
        assert_eq!(params.fanout, node_capacity - 1);
    }

    #[test]
    fn params_rejects_tiny_pages() {
        let result = Params::with_page_size::<u64, u64>(64);
        assert!(result.is_err());
    }

    #[test]
    fn params_rejects_oversized_records() {
        let result = Params::with_page_size::<[u8; 64], [u8; 64]>(256);
        assert!(result.is_err());
    }

    #[test]
    fn with_fanout_accepts_small_override() {
        let params = Params::new::<u64, u64>().unwrap().with_fanout(4).unwrap();

        assert_eq!(params.fanout, 4);
        assert_eq!(params.min_entries(), 2);
    }

    #[test]
    fn with_fanout_rejects_override_beyond_capacity() {
        let params = Params::new::<u64, u64>().unwrap();
        let capacity_bound = params.fanout;

        let result = params.with_fanout(capacity_bound + 1);
        assert!(result.is_err());
    }

    #[test]
    fn with_fanout_rejects_degenerate_fanout() {
        let params = Params::new::<u64, u64>().unwrap();

        assert!(params.with_fanout(1).is_err());
        assert!(params.with_fanout(0).is_err());
    }

    #[test]
    fn entry_sizes_follow_record_widths() {
        let params = Params::new::<u64, u32>().unwrap();

        assert_eq!(params.leaf_entry_size(), 12);
        assert_eq!(params.node_entry_size(), 12);
    }
}
