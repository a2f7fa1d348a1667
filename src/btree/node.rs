//! # Interior Node Pages
//!
//! An interior node routes lookups: a sorted array of packed
//! `(key, child address)` records after the page header. The kind byte
//! carries the node's depth, and a node of depth `d` only ever points at
//! pages of depth `d - 1`.
//!
//! ## Page Layout
//!
//! ```text
//! +----------------------+
//! | PageHeader (8B)      |  kind = Node(depth), entry count
//! +----------------------+
//! | (K, child) record 0  |  key_size + 4 bytes; key is the sentinel
//! | (K, child) record 1  |
//! | ...                  |
//! +----------------------+
//! | Zero padding         |
//! +----------------------+
//! ```
//!
//! ## The Sentinel
//!
//! Record 0's key is always `K::MIN`. With the sentinel in place the
//! routing rule has no edge cases: the child for a lookup key `k` is the
//! one recorded under the greatest stored key `<= k`, which always
//! exists. Splits and merges keep the invariant mechanically — a split
//! promotes the upper half's first key and stamps `MIN` over it in the
//! new node; a merge rehydrates the right node's sentinel with the
//! separator its parent held for it.
//!
//! ## Sibling Selection
//!
//! Deletion needs a merge partner before descending. `route_with_neighbour`
//! returns the routed entry plus its right neighbour when one exists
//! (`SiblingOrder::Higher`), else the left neighbour
//! (`SiblingOrder::Lower`). Only a single-entry node (the root mid-shrink)
//! has no neighbour to offer.

use std::marker::PhantomData;

use eyre::{bail, ensure, Result};

use crate::config::{Params, CHILD_PTR_SIZE, PAGE_HEADER_SIZE};
use crate::store::{Address, PageHeader, PageKind};
use crate::types::IndexKey;

use super::leaf::SearchResult;

/// Which side the chosen sibling sits on, relative to the routed child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiblingOrder {
    /// The sibling is the routed child's left neighbour.
    Lower,
    /// The sibling is the routed child's right neighbour.
    Higher,
}

/// A routed entry together with the merge partner for its child.
#[derive(Debug, Clone, Copy)]
pub struct RouteWithNeighbour<K> {
    pub index: usize,
    pub main: (K, Address),
    pub neighbour: Option<(K, Address)>,
    pub order: SiblingOrder,
}

#[derive(Debug)]
pub struct Node<'a, K> {
    data: &'a [u8],
    fanout: usize,
    _marker: PhantomData<K>,
}

pub struct NodeMut<'a, K> {
    data: &'a mut [u8],
    fanout: usize,
    _marker: PhantomData<K>,
}

fn validate_node_page<K: IndexKey>(data: &[u8], params: &Params) -> Result<()> {
    ensure!(
        data.len() == params.page_size,
        "invalid page size: {} != {}",
        data.len(),
        params.page_size
    );

    let header = PageHeader::from_bytes(data)?;
    let kind = header.kind()?;
    ensure!(kind.is_node(), "expected node page, got {:?}", kind);

    let end = PAGE_HEADER_SIZE + header.entry_count() * (K::SIZE + CHILD_PTR_SIZE);
    ensure!(
        end <= params.page_size,
        "node entry count {} overruns the page ({} > {})",
        header.entry_count(),
        end,
        params.page_size
    );

    Ok(())
}

impl<'a, K: IndexKey> Node<'a, K> {
    const ENTRY_SIZE: usize = K::SIZE + CHILD_PTR_SIZE;

    pub fn from_page(data: &'a [u8], params: &Params) -> Result<Self> {
        validate_node_page::<K>(data, params)?;
        Ok(Self {
            data,
            fanout: params.fanout,
            _marker: PhantomData,
        })
    }

    fn header(&self) -> &PageHeader {
        PageHeader::from_bytes(self.data).expect("page validated in from_page")
    }

    pub fn depth(&self) -> usize {
        self.header()
            .kind()
            .expect("page validated in from_page")
            .depth()
    }

    pub fn entry_count(&self) -> usize {
        self.header().entry_count()
    }

    fn entry_offset(index: usize) -> usize {
        PAGE_HEADER_SIZE + index * Self::ENTRY_SIZE
    }

    fn key_unchecked(&self, index: usize) -> K {
        let offset = Self::entry_offset(index);
        K::read_from(&self.data[offset..offset + K::SIZE])
    }

    fn child_unchecked(&self, index: usize) -> Address {
        let offset = Self::entry_offset(index) + K::SIZE;
        Address::from_le_bytes(
            self.data[offset..offset + CHILD_PTR_SIZE]
                .try_into()
                .expect("4-byte slice"),
        )
    }

    pub fn key_at(&self, index: usize) -> Result<K> {
        ensure!(
            index < self.entry_count(),
            "node index {} out of bounds (entry_count={})",
            index,
            self.entry_count()
        );
        Ok(self.key_unchecked(index))
    }

    pub fn child_at(&self, index: usize) -> Result<Address> {
        ensure!(
            index < self.entry_count(),
            "node index {} out of bounds (entry_count={})",
            index,
            self.entry_count()
        );
        Ok(self.child_unchecked(index))
    }

    pub fn entry_at(&self, index: usize) -> Result<(K, Address)> {
        Ok((self.key_at(index)?, self.child_unchecked(index)))
    }

    /// The sentinel key, by construction `K::MIN`.
    pub fn first_key(&self) -> Result<K> {
        self.key_at(0)
    }

    /// Copies out all records, in key order.
    pub fn entries(&self) -> Vec<(K, Address)> {
        (0..self.entry_count())
            .map(|i| (self.key_unchecked(i), self.child_unchecked(i)))
            .collect()
    }

    pub fn search(&self, key: &K) -> SearchResult {
        let mut lo = 0;
        let mut hi = self.entry_count();

        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.key_unchecked(mid).cmp(key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return SearchResult::Found(mid),
            }
        }

        SearchResult::NotFound(lo)
    }

    /// Routes a lookup key: the entry with the greatest stored key
    /// `<= key`. The sentinel guarantees such an entry exists.
    pub fn route(&self, key: &K) -> Result<(usize, K, Address)> {
        ensure!(self.entry_count() > 0, "cannot route through an empty node");

        let index = match self.search(key) {
            SearchResult::Found(index) => index,
            SearchResult::NotFound(insertion) => {
                ensure!(
                    insertion > 0,
                    "routing key {:?} sorts below the sentinel",
                    key
                );
                insertion - 1
            }
        };

        Ok((index, self.key_unchecked(index), self.child_unchecked(index)))
    }

    /// Routes a key and also picks the routed child's merge partner:
    /// the right neighbour when the routed entry is not last, else the
    /// left neighbour. A single-entry node has none.
    pub fn route_with_neighbour(&self, key: &K) -> Result<RouteWithNeighbour<K>> {
        let (index, main_key, main_child) = self.route(key)?;
        let count = self.entry_count();

        let (neighbour, order) = if count == 1 {
            (None, SiblingOrder::Higher)
        } else if index + 1 < count {
            (
                Some((self.key_unchecked(index + 1), self.child_unchecked(index + 1))),
                SiblingOrder::Higher,
            )
        } else {
            (
                Some((self.key_unchecked(index - 1), self.child_unchecked(index - 1))),
                SiblingOrder::Lower,
            )
        };

        Ok(RouteWithNeighbour {
            index,
            main: (main_key, main_child),
            neighbour,
            order,
        })
    }

    pub fn overflow(&self) -> bool {
        self.entry_count() > self.fanout
    }

    pub fn underflow(&self) -> bool {
        self.entry_count() < self.fanout / 2
    }
}

impl<'a, K: IndexKey> NodeMut<'a, K> {
    const ENTRY_SIZE: usize = K::SIZE + CHILD_PTR_SIZE;

    /// Resets the page to an empty node of the given depth.
    pub fn init(data: &'a mut [u8], params: &Params, depth: usize) -> Result<Self> {
        ensure!(
            data.len() == params.page_size,
            "invalid page size: {} != {}",
            data.len(),
            params.page_size
        );
        ensure!(
            depth >= 1 && depth <= crate::store::MAX_NODE_DEPTH,
            "node depth {} outside 1..={}",
            depth,
            crate::store::MAX_NODE_DEPTH
        );

        data.fill(0);
        PageHeader::new(PageKind::Node(depth as u8)).write_to(data)?;

        Ok(Self {
            data,
            fanout: params.fanout,
            _marker: PhantomData,
        })
    }

    pub fn from_page(data: &'a mut [u8], params: &Params) -> Result<Self> {
        validate_node_page::<K>(data, params)?;
        Ok(Self {
            data,
            fanout: params.fanout,
            _marker: PhantomData,
        })
    }

    /// Read-only view of the same page.
    pub fn as_node(&self) -> Node<'_, K> {
        Node {
            data: self.data,
            fanout: self.fanout,
            _marker: PhantomData,
        }
    }

    fn set_entry_count(&mut self, count: usize) -> Result<()> {
        PageHeader::from_bytes_mut(self.data)?.set_entry_count(count);
        Ok(())
    }

    fn write_record(&mut self, index: usize, key: &K, child: Address) {
        let offset = PAGE_HEADER_SIZE + index * Self::ENTRY_SIZE;
        key.write_to(&mut self.data[offset..offset + K::SIZE]);
        self.data[offset + K::SIZE..offset + Self::ENTRY_SIZE]
            .copy_from_slice(&child.to_le_bytes());
    }

    /// Inserts a separator in sorted order. A duplicate separator is a
    /// bug in the caller.
    pub fn insert(&mut self, key: &K, child: Address) -> Result<()> {
        match self.as_node().search(key) {
            SearchResult::Found(_) => bail!("separator {:?} already present in node", key),
            SearchResult::NotFound(index) => {
                let count = self.as_node().entry_count();
                let end = PAGE_HEADER_SIZE + (count + 1) * Self::ENTRY_SIZE;
                ensure!(
                    end <= self.data.len(),
                    "node has no room for record {} ({} > {} bytes)",
                    count + 1,
                    end,
                    self.data.len()
                );

                let start = PAGE_HEADER_SIZE + index * Self::ENTRY_SIZE;
                let tail = PAGE_HEADER_SIZE + count * Self::ENTRY_SIZE;
                self.data.copy_within(start..tail, start + Self::ENTRY_SIZE);

                self.write_record(index, key, child);
                self.set_entry_count(count + 1)
            }
        }
    }

    /// Deletes the separator stored exactly under `key`. The separator
    /// must be present.
    pub fn remove_key(&mut self, key: &K) -> Result<()> {
        match self.as_node().search(key) {
            SearchResult::Found(index) => {
                let count = self.as_node().entry_count();
                let start = PAGE_HEADER_SIZE + index * Self::ENTRY_SIZE;
                let tail = PAGE_HEADER_SIZE + count * Self::ENTRY_SIZE;
                self.data.copy_within(start + Self::ENTRY_SIZE..tail, start);

                let new_tail = tail - Self::ENTRY_SIZE;
                self.data[new_tail..tail].fill(0);

                self.set_entry_count(count - 1)
            }
            SearchResult::NotFound(_) => bail!("separator {:?} not present in node", key),
        }
    }

    /// Renames a separator in place; the record keeps its child. Used
    /// after a partial merge moved the boundary between two children.
    pub fn replace(&mut self, old: &K, new: &K) -> Result<()> {
        match self.as_node().search(old) {
            SearchResult::Found(index) => {
                let offset = PAGE_HEADER_SIZE + index * Self::ENTRY_SIZE;
                new.write_to(&mut self.data[offset..offset + K::SIZE]);

                debug_assert!(index == 0 || self.as_node().key_unchecked(index - 1) < *new);
                debug_assert!(
                    index + 1 >= self.as_node().entry_count()
                        || *new < self.as_node().key_unchecked(index + 1)
                );
                Ok(())
            }
            SearchResult::NotFound(_) => bail!("separator {:?} not present in node", old),
        }
    }

    /// Overwrites the key of the record at `index`.
    pub fn set_key_at(&mut self, index: usize, key: &K) -> Result<()> {
        ensure!(
            index < self.as_node().entry_count(),
            "node index {} out of bounds (entry_count={})",
            index,
            self.as_node().entry_count()
        );

        let offset = PAGE_HEADER_SIZE + index * Self::ENTRY_SIZE;
        key.write_to(&mut self.data[offset..offset + K::SIZE]);
        Ok(())
    }

    /// Replaces the page contents with `entries`, which must be sorted
    /// and carry the sentinel at index 0.
    pub fn write_entries(&mut self, entries: &[(K, Address)]) -> Result<()> {
        let end = PAGE_HEADER_SIZE + entries.len() * Self::ENTRY_SIZE;
        ensure!(
            end <= self.data.len(),
            "{} records overrun the node page ({} > {} bytes)",
            entries.len(),
            end,
            self.data.len()
        );

        self.data[PAGE_HEADER_SIZE..].fill(0);
        for (index, (key, child)) in entries.iter().enumerate() {
            debug_assert!(index == 0 || entries[index - 1].0 < *key);
            self.write_record(index, key, *child);
        }
        self.set_entry_count(entries.len())
    }
}
