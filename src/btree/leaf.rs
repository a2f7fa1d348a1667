//! # Leaf Pages
//!
//! A leaf holds the index's actual bindings: a sorted array of packed
//! `(key, value)` records directly after the page header.
//!
//! ## Page Layout
//!
//! ```text
//! +----------------------+
//! | PageHeader (8B)      |  kind = Leaf, entry count
//! +----------------------+
//! | (K, V) record 0      |  key_size + value_size bytes
//! | (K, V) record 1      |
//! | ...                  |
//! +----------------------+
//! | Zero padding         |
//! +----------------------+
//! ```
//!
//! Records are fixed-width, so record `i` lives at a computed offset and
//! lookups are a plain binary search over decoded keys. Keys within a
//! leaf are strictly increasing.
//!
//! ## Views
//!
//! [`Leaf`] borrows a page read-only; [`LeafMut`] borrows it for
//! mutation. Both validate the kind byte and that the declared entry
//! count fits the page before handing out accessors, so the accessors
//! themselves never read out of bounds.
//!
//! ## Overflow and Underflow
//!
//! A leaf overflows when its count exceeds the fanout and underflows when
//! it drops below half the fanout (the root leaf is exempt; the tree
//! layer enforces that). The page physically fits one record more than
//! the fanout, which is exactly the room the overflow state needs between
//! an insert and the split that follows it.

use std::marker::PhantomData;

use eyre::{ensure, Result};

use crate::config::{Params, PAGE_HEADER_SIZE};
use crate::store::{PageHeader, PageKind};
use crate::types::{IndexKey, IndexValue};

/// Outcome of a key search within a page: the key's index, or the index
/// at which it would be inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    Found(usize),
    NotFound(usize),
}

#[derive(Debug)]
pub struct Leaf<'a, K, V> {
    data: &'a [u8],
    fanout: usize,
    _marker: PhantomData<(K, V)>,
}

pub struct LeafMut<'a, K, V> {
    data: &'a mut [u8],
    fanout: usize,
    _marker: PhantomData<(K, V)>,
}

fn validate_leaf_page<K: IndexKey, V: IndexValue>(data: &[u8], params: &Params) -> Result<()> {
    ensure!(
        data.len() == params.page_size,
        "invalid page size: {} != {}",
        data.len(),
        params.page_size
    );

    let header = PageHeader::from_bytes(data)?;
    let kind = header.kind()?;
    ensure!(kind.is_leaf(), "expected leaf page, got {:?}", kind);

    let end = PAGE_HEADER_SIZE + header.entry_count() * (K::SIZE + V::SIZE);
    ensure!(
        end <= params.page_size,
        "leaf entry count {} overruns the page ({} > {})",
        header.entry_count(),
        end,
        params.page_size
    );

    Ok(())
}

impl<'a, K: IndexKey, V: IndexValue> Leaf<'a, K, V> {
    const ENTRY_SIZE: usize = K::SIZE + V::SIZE;

    pub fn from_page(data: &'a [u8], params: &Params) -> Result<Self> {
        validate_leaf_page::<K, V>(data, params)?;
        Ok(Self {
            data,
            fanout: params.fanout,
            _marker: PhantomData,
        })
    }

    pub fn entry_count(&self) -> usize {
        PageHeader::from_bytes(self.data)
            .expect("page validated in from_page")
            .entry_count()
    }

    fn entry_offset(index: usize) -> usize {
        PAGE_HEADER_SIZE + index * Self::ENTRY_SIZE
    }

    fn key_unchecked(&self, index: usize) -> K {
        let offset = Self::entry_offset(index);
        K::read_from(&self.data[offset..offset + K::SIZE])
    }

    fn value_unchecked(&self, index: usize) -> V {
        let offset = Self::entry_offset(index) + K::SIZE;
        V::read_from(&self.data[offset..offset + V::SIZE])
    }

    pub fn key_at(&self, index: usize) -> Result<K> {
        ensure!(
            index < self.entry_count(),
            "leaf index {} out of bounds (entry_count={})",
            index,
            self.entry_count()
        );
        Ok(self.key_unchecked(index))
    }

    pub fn value_at(&self, index: usize) -> Result<V> {
        ensure!(
            index < self.entry_count(),
            "leaf index {} out of bounds (entry_count={})",
            index,
            self.entry_count()
        );
        Ok(self.value_unchecked(index))
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

    pub fn find(&self, key: &K) -> Option<V> {
        match self.search(key) {
            SearchResult::Found(index) => Some(self.value_unchecked(index)),
            SearchResult::NotFound(_) => None,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        matches!(self.search(key), SearchResult::Found(_))
    }

    /// The smallest key in the leaf.
    pub fn first_key(&self) -> Result<K> {
        self.key_at(0)
    }

    /// Copies out all records, in key order.
    pub fn entries(&self) -> Vec<(K, V)> {
        (0..self.entry_count())
            .map(|i| (self.key_unchecked(i), self.value_unchecked(i)))
            .collect()
    }

    pub fn overflow(&self) -> bool {
        self.entry_count() > self.fanout
    }

    pub fn underflow(&self) -> bool {
        self.entry_count() < self.fanout / 2
    }
}

impl<'a, K: IndexKey, V: IndexValue> LeafMut<'a, K, V> {
    const ENTRY_SIZE: usize = K::SIZE + V::SIZE;

    /// Resets the page to an empty leaf and returns the view.
    pub fn init(data: &'a mut [u8], params: &Params) -> Result<Self> {
        ensure!(
            data.len() == params.page_size,
            "invalid page size: {} != {}",
            data.len(),
            params.page_size
        );

        data.fill(0);
        PageHeader::new(PageKind::Leaf).write_to(data)?;

        Ok(Self {
            data,
            fanout: params.fanout,
            _marker: PhantomData,
        })
    }

    pub fn from_page(data: &'a mut [u8], params: &Params) -> Result<Self> {
        validate_leaf_page::<K, V>(data, params)?;
        Ok(Self {
            data,
            fanout: params.fanout,
            _marker: PhantomData,
        })
    }

    /// Read-only view of the same page.
    pub fn as_leaf(&self) -> Leaf<'_, K, V> {
        Leaf {
            data: self.data,
            fanout: self.fanout,
            _marker: PhantomData,
        }
    }

    fn set_entry_count(&mut self, count: usize) -> Result<()> {
        PageHeader::from_bytes_mut(self.data)?.set_entry_count(count);
        Ok(())
    }

    fn write_record(&mut self, index: usize, key: &K, value: &V) {
        let offset = PAGE_HEADER_SIZE + index * Self::ENTRY_SIZE;
        key.write_to(&mut self.data[offset..offset + K::SIZE]);
        value.write_to(&mut self.data[offset + K::SIZE..offset + Self::ENTRY_SIZE]);
    }

    /// Insert-or-replace at the sorted position. Returns `true` when the
    /// key was new.
    pub fn insert(&mut self, key: &K, value: &V) -> Result<bool> {
        match self.as_leaf().search(key) {
            SearchResult::Found(index) => {
                let offset = PAGE_HEADER_SIZE + index * Self::ENTRY_SIZE + K::SIZE;
                value.write_to(&mut self.data[offset..offset + V::SIZE]);
                Ok(false)
            }
            SearchResult::NotFound(index) => {
                let count = self.as_leaf().entry_count();
                let end = PAGE_HEADER_SIZE + (count + 1) * Self::ENTRY_SIZE;
                ensure!(
                    end <= self.data.len(),
                    "leaf has no room for record {} ({} > {} bytes)",
                    count + 1,
                    end,
                    self.data.len()
                );

                let start = PAGE_HEADER_SIZE + index * Self::ENTRY_SIZE;
                let tail = PAGE_HEADER_SIZE + count * Self::ENTRY_SIZE;
                self.data.copy_within(start..tail, start + Self::ENTRY_SIZE);

                self.write_record(index, key, value);
                self.set_entry_count(count + 1)?;
                Ok(true)
            }
        }
    }

    /// Deletes `key` if present. Returns `true` when a record was
    /// removed; an absent key is a no-op.
    pub fn remove(&mut self, key: &K) -> Result<bool> {
        match self.as_leaf().search(key) {
            SearchResult::Found(index) => {
                let count = self.as_leaf().entry_count();
                let start = PAGE_HEADER_SIZE + index * Self::ENTRY_SIZE;
                let tail = PAGE_HEADER_SIZE + count * Self::ENTRY_SIZE;
                self.data.copy_within(start + Self::ENTRY_SIZE..tail, start);

                // Keep the dead tail zeroed.
                let new_tail = tail - Self::ENTRY_SIZE;
                self.data[new_tail..tail].fill(0);

                self.set_entry_count(count - 1)?;
                Ok(true)
            }
            SearchResult::NotFound(_) => Ok(false),
        }
    }

    /// Replaces the page contents with `entries`, which must be sorted.
    pub fn write_entries(&mut self, entries: &[(K, V)]) -> Result<()> {
        let end = PAGE_HEADER_SIZE + entries.len() * Self::ENTRY_SIZE;
        ensure!(
            end <= self.data.len(),
            "{} records overrun the leaf page ({} > {} bytes)",
            entries.len(),
            end,
            self.data.len()
        );

        self.data[PAGE_HEADER_SIZE..].fill(0);
        for (index, (key, value)) in entries.iter().enumerate() {
            debug_assert!(index == 0 || entries[index - 1].0 < *key);
            self.write_record(index, key, value);
        }
        self.set_entry_count(entries.len())
    }
}
