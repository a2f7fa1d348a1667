//! # arbordb - Embedded On-Disk B-Tree Index
//!
//! arbordb is a persistent, ordered map from fixed-size keys to fixed-size
//! values, backed by a single memory-mapped file of fixed-size pages. It is
//! the index layer of a storage engine distilled into a standalone crate:
//! no SQL, no transactions, no background threads.
//!
//! ## Quick Start
//!
//! ```ignore
//! use arbordb::{BTree, Params};
//!
//! let params = Params::new::<u64, u64>()?;
//! let tree = BTree::<u64, u64>::create("./myindex", params)?;
//!
//! tree.add(&1, &10)?;
//! tree.add(&2, &20)?;
//! assert_eq!(tree.find(&2)?, Some(20));
//!
//! tree.flush()?;
//! tree.close()?;
//! ```
//!
//! ## Architecture
//!
//! arbordb uses a layered architecture:
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │      Public API (BTree handle)       │
//! ├─────────────────────────────────────┤
//! │  Tree Orchestration (descent, split, │
//! │  merge, root growth/shrink, bulk)    │
//! ├─────────────────────────────────────┤
//! │   Leaf / Node Page Views (packed     │
//! │   fixed-size records, binary search) │
//! ├─────────────────────────────────────┤
//! │   Store (alloc/free, freelist,       │
//! │   root pointer, migration writer)    │
//! ├─────────────────────────────────────┤
//! │     Memory-Mapped File I/O           │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! Each tree lives in its own directory:
//!
//! ```text
//! index_dir/
//! └── b.tree        # header page + data pages
//! ```
//!
//! Page 0 holds the 128-byte file header (magic, version, geometry, root
//! address, freelist head). Data pages start at address 1; every data page
//! begins with a kind byte (leaf, node-of-depth-N, or freelist trunk) and
//! an entry count, followed by packed fixed-width records.
//!
//! ## Keys and Values
//!
//! Keys and values are user types implementing [`IndexKey`] and
//! [`IndexValue`]: a fixed byte size, a codec, and (for keys) a total order
//! plus a minimum sentinel. Impls for `u32`, `u64`, `i64` and `[u8; N]` are
//! provided. Because record widths are compile-time constants, page
//! capacity and tree fanout are derived directly from the page size.
//!
//! ## Multi-Instance Opens
//!
//! Opening the same directory twice yields the *same* tree: opens are
//! coalesced through a process-wide cache keyed by canonical path, with an
//! instance count so the file is flushed and closed only when the last
//! handle calls [`BTree::close`].
//!
//! ## Module Overview
//!
//! - [`store`]: memory-mapped page store, freelist, header, migration
//! - [`btree`]: leaf/node page views and the tree orchestration
//! - [`config`]: page-layout constants and the [`Params`] geometry
//! - [`types`]: the `IndexKey` / `IndexValue` codec traits

pub mod btree;
pub mod config;
pub mod store;
pub mod types;

pub use btree::{BTree, TreeCache};
pub use config::Params;
pub use store::Address;
pub use types::{IndexKey, IndexValue};
