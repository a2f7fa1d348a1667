//! # B-Tree Index
//!
//! The tree layer of the crate: page views for leaves and interior
//! nodes, the orchestration that keeps them balanced, the bulk loader,
//! and the open-tree cache.
//!
//! ## Structure
//!
//! Every page is one tree vertex. Leaves hold the bindings; nodes hold
//! routing records whose first key is always the minimum sentinel, so
//! descent never special-cases the leftmost child. All leaves sit at the
//! same depth and every page except the root stays between half-full and
//! full.
//!
//! ```text
//!                [Node, depth 2]
//!                /      |      \
//!        [Node 1]   [Node 1]   [Node 1]
//!        /   |   \     ...        ...
//!   [Leaf] [Leaf] [Leaf]
//! ```
//!
//! ## Modules
//!
//! - `leaf`: packed `(key, value)` pages
//! - `node`: packed `(key, child)` routing pages with the sentinel
//! - `tree`: descent, split/merge rebalancing, the `BTree` facade
//! - `bulk`: sorted-input bottom-up tree construction
//! - `registry`: process-wide cache coalescing opens of one path
//! - `dump`: human-readable page dumps for debugging

mod bulk;
mod dump;
mod leaf;
mod node;
mod registry;
mod tree;

pub use leaf::{Leaf, LeafMut, SearchResult};
pub use node::{Node, NodeMut, RouteWithNeighbour, SiblingOrder};
pub use registry::TreeCache;
pub use tree::BTree;
