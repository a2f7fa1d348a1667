//! # B-Tree Orchestration
//!
//! This module ties the page store and the leaf/node views together into
//! the user-facing ordered map. It owns descent, split propagation, merge
//! rebalancing, root growth and shrink, and the multi-instance open path.
//!
//! ## Handles and Sharing
//!
//! A [`BTree`] is a cheap handle over shared state. Opens of the same
//! canonical directory coalesce through a [`TreeCache`]: the second open
//! returns a handle to the same store with an instance count bumped, and
//! the file is flushed and closed only when the last handle calls
//! [`BTree::close`]. A mutex serializes all operations on one tree;
//! operations run to completion without internal suspension points.
//!
//! ## Insert Algorithm
//!
//! ```text
//! 1. Descend from the root, recording the node path
//! 2. Insert-or-replace in the leaf
//! 3. If the leaf overflows: split it, promote the new leaf's first key
//! 4. Walk the path upward, inserting the promoted separator; split any
//!    node that overflows and keep promoting
//! 5. If the root itself split: allocate a new root one level deeper
//!    holding (MIN, old_root) and (promoted, new_sibling)
//! ```
//!
//! ## Delete Algorithm
//!
//! ```text
//! 1. Descend, recording at every node the routed entry AND a sibling
//!    (right neighbour preferred, left at the last entry)
//! 2. Remove from the leaf; stop unless it underflows (root leaf exempt)
//! 3. Merge the underflowing child with the recorded sibling, always
//!    keeping the left page:
//!      - Total merge: right page freed, its separator removed from the
//!        parent
//!      - Partial merge: records redistributed, the right page's
//!        separator renamed to its new first key
//! 4. If the parent now underflows, repeat one level up
//! 5. Root shrink: a root node left with a single entry is replaced by
//!    its only child
//! ```
//!
//! Splits and merges read the affected records out of the page and
//! rewrite both pages from the combined, redistributed array; with
//! fixed-width records that costs one bounded copy and keeps the page
//! mutation paths trivially correct.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{bail, ensure, eyre, Result, WrapErr};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::config::Params;
use crate::store::{Address, PageHeader, PageKind, Store, MAX_NODE_DEPTH};
use crate::types::{IndexKey, IndexValue};

use super::bulk;
use super::dump;
use super::leaf::{Leaf, LeafMut};
use super::node::{Node, NodeMut, RouteWithNeighbour, SiblingOrder};
use super::registry::TreeCache;

/// A persistent, ordered map from fixed-size keys to fixed-size values.
///
/// Handles are obtained with [`BTree::open`] (or [`BTree::bulk_load`])
/// and released with [`BTree::close`].
pub struct BTree<K: IndexKey, V: IndexValue> {
    shared: Arc<TreeShared<K, V>>,
}

struct TreeShared<K, V> {
    path: PathBuf,
    state: Mutex<TreeState>,
    _marker: PhantomData<fn() -> (K, V)>,
}

struct TreeState {
    store: Option<Store>,
    instances: u32,
}

impl<K: IndexKey, V: IndexValue> BTree<K, V> {
    /// Opens (or creates) the tree rooted at `root_dir`, coalescing with
    /// any live handle to the same directory via the global cache.
    pub fn open<P: AsRef<Path>>(root_dir: P, params: Params) -> Result<Self> {
        Self::open_with_cache(root_dir, params, TreeCache::global())
    }

    /// Like [`BTree::open`], but coalescing through a caller-supplied
    /// cache.
    pub fn open_with_cache<P: AsRef<Path>>(
        root_dir: P,
        params: Params,
        cache: &Arc<TreeCache>,
    ) -> Result<Self> {
        let path = canonical_root(root_dir.as_ref())?;
        let mut map = cache.lock();

        if let Some(entry) = map.get(&path) {
            let shared = entry
                .clone()
                .downcast::<TreeShared<K, V>>()
                .map_err(|_| {
                    eyre!(
                        "tree at '{}' is already open with a different key/value type",
                        path.display()
                    )
                })?;

            {
                let mut state = shared.state.lock();
                let store = state
                    .store
                    .as_ref()
                    .ok_or_else(|| eyre!("tree at '{}' is closed", path.display()))?;
                ensure!(
                    store.params() == &params,
                    "tree at '{}' is already open with different params",
                    path.display()
                );
                state.instances += 1;
            }

            trace!(path = %path.display(), "coalesced open");
            return Ok(Self { shared });
        }

        let store = Store::open(&path, params)?;
        let shared = Arc::new(TreeShared {
            path: path.clone(),
            state: Mutex::new(TreeState {
                store: Some(store),
                instances: 1,
            }),
            _marker: PhantomData,
        });

        map.insert(path, shared.clone() as Arc<dyn std::any::Any + Send + Sync>);
        Ok(Self { shared })
    }

    /// Builds a tree of `count` bindings read in strictly increasing key
    /// order, laying pages out contiguously, then opens it.
    pub fn bulk_load<P, F>(root_dir: P, params: Params, count: u64, read: F) -> Result<Self>
    where
        P: AsRef<Path>,
        F: FnMut() -> Result<(K, V)>,
    {
        Self::bulk_load_with_cache(root_dir, params, count, read, TreeCache::global())
    }

    /// Like [`BTree::bulk_load`], with a caller-supplied cache.
    pub fn bulk_load_with_cache<P, F>(
        root_dir: P,
        params: Params,
        count: u64,
        read: F,
        cache: &Arc<TreeCache>,
    ) -> Result<Self>
    where
        P: AsRef<Path>,
        F: FnMut() -> Result<(K, V)>,
    {
        let path = canonical_root(root_dir.as_ref())?;
        let mut map = cache.lock();

        ensure!(
            !map.contains_key(&path),
            "cannot bulk-load '{}' while it is open",
            path.display()
        );

        let mut store = Store::open(&path, params)?;
        bulk::build::<K, V>(&mut store, count, read)?;

        let shared = Arc::new(TreeShared {
            path: path.clone(),
            state: Mutex::new(TreeState {
                store: Some(store),
                instances: 1,
            }),
            _marker: PhantomData,
        });

        map.insert(path, shared.clone() as Arc<dyn std::any::Any + Send + Sync>);
        Ok(Self { shared })
    }

    /// Releases this handle. The file is flushed and closed, and the tree
    /// evicted from every cache, when the last handle is released.
    pub fn close(&self) -> Result<()> {
        let store_to_close = {
            let mut state = self.shared.state.lock();
            ensure!(
                state.store.is_some(),
                "tree at '{}' is already closed",
                self.shared.path.display()
            );
            state.instances -= 1;
            if state.instances == 0 {
                state.store.take()
            } else {
                None
            }
        };

        if let Some(store) = store_to_close {
            TreeCache::evict_everywhere(&self.shared.path);
            store.close()?;
            debug!(path = %self.shared.path.display(), "closed tree");
        }

        Ok(())
    }

    /// Durability barrier: everything inserted or removed before this
    /// call is on disk when it returns.
    pub fn flush(&self) -> Result<()> {
        self.with_store(|store| store.flush())
    }

    /// Resets the tree to empty.
    pub fn clear(&self) -> Result<()> {
        self.with_store(|store| store.clear())
    }

    /// Looks up `key`. `Ok(None)` when absent.
    pub fn find(&self, key: &K) -> Result<Option<V>> {
        self.with_store(|store| {
            let (leaf_addr, _) = descend(store, key)?;
            let leaf = Leaf::<K, V>::from_page(store.page(leaf_addr)?, store.params())?;
            Ok(leaf.find(key))
        })
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &K) -> Result<bool> {
        self.with_store(|store| {
            let (leaf_addr, _) = descend(store, key)?;
            let leaf = Leaf::<K, V>::from_page(store.page(leaf_addr)?, store.params())?;
            Ok(leaf.contains(key))
        })
    }

    /// Insert-or-replace.
    pub fn insert(&self, key: &K, value: &V) -> Result<()> {
        self.with_store(|store| insert_in(store, key, value))
    }

    /// Deletes `key`; absent keys are a no-op.
    pub fn remove(&self, key: &K) -> Result<()> {
        self.with_store(|store| remove_in::<K, V>(store, key))
    }

    /// Calls `f` for every binding in ascending key order.
    pub fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(K, V) -> Result<()>,
    {
        self.with_store(|store| walk_entries(store, store.root(), &mut f))
    }

    /// Like [`BTree::for_each`], threading a 1-based position counter.
    pub fn for_each_indexed<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(u64, K, V) -> Result<()>,
    {
        let mut position = 0u64;
        self.for_each(|key, value| {
            position += 1;
            f(position, key, value)
        })
    }

    /// Number of bindings, counted by traversal.
    pub fn len(&self) -> Result<u64> {
        self.with_store(|store| count_entries::<K>(store, store.root()))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Writes human-readable page dumps under the root directory,
    /// skipping pages shallower than `depth_threshold`. Diagnostic only.
    pub fn snapshot(&self, depth_threshold: usize) -> Result<()> {
        self.with_store(|store| dump::snapshot::<K, V>(store, depth_threshold))
    }

    /// Live handles to this tree, across all opens of the same path.
    pub fn instances(&self) -> u32 {
        self.shared.state.lock().instances
    }

    /// Canonical root directory of this tree.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    fn with_store<T>(&self, f: impl FnOnce(&mut Store) -> Result<T>) -> Result<T> {
        let mut state = self.shared.state.lock();
        let store = state
            .store
            .as_mut()
            .ok_or_else(|| eyre!("tree at '{}' is closed", self.shared.path.display()))?;
        f(store)
    }
}

fn canonical_root(root_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(root_dir)
        .wrap_err_with(|| format!("failed to create index directory '{}'", root_dir.display()))?;
    std::fs::canonicalize(root_dir)
        .wrap_err_with(|| format!("failed to canonicalize '{}'", root_dir.display()))
}

/// Descends to the leaf for `key`, recording the node path root-first.
fn descend<K: IndexKey>(store: &Store, key: &K) -> Result<(Address, SmallVec<[Address; 8]>)> {
    let params = store.params();
    let mut path = SmallVec::new();
    let mut addr = store.root();

    loop {
        let page = store.page(addr)?;
        match PageHeader::from_bytes(page)?.kind()? {
            PageKind::Leaf => return Ok((addr, path)),
            PageKind::Node(_) => {
                let node = Node::<K>::from_page(page, params)?;
                let (_, _, child) = node.route(key)?;
                path.push(addr);
                addr = child;
            }
            PageKind::Free => bail!("descent reached freed page {}", addr),
        }
    }
}

/// Descends to the leaf for `key`, recording at every node the routed
/// entry and its merge partner. The path is root-first; the leaf address
/// is returned separately.
fn descend_with_neighbours<K: IndexKey>(
    store: &Store,
    key: &K,
) -> Result<(Address, SmallVec<[(Address, RouteWithNeighbour<K>); 8]>)> {
    let params = store.params();
    let mut path = SmallVec::new();
    let mut addr = store.root();

    loop {
        let page = store.page(addr)?;
        match PageHeader::from_bytes(page)?.kind()? {
            PageKind::Leaf => return Ok((addr, path)),
            PageKind::Node(_) => {
                let node = Node::<K>::from_page(page, params)?;
                let route = node.route_with_neighbour(key)?;
                let child = route.main.1;
                path.push((addr, route));
                addr = child;
            }
            PageKind::Free => bail!("descent reached freed page {}", addr),
        }
    }
}

fn insert_in<K: IndexKey, V: IndexValue>(store: &mut Store, key: &K, value: &V) -> Result<()> {
    let params = *store.params();
    let (leaf_addr, path) = descend(store, key)?;

    let overflow = {
        let page = store.page_mut(leaf_addr)?;
        let mut leaf = LeafMut::<K, V>::from_page(page, &params)?;
        let inserted = leaf.insert(key, value)?;
        if params.debug {
            trace!(?key, inserted, leaf = leaf_addr, "insert");
        }
        leaf.as_leaf().overflow()
    };

    if !overflow {
        return Ok(());
    }

    let (mut promoted, mut new_addr) = split_leaf::<K, V>(store, &params, leaf_addr)?;
    let mut absorbed = false;

    for &node_addr in path.iter().rev() {
        let node_overflow = {
            let page = store.page_mut(node_addr)?;
            let mut node = NodeMut::<K>::from_page(page, &params)?;
            node.insert(&promoted, new_addr)?;
            node.as_node().overflow()
        };

        if !node_overflow {
            absorbed = true;
            break;
        }

        let (next_promoted, next_addr) = split_node::<K>(store, &params, node_addr)?;
        promoted = next_promoted;
        new_addr = next_addr;
    }

    if absorbed {
        return Ok(());
    }

    // Every page on the path split: grow a new root one level deeper.
    let old_root = store.root();
    let old_depth = store.page_kind(old_root)?.depth();
    ensure!(
        old_depth < MAX_NODE_DEPTH,
        "tree depth limit {} reached",
        MAX_NODE_DEPTH
    );

    let new_root = store.alloc(PageKind::Node(old_depth as u8 + 1))?;
    {
        let page = store.page_mut(new_root)?;
        let mut node = NodeMut::<K>::from_page(page, &params)?;
        node.write_entries(&[(K::MIN, old_root), (promoted, new_addr)])?;
    }
    store.reroot(new_root)?;

    debug!(
        root = new_root,
        depth = old_depth + 1,
        "root grew one level"
    );
    Ok(())
}

/// Splits an overflowing leaf: the lower half stays, the upper half moves
/// to a fresh page, and the upper half's first key is promoted.
fn split_leaf<K: IndexKey, V: IndexValue>(
    store: &mut Store,
    params: &Params,
    addr: Address,
) -> Result<(K, Address)> {
    let entries = Leaf::<K, V>::from_page(store.page(addr)?, params)?.entries();
    let mid = entries.len() / 2;
    let promoted = entries[mid].0;

    let new_addr = store.alloc(PageKind::Leaf)?;
    {
        let page = store.page_mut(addr)?;
        LeafMut::<K, V>::from_page(page, params)?.write_entries(&entries[..mid])?;
    }
    {
        let page = store.page_mut(new_addr)?;
        LeafMut::<K, V>::from_page(page, params)?.write_entries(&entries[mid..])?;
    }

    if params.debug {
        trace!(left = addr, right = new_addr, ?promoted, "leaf split");
    }
    Ok((promoted, new_addr))
}

/// Splits an overflowing node. As with leaves, the upper half's first key
/// is promoted; the new node stores the sentinel in its place.
fn split_node<K: IndexKey>(
    store: &mut Store,
    params: &Params,
    addr: Address,
) -> Result<(K, Address)> {
    let (depth, entries) = {
        let node = Node::<K>::from_page(store.page(addr)?, params)?;
        (node.depth(), node.entries())
    };
    let mid = entries.len() / 2;
    let promoted = entries[mid].0;

    let mut upper: Vec<(K, Address)> = Vec::with_capacity(entries.len() - mid);
    upper.push((K::MIN, entries[mid].1));
    upper.extend_from_slice(&entries[mid + 1..]);

    let new_addr = store.alloc(PageKind::Node(depth as u8))?;
    {
        let page = store.page_mut(addr)?;
        NodeMut::<K>::from_page(page, params)?.write_entries(&entries[..mid])?;
    }
    {
        let page = store.page_mut(new_addr)?;
        NodeMut::<K>::from_page(page, params)?.write_entries(&upper)?;
    }

    if params.debug {
        trace!(left = addr, right = new_addr, ?promoted, "node split");
    }
    Ok((promoted, new_addr))
}

fn remove_in<K: IndexKey, V: IndexValue>(store: &mut Store, key: &K) -> Result<()> {
    let params = *store.params();
    let (leaf_addr, path) = descend_with_neighbours::<K>(store, key)?;

    let (removed, underflow) = {
        let page = store.page_mut(leaf_addr)?;
        let mut leaf = LeafMut::<K, V>::from_page(page, &params)?;
        let removed = leaf.remove(key)?;
        if params.debug {
            trace!(?key, removed, leaf = leaf_addr, "remove");
        }
        (removed, leaf.as_leaf().underflow())
    };

    // The root leaf is exempt from the underflow bound.
    if !removed || path.is_empty() || !underflow {
        return Ok(());
    }

    let mut level = path.len();
    while level > 0 {
        level -= 1;
        let (parent_addr, route) = path[level];

        let Some((neighbour_key, neighbour_addr)) = route.neighbour else {
            // A node with a single entry and no sibling is only ever the
            // root caught mid-shrink; anywhere else it is a bug.
            ensure!(
                level == 0,
                "interior page {} has a single entry below the root",
                parent_addr
            );
            break;
        };

        // The merge keeps the left page and consumes the right.
        let (left, right, right_separator) = match route.order {
            SiblingOrder::Higher => (route.main.1, neighbour_addr, neighbour_key),
            SiblingOrder::Lower => (neighbour_addr, route.main.1, route.main.0),
        };

        let outcome = merge_level::<K, V>(store, &params, left, right, &right_separator)?;

        let parent_underflow = {
            let page = store.page_mut(parent_addr)?;
            let mut parent = NodeMut::<K>::from_page(page, &params)?;
            match outcome {
                MergeOutcome::Total => parent.remove_key(&right_separator)?,
                MergeOutcome::Partial(new_separator) => {
                    parent.replace(&right_separator, &new_separator)?
                }
            }
            parent.as_node().underflow()
        };

        if !parent_underflow {
            break;
        }
        // The root itself is exempt; the loop simply runs out of levels.
    }

    shrink_root::<K>(store, &params)
}

enum MergeOutcome<K> {
    /// The right page was absorbed and freed; its separator must be
    /// removed from the parent.
    Total,
    /// Records were redistributed; the right page's separator must be
    /// renamed to the carried key.
    Partial(K),
}

/// Merges two siblings at one level, dispatching on the page kind. Depth
/// uniformity guarantees both siblings agree; that assumption is checked.
fn merge_level<K: IndexKey, V: IndexValue>(
    store: &mut Store,
    params: &Params,
    left: Address,
    right: Address,
    right_separator: &K,
) -> Result<MergeOutcome<K>> {
    let left_kind = store.page_kind(left)?;
    let right_kind = store.page_kind(right)?;
    ensure!(
        left_kind == right_kind,
        "sibling pages {} and {} disagree on kind: {:?} vs {:?}",
        left,
        right,
        left_kind,
        right_kind
    );

    match left_kind {
        PageKind::Leaf => merge_leaves::<K, V>(store, params, left, right),
        PageKind::Node(_) => merge_nodes::<K>(store, params, left, right, right_separator),
        PageKind::Free => bail!("merge reached freed page {}", left),
    }
}

fn merge_leaves<K: IndexKey, V: IndexValue>(
    store: &mut Store,
    params: &Params,
    left: Address,
    right: Address,
) -> Result<MergeOutcome<K>> {
    let mut entries = Leaf::<K, V>::from_page(store.page(left)?, params)?.entries();
    entries.extend(Leaf::<K, V>::from_page(store.page(right)?, params)?.entries());

    if entries.len() <= params.fanout {
        {
            let page = store.page_mut(left)?;
            LeafMut::<K, V>::from_page(page, params)?.write_entries(&entries)?;
        }
        store.free(right)?;

        if params.debug {
            trace!(left, right, "total leaf merge");
        }
        return Ok(MergeOutcome::Total);
    }

    let left_count = entries.len() - entries.len() / 2;
    {
        let page = store.page_mut(left)?;
        LeafMut::<K, V>::from_page(page, params)?.write_entries(&entries[..left_count])?;
    }
    {
        let page = store.page_mut(right)?;
        LeafMut::<K, V>::from_page(page, params)?.write_entries(&entries[left_count..])?;
    }

    if params.debug {
        trace!(left, right, "partial leaf merge");
    }
    Ok(MergeOutcome::Partial(entries[left_count].0))
}

fn merge_nodes<K: IndexKey>(
    store: &mut Store,
    params: &Params,
    left: Address,
    right: Address,
    right_separator: &K,
) -> Result<MergeOutcome<K>> {
    let mut entries = Node::<K>::from_page(store.page(left)?, params)?.entries();

    let mut right_entries = Node::<K>::from_page(store.page(right)?, params)?.entries();
    ensure!(
        !right_entries.is_empty(),
        "cannot merge empty node page {}",
        right
    );
    // The right node's sentinel stands for its parent separator; restore
    // the real key before combining.
    right_entries[0].0 = *right_separator;
    entries.extend(right_entries);

    if entries.len() <= params.fanout {
        {
            let page = store.page_mut(left)?;
            NodeMut::<K>::from_page(page, params)?.write_entries(&entries)?;
        }
        store.free(right)?;

        if params.debug {
            trace!(left, right, "total node merge");
        }
        return Ok(MergeOutcome::Total);
    }

    let left_count = entries.len() - entries.len() / 2;
    let carried = entries[left_count].0;

    let mut upper: Vec<(K, Address)> = Vec::with_capacity(entries.len() - left_count);
    upper.push((K::MIN, entries[left_count].1));
    upper.extend_from_slice(&entries[left_count + 1..]);

    {
        let page = store.page_mut(left)?;
        NodeMut::<K>::from_page(page, params)?.write_entries(&entries[..left_count])?;
    }
    {
        let page = store.page_mut(right)?;
        NodeMut::<K>::from_page(page, params)?.write_entries(&upper)?;
    }

    if params.debug {
        trace!(left, right, "partial node merge");
    }
    Ok(MergeOutcome::Partial(carried))
}

/// Replaces a single-child root node with its child, repeatedly.
fn shrink_root<K: IndexKey>(store: &mut Store, params: &Params) -> Result<()> {
    loop {
        let root = store.root();
        if !store.page_kind(root)?.is_node() {
            return Ok(());
        }

        let (count, only_child) = {
            let node = Node::<K>::from_page(store.page(root)?, params)?;
            (node.entry_count(), node.child_at(0)?)
        };

        if count != 1 {
            return Ok(());
        }

        store.reroot(only_child)?;
        store.free(root)?;
        debug!(old_root = root, new_root = only_child, "root shrank");
    }
}

/// In-order traversal from `addr`.
fn walk_entries<K: IndexKey, V: IndexValue, F>(store: &Store, addr: Address, f: &mut F) -> Result<()>
where
    F: FnMut(K, V) -> Result<()>,
{
    let params = store.params();
    let page = store.page(addr)?;

    match PageHeader::from_bytes(page)?.kind()? {
        PageKind::Leaf => {
            let leaf = Leaf::<K, V>::from_page(page, params)?;
            for i in 0..leaf.entry_count() {
                f(leaf.key_at(i)?, leaf.value_at(i)?)?;
            }
            Ok(())
        }
        PageKind::Node(_) => {
            let node = Node::<K>::from_page(page, params)?;
            for i in 0..node.entry_count() {
                walk_entries(store, node.child_at(i)?, f)?;
            }
            Ok(())
        }
        PageKind::Free => bail!("traversal reached freed page {}", addr),
    }
}

/// Binding count under `addr`, without decoding records.
fn count_entries<K: IndexKey>(store: &Store, addr: Address) -> Result<u64> {
    let params = store.params();
    let page = store.page(addr)?;
    let header = PageHeader::from_bytes(page)?;

    match header.kind()? {
        PageKind::Leaf => Ok(header.entry_count() as u64),
        PageKind::Node(_) => {
            let node = Node::<K>::from_page(page, params)?;
            let mut total = 0u64;
            for i in 0..node.entry_count() {
                total += count_entries::<K>(store, node.child_at(i)?)?;
            }
            Ok(total)
        }
        PageKind::Free => bail!("traversal reached freed page {}", addr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashSet;

    type Tree = BTree<u64, u64>;

    fn small_params() -> Params {
        Params::with_page_size::<u64, u64>(256)
            .unwrap()
            .with_fanout(4)
            .unwrap()
    }

    fn open_tree(dir: &tempfile::TempDir) -> Tree {
        BTree::open_with_cache(dir.path(), small_params(), &TreeCache::new()).unwrap()
    }

    fn root_kind(tree: &Tree) -> PageKind {
        tree.with_store(|store| store.page_kind(store.root())).unwrap()
    }

    fn collect(tree: &Tree) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        tree.for_each(|k, v| {
            out.push((k, v));
            Ok(())
        })
        .unwrap();
        out
    }

    /// Walks the whole tree checking the structural invariants: order,
    /// sentinel, depth uniformity, fanout bounds and reachability.
    fn check_invariants(tree: &Tree) {
        tree.with_store(|store| {
            let params = *store.params();
            let root = store.root();
            let mut reachable = HashSet::new();
            check_page(store, &params, root, root, &mut reachable)?;

            let mut live = HashSet::new();
            store.iter(|addr, _| {
                live.insert(addr);
                Ok(())
            })?;
            assert_eq!(reachable, live, "live pages must equal reachable pages");
            Ok(())
        })
        .unwrap();
    }

    fn check_page(
        store: &Store,
        params: &Params,
        addr: Address,
        root: Address,
        reachable: &mut HashSet<Address>,
    ) -> Result<usize> {
        assert!(reachable.insert(addr), "page {addr} reached twice");
        let page = store.page(addr)?;
        let kind = PageHeader::from_bytes(page)?.kind()?;

        match kind {
            PageKind::Leaf => {
                let leaf = Leaf::<u64, u64>::from_page(page, params)?;
                let entries = leaf.entries();
                for pair in entries.windows(2) {
                    assert!(pair[0].0 < pair[1].0, "leaf keys must strictly increase");
                }
                if addr != root {
                    assert!(
                        entries.len() >= params.fanout / 2 && entries.len() <= params.fanout,
                        "leaf {addr} holds {} entries outside fanout bounds",
                        entries.len()
                    );
                }
                Ok(0)
            }
            PageKind::Node(_) => {
                let node = Node::<u64>::from_page(page, params)?;
                let entries = node.entries();
                assert_eq!(entries[0].0, u64::MIN, "node {addr} is missing the sentinel");
                for pair in entries.windows(2) {
                    assert!(pair[0].0 < pair[1].0, "node keys must strictly increase");
                }
                if addr != root {
                    assert!(
                        entries.len() >= params.fanout / 2 && entries.len() <= params.fanout,
                        "node {addr} holds {} entries outside fanout bounds",
                        entries.len()
                    );
                }

                let mut child_depth = None;
                for (_, child) in &entries {
                    let depth = check_page(store, params, *child, root, reachable)?;
                    match child_depth {
                        None => child_depth = Some(depth),
                        Some(expected) => {
                            assert_eq!(depth, expected, "children of {addr} at uneven depths")
                        }
                    }
                }

                let depth = child_depth.expect("node has at least the sentinel child") + 1;
                assert_eq!(depth, kind.depth(), "node {addr} declares the wrong depth");
                Ok(depth)
            }
            PageKind::Free => panic!("reached freed page {addr}"),
        }
    }

    #[test]
    fn basic_insert_find_contains_len() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir);

        tree.insert(&1, &100).unwrap();
        tree.insert(&2, &200).unwrap();

        assert_eq!(tree.find(&2).unwrap(), Some(200));
        assert_eq!(tree.find(&3).unwrap(), None);
        assert!(!tree.contains(&3).unwrap());
        assert!(tree.contains(&1).unwrap());
        assert_eq!(tree.len().unwrap(), 2);
        check_invariants(&tree);
    }

    #[test]
    fn queries_on_an_empty_tree() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir);

        assert_eq!(tree.find(&1).unwrap(), None);
        assert!(!tree.contains(&1).unwrap());
        assert_eq!(tree.len().unwrap(), 0);
        assert!(tree.is_empty().unwrap());

        // Removing from an empty tree is a no-op.
        tree.remove(&1).unwrap();
        assert_eq!(tree.len().unwrap(), 0);
        check_invariants(&tree);
    }

    #[test]
    fn fifth_insert_splits_the_root_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir);

        for key in 1..=4u64 {
            tree.insert(&key, &(key * 10)).unwrap();
        }
        assert_eq!(root_kind(&tree), PageKind::Leaf);

        tree.insert(&5, &50).unwrap();

        // Floor split: [1,2] stay, [3,4,5] move, 3 is promoted.
        assert_eq!(root_kind(&tree), PageKind::Node(1));
        assert_eq!(tree.len().unwrap(), 5);

        tree.with_store(|store| {
            let params = *store.params();
            let node = Node::<u64>::from_page(store.page(store.root())?, &params)?;
            let entries = node.entries();
            assert_eq!(entries.len(), 2);
            assert_eq!(entries[0].0, u64::MIN);
            assert_eq!(entries[1].0, 3);

            let left = Leaf::<u64, u64>::from_page(store.page(entries[0].1)?, &params)?;
            let right = Leaf::<u64, u64>::from_page(store.page(entries[1].1)?, &params)?;
            assert_eq!(left.entries(), vec![(1, 10), (2, 20)]);
            assert_eq!(right.entries(), vec![(3, 30), (4, 40), (5, 50)]);
            Ok(())
        })
        .unwrap();
        check_invariants(&tree);
    }

    #[test]
    fn seventeen_inserts_grow_the_root_to_depth_2() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir);

        for key in 1..=17u64 {
            tree.insert(&key, &key).unwrap();
        }

        assert_eq!(root_kind(&tree), PageKind::Node(2));
        assert_eq!(tree.len().unwrap(), 17);

        let expected: Vec<(u64, u64)> = (1..=17).map(|k| (k, k)).collect();
        assert_eq!(collect(&tree), expected);
        check_invariants(&tree);
    }

    #[test]
    fn inserts_grow_to_depth_3_and_iterate_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir);

        // Insert in descending order to exercise left-edge splits too.
        for key in (1..=200u64).rev() {
            tree.insert(&key, &(key * 2)).unwrap();
        }

        let kind = root_kind(&tree);
        assert!(matches!(kind, PageKind::Node(d) if d >= 3), "got {kind:?}");

        let expected: Vec<(u64, u64)> = (1..=200).map(|k| (k, k * 2)).collect();
        assert_eq!(collect(&tree), expected);
        check_invariants(&tree);
    }

    #[test]
    fn insert_replaces_without_changing_len() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir);

        tree.insert(&7, &1).unwrap();
        let before = tree.len().unwrap();
        tree.insert(&7, &2).unwrap();

        assert_eq!(tree.find(&7).unwrap(), Some(2));
        assert_eq!(tree.len().unwrap(), before);
    }

    #[test]
    fn insert_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir);

        tree.insert(&3, &33).unwrap();
        tree.insert(&3, &33).unwrap();

        assert_eq!(tree.len().unwrap(), 1);
        assert_eq!(tree.find(&3).unwrap(), Some(33));
    }

    #[test]
    fn remove_merges_back_to_a_single_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir);

        for key in 1..=5u64 {
            tree.insert(&key, &(key * 10)).unwrap();
        }
        assert_eq!(root_kind(&tree), PageKind::Node(1));

        tree.remove(&5).unwrap();
        tree.remove(&4).unwrap();

        // The leaves collapse and the root becomes a leaf again.
        assert_eq!(root_kind(&tree), PageKind::Leaf);
        assert_eq!(collect(&tree), vec![(1, 10), (2, 20), (3, 30)]);
        check_invariants(&tree);
    }

    #[test]
    fn remove_returns_a_deep_tree_to_a_leaf_root() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir);

        for key in 1..=200u64 {
            tree.insert(&key, &key).unwrap();
        }
        assert!(matches!(root_kind(&tree), PageKind::Node(d) if d >= 3));

        for key in 1..=195u64 {
            tree.remove(&key).unwrap();
            check_invariants(&tree);
        }

        assert_eq!(root_kind(&tree), PageKind::Leaf);
        let expected: Vec<(u64, u64)> = (196..=200).map(|k| (k, k)).collect();
        assert_eq!(collect(&tree), expected);
    }

    #[test]
    fn remove_of_absent_key_leaves_the_tree_alone() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir);

        for key in 1..=10u64 {
            tree.insert(&key, &key).unwrap();
        }

        tree.remove(&999).unwrap();

        assert_eq!(tree.len().unwrap(), 10);
        check_invariants(&tree);
    }

    #[test]
    fn underflowing_root_leaf_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir);

        tree.insert(&1, &1).unwrap();
        tree.remove(&1).unwrap();

        assert_eq!(tree.len().unwrap(), 0);
        assert_eq!(root_kind(&tree), PageKind::Leaf);
    }

    #[test]
    fn for_each_indexed_threads_a_one_based_counter() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir);

        for key in [10u64, 20, 30] {
            tree.insert(&key, &key).unwrap();
        }

        let mut seen = Vec::new();
        tree.for_each_indexed(|i, k, _| {
            seen.push((i, k));
            Ok(())
        })
        .unwrap();

        assert_eq!(seen, vec![(1, 10), (2, 20), (3, 30)]);
    }

    #[test]
    fn flush_close_reopen_preserves_contents() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TreeCache::new();

        {
            let tree: Tree =
                BTree::open_with_cache(dir.path(), small_params(), &cache).unwrap();
            for key in 1..=17u64 {
                tree.insert(&key, &(key + 100)).unwrap();
            }
            tree.flush().unwrap();
            tree.close().unwrap();
        }

        let tree: Tree = BTree::open_with_cache(dir.path(), small_params(), &cache).unwrap();
        assert_eq!(tree.len().unwrap(), 17);
        assert_eq!(tree.find(&9).unwrap(), Some(109));
        check_invariants(&tree);
    }

    #[test]
    fn clear_resets_to_an_empty_tree() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir);

        for key in 1..=50u64 {
            tree.insert(&key, &key).unwrap();
        }
        tree.clear().unwrap();

        assert_eq!(tree.len().unwrap(), 0);
        assert_eq!(root_kind(&tree), PageKind::Leaf);
        assert_eq!(tree.find(&25).unwrap(), None);

        tree.insert(&1, &1).unwrap();
        assert_eq!(tree.len().unwrap(), 1);
        check_invariants(&tree);
    }

    #[test]
    fn opens_of_the_same_path_coalesce() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TreeCache::new();

        let first: Tree = BTree::open_with_cache(dir.path(), small_params(), &cache).unwrap();
        first.insert(&1, &1).unwrap();

        let second: Tree = BTree::open_with_cache(dir.path(), small_params(), &cache).unwrap();
        assert_eq!(second.instances(), 2);
        assert_eq!(second.find(&1).unwrap(), Some(1));

        second.insert(&2, &2).unwrap();
        assert_eq!(first.len().unwrap(), 2);

        first.close().unwrap();
        // One handle remains; operations still work.
        assert_eq!(second.find(&2).unwrap(), Some(2));
        assert!(cache.contains(second.path()));

        second.close().unwrap();
        assert!(!cache.contains(second.path()));
    }

    #[test]
    fn operations_on_a_closed_tree_fail() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir);

        tree.insert(&1, &1).unwrap();
        tree.close().unwrap();

        assert!(tree.find(&1).is_err());
        assert!(tree.insert(&2, &2).is_err());
        assert!(tree.close().is_err());
    }

    #[test]
    fn mismatched_types_on_a_shared_path_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TreeCache::new();

        let params = Params::with_page_size::<u64, u64>(256).unwrap();
        let _first: BTree<u64, u64> =
            BTree::open_with_cache(dir.path(), params, &cache).unwrap();

        let narrow = Params::with_page_size::<u64, u32>(256).unwrap();
        let second: Result<BTree<u64, u32>> =
            BTree::open_with_cache(dir.path(), narrow, &cache);

        assert!(second.is_err());
    }

    #[test]
    fn randomized_workload_matches_std_btreemap() {
        use rand::prelude::*;

        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir);
        let mut model = std::collections::BTreeMap::new();
        let mut rng = StdRng::seed_from_u64(0x0fb7_c821);

        for _ in 0..2_000 {
            let key = rng.random_range(0..500u64);
            if rng.random_bool(0.6) {
                let value = rng.random::<u64>();
                tree.insert(&key, &value).unwrap();
                model.insert(key, value);
            } else {
                tree.remove(&key).unwrap();
                model.remove(&key);
            }
        }

        let expected: Vec<(u64, u64)> = model.into_iter().collect();
        assert_eq!(collect(&tree), expected);
        check_invariants(&tree);
    }

    #[test]
    fn freed_pages_are_reused_by_later_splits() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir);

        let high_water = |tree: &Tree| {
            tree.with_store(|store| {
                let mut max = 0;
                store.iter(|addr, _| {
                    max = max.max(addr);
                    Ok(())
                })?;
                Ok(max)
            })
            .unwrap()
        };

        for key in 1..=100u64 {
            tree.insert(&key, &key).unwrap();
        }
        let first_build_max = high_water(&tree);

        for key in 1..=100u64 {
            tree.remove(&key).unwrap();
        }
        assert_eq!(root_kind(&tree), PageKind::Leaf);

        for key in 1..=100u64 {
            tree.insert(&key, &key).unwrap();
        }
        check_invariants(&tree);

        // Refilling an emptied tree draws pages from the freelist instead
        // of ballooning the file.
        assert!(high_water(&tree) <= first_build_max + 2);
    }
}
