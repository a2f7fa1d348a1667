//! # Open-Tree Cache
//!
//! Opening the same index directory twice must yield the *same* tree:
//! two independent stores over one file would clobber each other's
//! allocations. A [`TreeCache`] maps canonical root paths to the shared
//! state of the live tree, and opens through the same cache coalesce.
//!
//! Entries are type-erased (`Arc<dyn Any>`) because the cache holds trees
//! of arbitrary key/value types; the open path downcasts and fails loudly
//! on a type mismatch.
//!
//! ## The Global Cache List
//!
//! Callers may supply their own cache, so the same path could in
//! principle be held by several caches. Every cache constructed
//! registers a weak reference in a process-wide list; when the last
//! handle to a tree closes, the tree is evicted from *every* registered
//! cache, not just the one it was opened through.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

use hashbrown::HashMap;
use parking_lot::{Mutex, MutexGuard};

type CacheMap = HashMap<PathBuf, Arc<dyn Any + Send + Sync>>;

static ALL_CACHES: Mutex<Vec<Weak<TreeCache>>> = Mutex::new(Vec::new());
static GLOBAL: OnceLock<Arc<TreeCache>> = OnceLock::new();

/// A cache of open trees keyed by canonical root path.
pub struct TreeCache {
    map: Mutex<CacheMap>,
}

impl TreeCache {
    /// A fresh cache, registered in the process-wide list.
    pub fn new() -> Arc<Self> {
        let cache = Arc::new(Self {
            map: Mutex::new(HashMap::new()),
        });
        ALL_CACHES.lock().push(Arc::downgrade(&cache));
        cache
    }

    /// The default cache used by opens that do not supply one.
    pub fn global() -> &'static Arc<Self> {
        GLOBAL.get_or_init(Self::new)
    }

    /// Whether `path` currently maps to an open tree in this cache.
    pub fn contains(&self, path: &Path) -> bool {
        self.map.lock().contains_key(path)
    }

    /// Number of open trees held by this cache.
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    /// Locks the map for a whole lookup-or-insert sequence, so two
    /// concurrent opens of the same path cannot both miss.
    pub(crate) fn lock(&self) -> MutexGuard<'_, CacheMap> {
        self.map.lock()
    }

    /// Drops `path` from every registered cache. Dead caches are pruned
    /// from the list on the way through.
    pub(crate) fn evict_everywhere(path: &Path) {
        let mut caches = ALL_CACHES.lock();
        caches.retain(|weak| match weak.upgrade() {
            Some(cache) => {
                cache.map.lock().remove(path);
                true
            }
            None => false,
        });
    }
}
