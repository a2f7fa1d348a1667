//! Durability and multi-instance behavior through the public API.

use std::sync::Arc;

use arbordb::{BTree, Params, TreeCache};

fn collect<K, V>(tree: &BTree<K, V>) -> Vec<(K, V)>
where
    K: arbordb::IndexKey,
    V: arbordb::IndexValue,
{
    let mut out = Vec::new();
    tree.for_each(|k, v| {
        out.push((k, v));
        Ok(())
    })
    .unwrap();
    out
}

#[test]
fn large_workload_survives_flush_close_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let params = Params::new::<u64, u64>().unwrap();
    let cache = TreeCache::new();

    {
        let tree: BTree<u64, u64> =
            BTree::open_with_cache(dir.path(), params, &cache).unwrap();
        for key in 0..1_000u64 {
            tree.insert(&key, &(key * 7)).unwrap();
        }
        for key in (0..1_000u64).step_by(3) {
            tree.remove(&key).unwrap();
        }
        tree.flush().unwrap();
        tree.close().unwrap();
    }

    let tree: BTree<u64, u64> = BTree::open_with_cache(dir.path(), params, &cache).unwrap();

    let expected: Vec<(u64, u64)> = (0..1_000u64)
        .filter(|k| k % 3 != 0)
        .map(|k| (k, k * 7))
        .collect();
    assert_eq!(collect(&tree), expected);
    assert_eq!(tree.len().unwrap(), expected.len() as u64);
    assert_eq!(tree.find(&998).unwrap(), Some(998 * 7));
    assert_eq!(tree.find(&999).unwrap(), None);

    tree.close().unwrap();
}

#[test]
fn clear_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let params = Params::new::<u64, u64>().unwrap();
    let cache = TreeCache::new();

    {
        let tree: BTree<u64, u64> =
            BTree::open_with_cache(dir.path(), params, &cache).unwrap();
        for key in 0..100u64 {
            tree.insert(&key, &key).unwrap();
        }
        tree.clear().unwrap();
        tree.close().unwrap();
    }

    let tree: BTree<u64, u64> = BTree::open_with_cache(dir.path(), params, &cache).unwrap();
    assert!(tree.is_empty().unwrap());
    tree.close().unwrap();
}

#[test]
fn fixed_width_string_records() {
    type Name = [u8; 16];
    type Phone = [u8; 8];

    fn name(s: &str) -> Name {
        let mut out = [0u8; 16];
        out[..s.len()].copy_from_slice(s.as_bytes());
        out
    }

    fn phone(s: &str) -> Phone {
        let mut out = [0u8; 8];
        out[..s.len()].copy_from_slice(s.as_bytes());
        out
    }

    let dir = tempfile::tempdir().unwrap();
    let params = Params::new::<Name, Phone>().unwrap();
    let cache = TreeCache::new();
    let tree: BTree<Name, Phone> =
        BTree::open_with_cache(dir.path(), params, &cache).unwrap();

    tree.insert(&name("ada"), &phone("555-0001")).unwrap();
    tree.insert(&name("brian"), &phone("555-0002")).unwrap();
    tree.insert(&name("ada"), &phone("555-0009")).unwrap();

    assert_eq!(tree.find(&name("ada")).unwrap(), Some(phone("555-0009")));
    assert_eq!(tree.len().unwrap(), 2);

    let keys: Vec<Name> = collect(&tree).into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![name("ada"), name("brian")]);

    tree.remove(&name("ada")).unwrap();
    assert!(!tree.contains(&name("ada")).unwrap());
    tree.close().unwrap();
}

#[test]
fn reopening_with_different_geometry_fails() {
    let dir = tempfile::tempdir().unwrap();
    let cache = TreeCache::new();

    {
        let params = Params::new::<u64, u64>().unwrap();
        let tree: BTree<u64, u64> =
            BTree::open_with_cache(dir.path(), params, &cache).unwrap();
        tree.insert(&1, &1).unwrap();
        tree.close().unwrap();
    }

    let narrow = Params::new::<u32, u32>().unwrap();
    let result: eyre::Result<BTree<u32, u32>> =
        BTree::open_with_cache(dir.path(), narrow, &cache);

    let err = result.err().expect("mismatched geometry must be rejected");
    assert!(err.to_string().contains("size mismatch"), "{err}");
}

#[test]
fn instances_share_state_through_a_custom_cache() {
    let dir = tempfile::tempdir().unwrap();
    let params = Params::new::<u64, u64>().unwrap();
    let cache: Arc<TreeCache> = TreeCache::new();

    let writer: BTree<u64, u64> =
        BTree::open_with_cache(dir.path(), params, &cache).unwrap();
    let reader: BTree<u64, u64> =
        BTree::open_with_cache(dir.path(), params, &cache).unwrap();

    assert_eq!(writer.instances(), 2);
    assert_eq!(cache.len(), 1);

    writer.insert(&42, &4242).unwrap();
    assert_eq!(reader.find(&42).unwrap(), Some(4242));

    writer.close().unwrap();
    assert_eq!(reader.find(&42).unwrap(), Some(4242));

    reader.close().unwrap();
    assert!(cache.is_empty());
}

#[test]
fn snapshot_is_only_a_side_channel() {
    let dir = tempfile::tempdir().unwrap();
    let params = Params::new::<u64, u64>().unwrap();
    let tree: BTree<u64, u64> =
        BTree::open_with_cache(dir.path(), params, &TreeCache::new()).unwrap();

    for key in 0..300u64 {
        tree.insert(&key, &key).unwrap();
    }
    tree.snapshot(0).unwrap();

    assert!(dir.path().join("pp_header.ansi").exists());

    // The dumps must not perturb the tree itself.
    assert_eq!(tree.len().unwrap(), 300);
    tree.close().unwrap();
}
