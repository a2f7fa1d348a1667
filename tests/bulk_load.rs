//! Bulk-load behavior: equivalence with repeated insertion, mutation
//! after a bulk build, and input validation.

use arbordb::{BTree, Params, TreeCache};
use eyre::eyre;

fn small_params() -> Params {
    Params::with_page_size::<u64, u64>(256)
        .unwrap()
        .with_fanout(4)
        .unwrap()
}

fn collect(tree: &BTree<u64, u64>) -> Vec<(u64, u64)> {
    let mut out = Vec::new();
    tree.for_each(|k, v| {
        out.push((k, v));
        Ok(())
    })
    .unwrap();
    out
}

fn reader_over(pairs: Vec<(u64, u64)>) -> impl FnMut() -> eyre::Result<(u64, u64)> {
    let mut iter = pairs.into_iter();
    move || iter.next().ok_or_else(|| eyre!("reader ran dry"))
}

#[test]
fn bulk_load_matches_repeated_insertion() {
    let pairs: Vec<(u64, u64)> = (0..1_000u64).map(|k| (k * 3, k)).collect();

    let bulk_dir = tempfile::tempdir().unwrap();
    let bulk: BTree<u64, u64> = BTree::bulk_load_with_cache(
        bulk_dir.path(),
        small_params(),
        pairs.len() as u64,
        reader_over(pairs.clone()),
        &TreeCache::new(),
    )
    .unwrap();

    let insert_dir = tempfile::tempdir().unwrap();
    let inserted: BTree<u64, u64> =
        BTree::open_with_cache(insert_dir.path(), small_params(), &TreeCache::new()).unwrap();
    for (k, v) in &pairs {
        inserted.insert(k, v).unwrap();
    }

    assert_eq!(collect(&bulk), collect(&inserted));
    assert_eq!(bulk.len().unwrap(), 1_000);

    bulk.close().unwrap();
    inserted.close().unwrap();
}

#[test]
fn bulk_loaded_tree_accepts_mutation() {
    let pairs: Vec<(u64, u64)> = (1..=100u64).map(|k| (k * 2, k)).collect();

    let dir = tempfile::tempdir().unwrap();
    let tree: BTree<u64, u64> = BTree::bulk_load_with_cache(
        dir.path(),
        small_params(),
        pairs.len() as u64,
        reader_over(pairs),
        &TreeCache::new(),
    )
    .unwrap();

    // Interleave with the packed pages: odd keys split packed leaves.
    for key in (1..=99u64).step_by(2) {
        tree.insert(&key, &0).unwrap();
    }
    assert_eq!(tree.len().unwrap(), 150);

    for key in (2..=200u64).step_by(2) {
        tree.remove(&key).unwrap();
    }
    assert_eq!(tree.len().unwrap(), 50);
    assert_eq!(tree.find(&51).unwrap(), Some(0));
    assert_eq!(tree.find(&52).unwrap(), None);

    tree.close().unwrap();
}

#[test]
fn bulk_load_of_nothing_builds_an_empty_tree() {
    let dir = tempfile::tempdir().unwrap();
    let tree: BTree<u64, u64> = BTree::bulk_load_with_cache(
        dir.path(),
        small_params(),
        0,
        || Err(eyre!("reader must not be called for an empty build")),
        &TreeCache::new(),
    )
    .unwrap();

    assert!(tree.is_empty().unwrap());
    tree.insert(&1, &1).unwrap();
    assert_eq!(tree.len().unwrap(), 1);
    tree.close().unwrap();
}

#[test]
fn bulk_load_of_a_single_binding() {
    let dir = tempfile::tempdir().unwrap();
    let tree: BTree<u64, u64> = BTree::bulk_load_with_cache(
        dir.path(),
        small_params(),
        1,
        reader_over(vec![(7, 70)]),
        &TreeCache::new(),
    )
    .unwrap();

    assert_eq!(tree.find(&7).unwrap(), Some(70));
    assert_eq!(tree.len().unwrap(), 1);
    tree.close().unwrap();
}

#[test]
fn bulk_load_rejects_unsorted_input() {
    let dir = tempfile::tempdir().unwrap();
    let result: eyre::Result<BTree<u64, u64>> = BTree::bulk_load_with_cache(
        dir.path(),
        small_params(),
        3,
        reader_over(vec![(1, 1), (5, 5), (4, 4)]),
        &TreeCache::new(),
    );

    let err = result.err().expect("unsorted input must be rejected");
    assert!(err.to_string().contains("strictly increasing"), "{err}");
}

#[test]
fn bulk_load_rejects_duplicate_keys() {
    let dir = tempfile::tempdir().unwrap();
    let result: eyre::Result<BTree<u64, u64>> = BTree::bulk_load_with_cache(
        dir.path(),
        small_params(),
        2,
        reader_over(vec![(3, 1), (3, 2)]),
        &TreeCache::new(),
    );

    assert!(result.is_err());
}

#[test]
fn bulk_load_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let cache = TreeCache::new();
    let pairs: Vec<(u64, u64)> = (0..500u64).map(|k| (k, k + 1)).collect();

    {
        let tree: BTree<u64, u64> = BTree::bulk_load_with_cache(
            dir.path(),
            small_params(),
            pairs.len() as u64,
            reader_over(pairs.clone()),
            &cache,
        )
        .unwrap();
        tree.close().unwrap();
    }

    let tree: BTree<u64, u64> =
        BTree::open_with_cache(dir.path(), small_params(), &cache).unwrap();
    assert_eq!(collect(&tree), pairs);
    tree.close().unwrap();
}

#[test]
fn bulk_load_while_open_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let cache = TreeCache::new();

    let open: BTree<u64, u64> =
        BTree::open_with_cache(dir.path(), small_params(), &cache).unwrap();

    let result: eyre::Result<BTree<u64, u64>> = BTree::bulk_load_with_cache(
        dir.path(),
        small_params(),
        1,
        reader_over(vec![(1, 1)]),
        &cache,
    );

    assert!(result.is_err());
    open.close().unwrap();
}
