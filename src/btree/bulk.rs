//! # Bulk Load
//!
//! Building a tree by repeated insertion costs a descent and possible
//! splits per binding. When the bindings are already sorted, the whole
//! tree can instead be laid out bottom-up in one sequential pass: packed
//! leaves, then the nodes above them, each page written exactly once
//! through the store's migration writer.
//!
//! ## Algorithm
//!
//! - The target depth is the smallest `d` with `fanout^(d+1) >= n`, i.e.
//!   the shallowest tree whose packed capacity fits `n` bindings.
//! - `sequentiate` splits `n` into per-child chunks: full subtrees of
//!   `fanout^d` bindings each, plus the remainder.
//! - The build recurses depth-first. A depth-0 call drains up to `fanout`
//!   bindings from the reader into one packed leaf. A depth-`d` call
//!   builds each chunk's subtree, records `(first_key, child)` per chunk,
//!   stamps the sentinel over its first entry, and writes the node page.
//!   Each call reports its subtree's true first key upward, which is how
//!   non-first children get their separators.
//! - Pages land contiguously from address 1; `finish(root)` commits the
//!   root, the watermark and an empty freelist in one header update.
//!
//! The reader must produce keys in strictly increasing order; that is
//! checked as the leaves are packed. The tail of the sequence yields
//! under-full rightmost subtrees, which the fanout invariants tolerate
//! the same way they tolerate any other underfull edge page.

use eyre::{ensure, Result};
use tracing::debug;

use crate::config::Params;
use crate::store::{Migration, Store, MAX_NODE_DEPTH};
use crate::types::{IndexKey, IndexValue};

use super::leaf::LeafMut;
use super::node::NodeMut;

/// Replaces the store's contents with a tree of `count` bindings drained
/// from `read` in ascending key order.
pub(crate) fn build<K: IndexKey, V: IndexValue>(
    store: &mut Store,
    count: u64,
    mut read: impl FnMut() -> Result<(K, V)>,
) -> Result<()> {
    let params = *store.params();
    let mut migration = store.begin_migration();

    if count == 0 {
        let root = migration.write_page(|page| {
            LeafMut::<K, V>::init(page, &params)?;
            Ok(())
        })?;
        return migration.finish(root);
    }

    let depth = min_depth(count, params.fanout as u64);
    ensure!(
        depth as usize <= MAX_NODE_DEPTH,
        "{} bindings need depth {} which exceeds the format limit {}",
        count,
        depth,
        MAX_NODE_DEPTH
    );

    let mut last_key: Option<K> = None;
    let (root, _) = build_subtree(
        &mut migration,
        &params,
        depth,
        count,
        &mut read,
        &mut last_key,
    )?;
    migration.finish(root)?;

    debug!(count, depth, "bulk load committed");
    Ok(())
}

/// Builds one subtree of `depth` levels holding `count` bindings and
/// returns its page address and true first key.
fn build_subtree<K: IndexKey, V: IndexValue>(
    migration: &mut Migration<'_>,
    params: &Params,
    depth: u32,
    count: u64,
    read: &mut impl FnMut() -> Result<(K, V)>,
    last_key: &mut Option<K>,
) -> Result<(u32, K)> {
    debug_assert!(count > 0);

    if depth == 0 {
        ensure!(
            count as usize <= params.fanout,
            "leaf chunk of {} exceeds fanout {}",
            count,
            params.fanout
        );

        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (key, value) = read()?;
            if let Some(previous) = last_key {
                ensure!(
                    key > *previous,
                    "bulk-load keys must be strictly increasing: {:?} follows {:?}",
                    key,
                    previous
                );
            }
            *last_key = Some(key);
            entries.push((key, value));
        }

        let first_key = entries[0].0;
        let addr = migration.write_page(|page| {
            LeafMut::<K, V>::init(page, params)?.write_entries(&entries)
        })?;
        return Ok((addr, first_key));
    }

    let step = subtree_capacity(params.fanout as u64, depth - 1);
    let chunks = sequentiate(count, step);
    ensure!(
        chunks.len() <= params.fanout,
        "{} bindings split into {} chunks, above fanout {}",
        count,
        chunks.len(),
        params.fanout
    );

    let mut entries = Vec::with_capacity(chunks.len());
    let mut first_key: Option<K> = None;

    for (i, chunk) in chunks.into_iter().enumerate() {
        let (child, child_first) =
            build_subtree(migration, params, depth - 1, chunk, read, last_key)?;
        if i == 0 {
            first_key = Some(child_first);
            entries.push((K::MIN, child));
        } else {
            entries.push((child_first, child));
        }
    }

    let addr = migration.write_page(|page| {
        NodeMut::<K>::init(page, params, depth as usize)?.write_entries(&entries)
    })?;

    Ok((addr, first_key.expect("chunks are never empty")))
}

/// Bindings a packed subtree of the given depth can hold:
/// `fanout^(depth+1)`, saturating.
fn subtree_capacity(fanout: u64, depth: u32) -> u64 {
    pow_saturating(fanout, depth + 1)
}

/// Smallest depth whose packed capacity fits `count` bindings.
fn min_depth(count: u64, fanout: u64) -> u32 {
    let mut depth = 0;
    while subtree_capacity(fanout, depth) < count {
        depth += 1;
    }
    depth
}

/// `base^exp` by repeated squaring, saturating at `u64::MAX`.
fn pow_saturating(base: u64, mut exp: u32) -> u64 {
    let mut result: u128 = 1;
    let mut square = base as u128;

    while exp > 0 {
        if exp & 1 == 1 {
            result = result.saturating_mul(square);
        }
        square = square.saturating_mul(square);
        exp >>= 1;
    }

    u64::try_from(result).unwrap_or(u64::MAX)
}

/// Splits `count` into `step`-sized chunks plus the remainder. A short
/// remainder is balanced against the last full chunk so no chunk drops
/// below `step / 2`; otherwise a trailing remainder of 1 would build a
/// chain of single-child nodes that violates the half-full bound.
fn sequentiate(count: u64, step: u64) -> Vec<u64> {
    debug_assert!(step > 0);
    let mut chunks = Vec::with_capacity((count / step) as usize + 1);
    let mut remaining = count;

    while remaining > step {
        chunks.push(step);
        remaining -= step;
    }

    if remaining == 0 {
        return chunks;
    }

    if remaining < step.div_ceil(2) && !chunks.is_empty() {
        let total = step + remaining;
        let last = chunks.len() - 1;
        chunks[last] = total - total / 2;
        chunks.push(total / 2);
    } else {
        chunks.push(remaining);
    }

    chunks
}
