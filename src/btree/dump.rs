//! # Diagnostic Snapshots
//!
//! `snapshot` writes a human-readable dump of the header and every live
//! page into the tree's root directory: `pp_header.ansi` plus one
//! `pp_page_<addr>.ansi` per page. Pages shallower than the requested
//! depth threshold are skipped, which keeps dumps of big trees down to
//! the interior structure.
//!
//! Nothing reads these files back; they exist for eyeballing a tree
//! while debugging and carry no correctness weight.

use std::fmt::Write as _;

use eyre::{Result, WrapErr};
use tracing::debug;

use crate::config::Params;
use crate::store::{Address, PageHeader, PageKind, Store};
use crate::types::{IndexKey, IndexValue};

use super::leaf::Leaf;
use super::node::Node;

pub(crate) fn snapshot<K: IndexKey, V: IndexValue>(
    store: &Store,
    depth_threshold: usize,
) -> Result<()> {
    let root_dir = store.root_dir().to_path_buf();
    let params = *store.params();

    let mut text = String::new();
    let _ = writeln!(text, "format:        v{}", crate::config::FORMAT_VERSION);
    let _ = writeln!(text, "root:          {}", store.root());
    let _ = writeln!(text, "page size:     {}", params.page_size);
    let _ = writeln!(text, "key size:      {}", params.key_size);
    let _ = writeln!(text, "value size:    {}", params.value_size);
    let _ = writeln!(text, "fanout:        {}", params.fanout);

    let header_path = root_dir.join("pp_header.ansi");
    std::fs::write(&header_path, &text)
        .wrap_err_with(|| format!("failed to write '{}'", header_path.display()))?;

    let mut pages = 0u32;
    store.iter(|addr, page| {
        let kind = PageHeader::from_bytes(page)?.kind()?;
        if kind == PageKind::Free || kind.depth() < depth_threshold {
            return Ok(());
        }

        let text = match kind {
            PageKind::Leaf => dump_leaf::<K, V>(addr, page, &params)?,
            PageKind::Node(_) => dump_node::<K>(addr, page, &params)?,
            PageKind::Free => unreachable!("filtered above"),
        };

        let path = root_dir.join(format!("pp_page_{addr}.ansi"));
        std::fs::write(&path, text)
            .wrap_err_with(|| format!("failed to write '{}'", path.display()))?;
        pages += 1;
        Ok(())
    })?;

    debug!(pages, depth_threshold, "wrote snapshot");
    Ok(())
}

fn dump_leaf<K: IndexKey, V: IndexValue>(
    addr: Address,
    page: &[u8],
    params: &Params,
) -> Result<String> {
    let leaf = Leaf::<K, V>::from_page(page, params)?;
    let mut text = String::new();

    let _ = writeln!(text, "page {addr}: leaf, {} entries", leaf.entry_count());
    for i in 0..leaf.entry_count() {
        let _ = writeln!(text, "  {:?} => {:?}", leaf.key_at(i)?, leaf.value_at(i)?);
    }

    Ok(text)
}

fn dump_node<K: IndexKey>(
    addr: Address,
    page: &[u8],
    params: &Params,
) -> Result<String> {
    let node = Node::<K>::from_page(page, params)?;
    let mut text = String::new();

    let _ = writeln!(
        text,
        "page {addr}: node, depth {}, {} entries",
        node.depth(),
        node.entry_count()
    );
    for i in 0..node.entry_count() {
        let (key, child) = node.entry_at(i)?;
        if i == 0 {
            let _ = writeln!(text, "  <min> -> page {child}");
        } else {
            let _ = writeln!(text, "  {key:?} -> page {child}");
        }
    }

    Ok(text)
}
