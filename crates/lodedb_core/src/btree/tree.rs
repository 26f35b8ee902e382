//! Core B+tree operations: search, insert with splits, delete with merges,
//! ordered scans and truncate.

use crate::btree::ctx::TreeCtx;
use crate::btree::meta::ROOT_PGNO;
use crate::btree::node::{Internal, Leaf, LeafEntry, Node};
use crate::btree::overflow::{free_value, load_value, store_value};
use crate::error::{CoreError, CoreResult};
use crate::lock::LockMode;
use crate::types::PageNo;
use std::ops::Bound;

/// A key-value pair returned by scans.
pub type KeyValuePair = (Vec<u8>, Vec<u8>);

/// An internal page passed on the way down, and the child taken.
struct PathStep {
    pgno: PageNo,
    node: Internal,
    idx: usize,
}

fn corrupt(pgno: PageNo, what: &str) -> CoreError {
    CoreError::invalid_format(format!("page {pgno}: {what}"))
}

fn into_leaf(pgno: PageNo, node: Node) -> CoreResult<Leaf> {
    match node {
        Node::Leaf(leaf) => Ok(leaf),
        Node::Internal(_) => Err(corrupt(pgno, "expected a leaf")),
    }
}

fn check_key(ctx: &TreeCtx<'_>, key: &[u8]) -> CoreResult<()> {
    if key.len() > ctx.max_key() {
        return Err(CoreError::invalid_argument(format!(
            "key of {} bytes exceeds the maximum of {}",
            key.len(),
            ctx.max_key()
        )));
    }
    Ok(())
}

/// Descends to the leaf covering `key` (the leftmost leaf for `None`)
/// with read locks.
fn descend_read(
    ctx: &mut TreeCtx<'_>,
    key: Option<&[u8]>,
    current: bool,
) -> CoreResult<(PageNo, Leaf)> {
    let mut pgno = ROOT_PGNO;
    loop {
        ctx.lock(pgno, LockMode::Read)?;
        let node = if current {
            ctx.read_current(pgno)?
        } else {
            ctx.read_node(pgno)?
        };
        match node {
            Node::Leaf(leaf) => return Ok((pgno, leaf)),
            Node::Internal(node) => {
                pgno = match key {
                    Some(k) => node.child(node.child_index(k)),
                    None => node.first,
                };
            }
        }
    }
}

/// Descends to the leaf covering `key` for a write: Read locks on
/// internal pages, a Write lock on the leaf.
fn descend_write(ctx: &mut TreeCtx<'_>, key: &[u8]) -> CoreResult<(Vec<PathStep>, PageNo, Leaf)> {
    let mut path = Vec::new();
    let mut pgno = ROOT_PGNO;
    let mut mode = if ctx.peek_level(ROOT_PGNO)? == 0 {
        LockMode::Write
    } else {
        LockMode::Read
    };
    loop {
        ctx.lock_path(pgno, mode)?;
        match ctx.read_current(pgno)? {
            Node::Leaf(leaf) => {
                if mode == LockMode::Write {
                    return Ok((path, pgno, leaf));
                }
                // The root collapsed into a leaf after the peek.
                ctx.lock_path(pgno, LockMode::Write)?;
                let leaf = into_leaf(pgno, ctx.read_current(pgno)?)?;
                return Ok((path, pgno, leaf));
            }
            Node::Internal(node) => {
                let idx = node.child_index(key);
                let child = node.child(idx);
                mode = if node.level == 1 {
                    LockMode::Write
                } else {
                    LockMode::Read
                };
                path.push(PathStep { pgno, node, idx });
                pgno = child;
            }
        }
    }
}

/// Looks up `key`.
pub(crate) fn get(ctx: &mut TreeCtx<'_>, key: &[u8]) -> CoreResult<Option<Vec<u8>>> {
    ctx.lock_db(LockMode::IntentRead)?;
    let (_, leaf) = descend_read(ctx, Some(key), false)?;
    match leaf.search(key) {
        Ok(i) => Ok(Some(load_value(ctx, &leaf.entries[i].value, false)?)),
        Err(_) => Ok(None),
    }
}

/// Inserts or replaces `key`. Returns true if the key was new.
///
/// With `overwrite` false an existing key fails with `KeyExists`.
pub(crate) fn put(
    ctx: &mut TreeCtx<'_>,
    key: &[u8],
    value: &[u8],
    overwrite: bool,
) -> CoreResult<bool> {
    check_key(ctx, key)?;
    ctx.check_writable()?;
    ctx.lock_db(LockMode::IntentWrite)?;
    let (path, pgno, mut leaf) = descend_write(ctx, key)?;
    ctx.check_conflict(pgno)?;

    let inserted = match leaf.search(key) {
        Ok(i) => {
            if !overwrite {
                return Err(CoreError::KeyExists);
            }
            let old = leaf.entries[i].value.clone();
            free_value(ctx, &old)?;
            leaf.entries[i].value = store_value(ctx, key, value)?;
            false
        }
        Err(i) => {
            let value = store_value(ctx, key, value)?;
            leaf.entries.insert(
                i,
                LeafEntry {
                    key: key.to_vec(),
                    value,
                },
            );
            true
        }
    };

    if leaf.encoded_len() <= ctx.capacity() {
        ctx.write_node(pgno, &Node::Leaf(leaf))?;
    } else {
        split_leaf(ctx, path, pgno, leaf)?;
    }
    Ok(inserted)
}

/// Index splitting `entries` at the byte midpoint; both halves non-empty.
fn leaf_split_point(entries: &[LeafEntry]) -> usize {
    let total: usize = entries.iter().map(LeafEntry::encoded_len).sum();
    let mut acc = 0;
    for (i, e) in entries.iter().enumerate() {
        if i > 0 && acc + e.encoded_len() > total / 2 {
            return i;
        }
        acc += e.encoded_len();
    }
    entries.len() - 1
}

fn split_leaf(
    ctx: &mut TreeCtx<'_>,
    path: Vec<PathStep>,
    pgno: PageNo,
    mut leaf: Leaf,
) -> CoreResult<()> {
    let at = leaf_split_point(&leaf.entries);
    let right_entries = leaf.entries.split_off(at);
    let separator = right_entries[0].key.clone();
    tracing::trace!(page = pgno, at, "leaf split");

    if pgno == ROOT_PGNO {
        let right = ctx.allocate(&Node::Leaf(Leaf {
            entries: right_entries,
            next: 0,
        }))?;
        let left = ctx.allocate(&Node::Leaf(Leaf {
            entries: leaf.entries,
            next: right,
        }))?;
        let root = Internal {
            level: 1,
            first: left,
            entries: vec![(separator, right)],
        };
        return ctx.write_node(ROOT_PGNO, &Node::Internal(root));
    }

    let right = ctx.allocate(&Node::Leaf(Leaf {
        entries: right_entries,
        next: leaf.next,
    }))?;
    leaf.next = right;
    ctx.write_node(pgno, &Node::Leaf(leaf))?;
    insert_into_parent(ctx, path, separator, right)
}

fn insert_into_parent(
    ctx: &mut TreeCtx<'_>,
    mut path: Vec<PathStep>,
    separator: Vec<u8>,
    right: PageNo,
) -> CoreResult<()> {
    let step = path
        .pop()
        .ok_or_else(|| corrupt(right, "split below the root without a parent"))?;
    ctx.lock_path(step.pgno, LockMode::Write)?;
    let mut node = step.node;
    node.entries.insert(step.idx, (separator, right));
    if node.encoded_len() <= ctx.capacity() {
        return ctx.write_node(step.pgno, &Node::Internal(node));
    }
    split_internal(ctx, path, step.pgno, node)
}

fn split_internal(
    ctx: &mut TreeCtx<'_>,
    path: Vec<PathStep>,
    pgno: PageNo,
    mut node: Internal,
) -> CoreResult<()> {
    let mid = node.entries.len() / 2;
    let right_entries = node.entries.split_off(mid + 1);
    let (separator, right_first) = node
        .entries
        .pop()
        .ok_or_else(|| corrupt(pgno, "internal split of an empty node"))?;
    let right_node = Internal {
        level: node.level,
        first: right_first,
        entries: right_entries,
    };
    tracing::trace!(page = pgno, level = node.level, "internal split");

    if pgno == ROOT_PGNO {
        let level = node.level;
        let left = ctx.allocate(&Node::Internal(node))?;
        let right = ctx.allocate(&Node::Internal(right_node))?;
        let root = Internal {
            level: level + 1,
            first: left,
            entries: vec![(separator, right)],
        };
        return ctx.write_node(ROOT_PGNO, &Node::Internal(root));
    }

    let right = ctx.allocate(&Node::Internal(right_node))?;
    ctx.write_node(pgno, &Node::Internal(node))?;
    insert_into_parent(ctx, path, separator, right)
}

/// Removes `key`.
///
/// # Errors
///
/// `KeyNotFound` if the key is absent.
pub(crate) fn delete(ctx: &mut TreeCtx<'_>, key: &[u8]) -> CoreResult<()> {
    ctx.check_writable()?;
    ctx.lock_db(LockMode::IntentWrite)?;
    let (path, pgno, mut leaf) = descend_write(ctx, key)?;
    ctx.check_conflict(pgno)?;
    let i = leaf.search(key).map_err(|_| CoreError::KeyNotFound)?;
    let entry = leaf.entries.remove(i);
    free_value(ctx, &entry.value)?;
    rebalance_leaf(ctx, path, pgno, leaf)
}

/// Writes a leaf that lost an entry, unlinking it if empty or merging its
/// right sibling into it if underfull.
fn rebalance_leaf(
    ctx: &mut TreeCtx<'_>,
    mut path: Vec<PathStep>,
    pgno: PageNo,
    mut leaf: Leaf,
) -> CoreResult<()> {
    if pgno == ROOT_PGNO || leaf.encoded_len() >= ctx.capacity() / 4 {
        return ctx.write_node(pgno, &Node::Leaf(leaf));
    }
    if leaf.entries.is_empty() {
        return remove_empty_leaf(ctx, path, pgno, leaf.next);
    }
    let Some(PathStep {
        pgno: parent_pgno,
        node: mut parent,
        idx,
    }) = path.pop()
    else {
        return ctx.write_node(pgno, &Node::Leaf(leaf));
    };

    if idx + 1 < parent.child_count() {
        let right_pgno = parent.child(idx + 1);
        ctx.lock_path(right_pgno, LockMode::Write)?;
        let right = into_leaf(right_pgno, ctx.read_current(right_pgno)?)?;
        if leaf.encoded_len() + right.encoded_len() <= ctx.capacity() {
            leaf.entries.extend(right.entries);
            leaf.next = right.next;
            ctx.write_node(pgno, &Node::Leaf(leaf))?;
            ctx.lock_path(parent_pgno, LockMode::Write)?;
            parent.remove_child(idx + 1);
            ctx.write_node(parent_pgno, &Node::Internal(parent.clone()))?;
            ctx.free(right_pgno)?;
            return after_parent_shrink(ctx, parent_pgno, &parent);
        }
    }
    ctx.write_node(pgno, &Node::Leaf(leaf))
}

/// Removes an empty leaf, together with every ancestor it was the only
/// child of, and links its left neighbour to `next`.
fn remove_empty_leaf(
    ctx: &mut TreeCtx<'_>,
    mut path: Vec<PathStep>,
    pgno: PageNo,
    next: PageNo,
) -> CoreResult<()> {
    let mut doomed = vec![pgno];
    while let Some(step) = path.last() {
        if step.pgno == ROOT_PGNO || step.node.child_count() > 1 {
            break;
        }
        doomed.push(step.pgno);
        path.pop();
    }
    let Some(PathStep {
        pgno: parent_pgno,
        node: mut parent,
        idx,
    }) = path.pop()
    else {
        return Err(corrupt(pgno, "non-root leaf without a parent"));
    };

    if let Some(left_pgno) = left_neighbour(ctx, &path, &parent, idx)? {
        ctx.lock_path(left_pgno, LockMode::Write)?;
        let mut left = into_leaf(left_pgno, ctx.read_current(left_pgno)?)?;
        left.next = next;
        ctx.write_node(left_pgno, &Node::Leaf(left))?;
    }

    ctx.lock_path(parent_pgno, LockMode::Write)?;
    if parent.child_count() == 1 {
        ctx.write_node(parent_pgno, &Node::Leaf(Leaf::default()))?;
    } else {
        parent.remove_child(idx);
        ctx.write_node(parent_pgno, &Node::Internal(parent.clone()))?;
    }
    for p in doomed {
        ctx.free(p)?;
    }
    after_parent_shrink(ctx, parent_pgno, &parent)
}

/// The leaf just left of child `idx` of `parent`, if any. `above` holds
/// the ancestors of `parent`.
fn left_neighbour(
    ctx: &mut TreeCtx<'_>,
    above: &[PathStep],
    parent: &Internal,
    idx: usize,
) -> CoreResult<Option<PageNo>> {
    let start = if idx > 0 {
        Some(parent.child(idx - 1))
    } else {
        above
            .iter()
            .rev()
            .find(|s| s.idx > 0)
            .map(|s| s.node.child(s.idx - 1))
    };
    let Some(mut pgno) = start else {
        return Ok(None);
    };
    loop {
        match ctx.read_current(pgno)? {
            Node::Leaf(_) => return Ok(Some(pgno)),
            Node::Internal(node) => {
                ctx.lock(pgno, LockMode::Read)?;
                pgno = node.child(node.child_count() - 1);
            }
        }
    }
}

/// Collapses a root left with a single child, as often as needed.
fn after_parent_shrink(ctx: &mut TreeCtx<'_>, parent_pgno: PageNo, parent: &Internal) -> CoreResult<()> {
    if parent_pgno != ROOT_PGNO || !parent.entries.is_empty() {
        return Ok(());
    }
    loop {
        let Node::Internal(root) = ctx.read_current(ROOT_PGNO)? else {
            return Ok(());
        };
        if !root.entries.is_empty() {
            return Ok(());
        }
        let child = root.first;
        ctx.lock_path(child, LockMode::Write)?;
        let mut node = ctx.read_current(child)?;
        if let Node::Leaf(leaf) = &mut node {
            leaf.next = 0;
        }
        ctx.write_node(ROOT_PGNO, &node)?;
        ctx.free(child)?;
        tracing::trace!(level = node.level(), "root collapsed");
    }
}

/// Visits leaf entries in key order starting at `from`, until `f` returns
/// false. `current` reads the latest images (write paths).
pub(crate) fn walk(
    ctx: &mut TreeCtx<'_>,
    from: Bound<&[u8]>,
    current: bool,
    mut f: impl FnMut(&TreeCtx<'_>, LeafEntry) -> CoreResult<bool>,
) -> CoreResult<()> {
    let start = match from {
        Bound::Included(k) | Bound::Excluded(k) => Some(k),
        Bound::Unbounded => None,
    };
    let (_, mut leaf) = descend_read(ctx, start, current)?;
    let mut pos = match from {
        Bound::Unbounded => 0,
        Bound::Included(k) => leaf.search(k).unwrap_or_else(|i| i),
        Bound::Excluded(k) => match leaf.search(k) {
            Ok(i) => i + 1,
            Err(i) => i,
        },
    };
    loop {
        let next = leaf.next;
        for entry in leaf.entries.drain(..).skip(pos) {
            if !f(&*ctx, entry)? {
                return Ok(());
            }
        }
        if next == 0 {
            return Ok(());
        }
        ctx.lock(next, LockMode::Read)?;
        let node = if current {
            ctx.read_current(next)?
        } else {
            ctx.read_node(next)?
        };
        leaf = into_leaf(next, node)?;
        pos = 0;
    }
}

/// First entry at or after (`inclusive`) or strictly after `key`; the
/// first entry overall for `None`.
pub(crate) fn first_from(
    ctx: &mut TreeCtx<'_>,
    key: Option<&[u8]>,
    inclusive: bool,
) -> CoreResult<Option<KeyValuePair>> {
    ctx.lock_db(LockMode::IntentRead)?;
    let from = match key {
        None => Bound::Unbounded,
        Some(k) if inclusive => Bound::Included(k),
        Some(k) => Bound::Excluded(k),
    };
    let mut found = None;
    walk(ctx, from, false, |ctx, entry| {
        let value = load_value(ctx, &entry.value, false)?;
        found = Some((entry.key, value));
        Ok(false)
    })?;
    Ok(found)
}

/// Last entry strictly before `key`; the last entry overall for `None`.
pub(crate) fn last_before(
    ctx: &mut TreeCtx<'_>,
    key: Option<&[u8]>,
) -> CoreResult<Option<KeyValuePair>> {
    ctx.lock_db(LockMode::IntentRead)?;
    match last_in(ctx, ROOT_PGNO, key)? {
        Some(entry) => {
            let value = load_value(ctx, &entry.value, false)?;
            Ok(Some((entry.key, value)))
        }
        None => Ok(None),
    }
}

fn last_in(ctx: &mut TreeCtx<'_>, pgno: PageNo, below: Option<&[u8]>) -> CoreResult<Option<LeafEntry>> {
    ctx.lock(pgno, LockMode::Read)?;
    match ctx.read_node(pgno)? {
        Node::Leaf(mut leaf) => {
            let end = match below {
                None => leaf.entries.len(),
                Some(k) => leaf.search(k).unwrap_or_else(|i| i),
            };
            leaf.entries.truncate(end);
            Ok(leaf.entries.pop())
        }
        Node::Internal(node) => {
            let top = match below {
                None => node.child_count() - 1,
                Some(k) => node.child_index(k),
            };
            for idx in (0..=top).rev() {
                if let Some(entry) = last_in(ctx, node.child(idx), below)? {
                    return Ok(Some(entry));
                }
            }
            Ok(None)
        }
    }
}

/// Entries with keys inside the bounds, in order.
pub(crate) fn range(
    ctx: &mut TreeCtx<'_>,
    start: Bound<&[u8]>,
    end: Bound<&[u8]>,
) -> CoreResult<Vec<KeyValuePair>> {
    ctx.lock_db(LockMode::IntentRead)?;
    let mut out = Vec::new();
    walk(ctx, start, false, |ctx, entry| {
        let in_range = match end {
            Bound::Unbounded => true,
            Bound::Included(e) => entry.key.as_slice() <= e,
            Bound::Excluded(e) => entry.key.as_slice() < e,
        };
        if !in_range {
            return Ok(false);
        }
        let value = load_value(ctx, &entry.value, false)?;
        out.push((entry.key, value));
        Ok(true)
    })?;
    Ok(out)
}

/// Removes every record. Returns how many there were.
pub(crate) fn truncate(ctx: &mut TreeCtx<'_>) -> CoreResult<u64> {
    ctx.check_writable()?;
    ctx.lock_db(LockMode::Write)?;
    let mut count = 0u64;
    walk(ctx, Bound::Unbounded, true, |_, _| {
        count += 1;
        Ok(true)
    })?;
    ctx.lock_path(ROOT_PGNO, LockMode::Write)?;
    ctx.write_node(ROOT_PGNO, &Node::Leaf(Leaf::default()))?;
    ctx.reset_allocation()?;
    Ok(count)
}
