//! Tree statistics and structural verification.

use crate::btree::ctx::TreeCtx;
use crate::btree::meta::ROOT_PGNO;
use crate::btree::node::{Leaf, Node};
use crate::btree::overflow::{chain_pages, load_value};
use crate::error::CoreResult;
use crate::lock::LockMode;
use crate::page::PageType;
use crate::types::PageNo;
use std::collections::HashSet;

/// Statistics of one database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DbStat {
    /// Page size of the file.
    pub page_size: u32,
    /// Tree height; 1 for a tree that is a single leaf.
    pub levels: u8,
    /// Number of records.
    pub keys: u64,
    /// Leaf pages in the tree.
    pub leaf_pages: u64,
    /// Internal pages in the tree.
    pub internal_pages: u64,
    /// Pages holding overflow values.
    pub overflow_pages: u64,
    /// Pages on the free list.
    pub free_pages: u64,
    /// Highest allocated page number.
    pub last_pgno: PageNo,
    /// Body bytes used across all leaves.
    pub leaf_bytes: u64,
}

/// Outcome of [`crate::Database::verify`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Pages examined.
    pub pages_checked: u64,
    /// Records found.
    pub keys: u64,
    /// Everything that was wrong, one line each.
    pub problems: Vec<String>,
}

impl VerifyReport {
    /// True if no problem was found.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

pub(crate) fn stat(ctx: &mut TreeCtx<'_>) -> CoreResult<DbStat> {
    ctx.lock_db(LockMode::IntentRead)?;
    let meta = ctx.read_meta()?;
    let mut stat = DbStat {
        page_size: meta.page_size,
        last_pgno: meta.last_pgno,
        ..DbStat::default()
    };

    let mut stack = vec![ROOT_PGNO];
    while let Some(pgno) = stack.pop() {
        ctx.lock(pgno, LockMode::Read)?;
        match ctx.read_node(pgno)? {
            Node::Internal(node) => {
                if pgno == ROOT_PGNO {
                    stat.levels = node.level + 1;
                }
                stat.internal_pages += 1;
                stack.extend(node.children());
            }
            Node::Leaf(leaf) => {
                if pgno == ROOT_PGNO {
                    stat.levels = 1;
                }
                stat.leaf_pages += 1;
                stat.keys += leaf.entries.len() as u64;
                stat.leaf_bytes += leaf.encoded_len() as u64;
                for entry in &leaf.entries {
                    stat.overflow_pages += chain_pages(ctx, &entry.value)?.len() as u64;
                }
            }
        }
    }

    let mut next = meta.free_head;
    while next != 0 && stat.free_pages <= u64::from(meta.last_pgno) {
        stat.free_pages += 1;
        next = ctx.page_header(next)?.1;
    }
    Ok(stat)
}

struct Checker {
    last_pgno: PageNo,
    seen: HashSet<PageNo>,
    leaves: Vec<(PageNo, PageNo)>,
    report: VerifyReport,
}

impl Checker {
    fn problem(&mut self, message: String) {
        tracing::warn!(problem = %message, "verify");
        self.report.problems.push(message);
    }

    /// Marks a page as reachable; false if it cannot be visited.
    fn visit(&mut self, ctx: &TreeCtx<'_>, pgno: PageNo) -> bool {
        if pgno == 0 || pgno > self.last_pgno {
            self.problem(format!("page {pgno} is outside the allocated range 1..={}", self.last_pgno));
            return false;
        }
        if !self.seen.insert(pgno) {
            self.problem(format!("page {pgno} is reachable more than once"));
            return false;
        }
        self.report.pages_checked += 1;
        if let Err(e) = ctx.check_on_disk(pgno) {
            self.problem(format!("page {pgno}: {e}"));
        }
        true
    }

    fn node(
        &mut self,
        ctx: &mut TreeCtx<'_>,
        pgno: PageNo,
        level: Option<u8>,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
    ) -> CoreResult<()> {
        if !self.visit(ctx, pgno) {
            return Ok(());
        }
        ctx.lock(pgno, LockMode::Read)?;
        let node = match ctx.read_node(pgno) {
            Ok(node) => node,
            Err(e) => {
                self.problem(format!("page {pgno}: {e}"));
                return Ok(());
            }
        };
        if let Some(expected) = level {
            if node.level() != expected {
                self.problem(format!(
                    "page {pgno} has level {}, parent expects {expected}",
                    node.level()
                ));
            }
        }

        match node {
            Node::Leaf(leaf) => self.leaf(ctx, pgno, &leaf, low, high),
            Node::Internal(node) => {
                if node.level == 0 {
                    self.problem(format!("internal page {pgno} has level 0"));
                    return Ok(());
                }
                let keys: Vec<&[u8]> = node.entries.iter().map(|(k, _)| k.as_slice()).collect();
                self.check_keys(pgno, &keys, low, high);
                for idx in 0..node.child_count() {
                    let child_low = if idx == 0 { low } else { Some(keys[idx - 1]) };
                    let child_high = keys.get(idx).copied().or(high);
                    self.node(ctx, node.child(idx), Some(node.level - 1), child_low, child_high)?;
                }
                Ok(())
            }
        }
    }

    fn leaf(
        &mut self,
        ctx: &mut TreeCtx<'_>,
        pgno: PageNo,
        leaf: &Leaf,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
    ) -> CoreResult<()> {
        let keys: Vec<&[u8]> = leaf.entries.iter().map(|e| e.key.as_slice()).collect();
        self.check_keys(pgno, &keys, low, high);
        self.leaves.push((pgno, leaf.next));
        self.report.keys += leaf.entries.len() as u64;
        for entry in &leaf.entries {
            let pages = match chain_pages(ctx, &entry.value) {
                Ok(pages) => pages,
                Err(e) => {
                    self.problem(format!("page {pgno}: {e}"));
                    continue;
                }
            };
            if pages.iter().all(|&p| self.visit(ctx, p)) {
                if let Err(e) = load_value(ctx, &entry.value, false) {
                    self.problem(format!("page {pgno}: {e}"));
                }
            }
        }
        Ok(())
    }

    fn check_keys(&mut self, pgno: PageNo, keys: &[&[u8]], low: Option<&[u8]>, high: Option<&[u8]>) {
        if keys.windows(2).any(|w| w[0] >= w[1]) {
            self.problem(format!("page {pgno}: keys out of order"));
        }
        if let (Some(low), Some(first)) = (low, keys.first()) {
            if *first < low {
                self.problem(format!("page {pgno}: key below its separator"));
            }
        }
        if let (Some(high), Some(last)) = (high, keys.last()) {
            if *last >= high {
                self.problem(format!("page {pgno}: key at or above the next separator"));
            }
        }
    }

    fn leaf_chain(&mut self) {
        let links: Vec<(PageNo, PageNo)> = self.leaves.clone();
        let in_tree: HashSet<PageNo> = links.iter().map(|&(pgno, _)| pgno).collect();
        for (idx, &(pgno, next)) in links.iter().enumerate() {
            let expected = links.get(idx + 1).map_or(0, |&(following, _)| following);
            if next == expected {
                continue;
            }
            if next != 0 && !in_tree.contains(&next) {
                self.problem(format!(
                    "leaf {next} is on the sibling chain after {pgno} but no parent references it"
                ));
            } else if expected == 0 {
                self.problem(format!("last leaf {pgno} links to {next}"));
            } else {
                self.problem(format!("leaf {pgno} links to {next}, expected {expected}"));
            }
        }
    }

    fn free_list(&mut self, ctx: &TreeCtx<'_>, head: PageNo) {
        let mut next = head;
        while next != 0 {
            let pgno = next;
            if !self.visit(ctx, pgno) {
                return;
            }
            match ctx.page_header(pgno) {
                Ok((PageType::Free, following)) => next = following,
                Ok((other, _)) => {
                    self.problem(format!("free-list page {pgno} has type {other:?}"));
                    return;
                }
                Err(e) => {
                    self.problem(format!("free-list page {pgno}: {e}"));
                    return;
                }
            }
        }
    }
}

pub(crate) fn verify(ctx: &mut TreeCtx<'_>) -> CoreResult<VerifyReport> {
    ctx.lock_db(LockMode::Read)?;
    let meta = ctx.read_meta()?;
    let mut checker = Checker {
        last_pgno: meta.last_pgno,
        seen: HashSet::new(),
        leaves: Vec::new(),
        report: VerifyReport::default(),
    };
    if let Err(e) = ctx.check_on_disk(0) {
        checker.problem(format!("metadata page: {e}"));
    }
    if meta.root != ROOT_PGNO {
        checker.problem(format!("metadata names root {}, expected {ROOT_PGNO}", meta.root));
    }
    checker.node(ctx, ROOT_PGNO, None, None, None)?;
    checker.leaf_chain();
    checker.free_list(ctx, meta.free_head);
    tracing::debug!(
        pages = checker.report.pages_checked,
        keys = checker.report.keys,
        problems = checker.report.problems.len(),
        "verify finished"
    );
    Ok(checker.report)
}
