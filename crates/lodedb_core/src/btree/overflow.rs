//! Overflow chains for values too large to keep in a leaf.
//!
//! A value whose leaf entry would exceed a quarter of the page body is
//! split into page-body-sized chunks, one per overflow page, linked
//! through the header's `next` field. The leaf keeps the first page
//! number and the total length.

use crate::btree::ctx::TreeCtx;
use crate::btree::node::{inline_entry_len, Value};
use crate::error::{CoreError, CoreResult};
use crate::types::PageNo;

/// Stores `value` for `key`, inline or in a new overflow chain.
pub(crate) fn store_value(ctx: &mut TreeCtx<'_>, key: &[u8], value: &[u8]) -> CoreResult<Value> {
    if inline_entry_len(key, value) <= ctx.max_inline() {
        return Ok(Value::Inline(value.to_vec()));
    }
    let len = u32::try_from(value.len())
        .map_err(|_| CoreError::invalid_argument("value larger than 4 GiB"))?;
    // Written back to front so every page knows its successor.
    let mut next: PageNo = 0;
    for chunk in value.chunks(ctx.capacity()).rev() {
        next = ctx.allocate_overflow(chunk, next)?;
    }
    Ok(Value::Overflow { pgno: next, len })
}

/// Reads a value back.
pub(crate) fn load_value(ctx: &TreeCtx<'_>, value: &Value, current: bool) -> CoreResult<Vec<u8>> {
    match value {
        Value::Inline(v) => Ok(v.clone()),
        Value::Overflow { pgno, len } => {
            let total = *len as usize;
            let mut out = Vec::with_capacity(total);
            let mut next = *pgno;
            while next != 0 && out.len() < total {
                let (chunk, following) = ctx.read_overflow(next, current)?;
                out.extend_from_slice(&chunk);
                next = following;
            }
            if out.len() != total {
                return Err(CoreError::invalid_format(format!(
                    "overflow chain at page {pgno} holds {} of {total} bytes",
                    out.len()
                )));
            }
            Ok(out)
        }
    }
}

/// Frees the overflow chain of a value being replaced or deleted.
/// Returns the number of pages freed.
pub(crate) fn free_value(ctx: &mut TreeCtx<'_>, value: &Value) -> CoreResult<u32> {
    let Value::Overflow { pgno, .. } = value else {
        return Ok(0);
    };
    let mut freed = 0;
    let mut next = *pgno;
    while next != 0 {
        let (_, following) = ctx.read_overflow(next, true)?;
        ctx.free(next)?;
        freed += 1;
        next = following;
    }
    Ok(freed)
}

/// Page numbers of an overflow chain.
pub(crate) fn chain_pages(ctx: &TreeCtx<'_>, value: &Value) -> CoreResult<Vec<PageNo>> {
    let Value::Overflow { pgno, .. } = value else {
        return Ok(Vec::new());
    };
    let mut pages = Vec::new();
    let mut next = *pgno;
    while next != 0 {
        if pages.contains(&next) {
            return Err(CoreError::invalid_format(format!(
                "overflow chain at page {pgno} loops at {next}"
            )));
        }
        pages.push(next);
        next = ctx.read_overflow(next, false)?.1;
    }
    Ok(pages)
}
