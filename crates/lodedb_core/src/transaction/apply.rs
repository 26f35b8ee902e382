//! Applying page deltas: redo during recovery, undo with compensation
//! records during abort and recovery, and raw reversal for replication
//! rollback.

use crate::cache::{FetchMode, PageCache};
use crate::error::{CoreError, CoreResult};
use crate::page::Page;
use crate::types::{Lsn, TransactionId};
use crate::wal::{LogManager, PageDelta, WalRecord};
use std::ops::Range;

fn delta_range(delta: &PageDelta, page: &Page, lsn: Lsn) -> CoreResult<Range<usize>> {
    let start = delta.offset as usize;
    let end = start + delta.after.len();
    if delta.before.len() != delta.after.len() || end > page.size() {
        return Err(CoreError::log_corruption(
            lsn,
            format!(
                "delta for page {} does not fit: {}..{} of {}",
                delta.page(),
                start,
                end,
                page.size()
            ),
        ));
    }
    Ok(start..end)
}

/// Reapplies the after-image of a logged change if the page has not seen
/// it yet. Returns whether the page changed. Deltas for files that are not
/// open are skipped.
///
/// # Errors
///
/// Returns `LogCorruption` for a delta that does not fit the page, and
/// cache errors.
pub(crate) fn redo(cache: &PageCache, lsn: Lsn, delta: &PageDelta) -> CoreResult<bool> {
    if cache.file(delta.file).is_none() {
        return Ok(false);
    }
    let pinned = cache.fetch(delta.page(), FetchMode::Create)?;
    let mut page = pinned.write();
    if page.lsn() >= lsn {
        return Ok(false);
    }
    let range = delta_range(delta, &page, lsn)?;
    pinned.mark_dirty(lsn);
    page.as_bytes_mut()[range].copy_from_slice(&delta.after);
    page.set_lsn(lsn);
    Ok(true)
}

/// Undoes one logged change: restores its before-image and writes a
/// compensation record whose `undo_next` is the change's predecessor in
/// the transaction's chain. Returns the compensation record's LSN, or
/// `None` if the file is gone.
///
/// `prev_lsn` is the transaction's most recent record; the compensation
/// record is chained after it.
///
/// # Errors
///
/// Returns log errors (fatal) and cache errors.
pub(crate) fn compensate(
    log: &LogManager,
    cache: &PageCache,
    txid: TransactionId,
    prev_lsn: Lsn,
    delta: &PageDelta,
    undo_next: Lsn,
) -> CoreResult<Option<Lsn>> {
    if cache.file(delta.file).is_none() {
        return Ok(None);
    }
    let pinned = cache.fetch(delta.page(), FetchMode::Create)?;
    let mut page = pinned.write();
    let range = delta_range(delta, &page, prev_lsn)?;
    let clr = WalRecord::Compensation {
        txid,
        prev_lsn,
        undo_next,
        delta: PageDelta {
            file: delta.file,
            pgno: delta.pgno,
            page_lsn: page.lsn(),
            offset: delta.offset,
            before: page.as_bytes()[range.clone()].to_vec(),
            after: delta.before.clone(),
        },
    };
    pinned.mark_dirty(log.end_lsn());
    let lsn = log.append(&clr)?;
    page.as_bytes_mut()[range].copy_from_slice(&delta.before);
    page.set_lsn(lsn);
    Ok(Some(lsn))
}

/// Reverses a change without logging anything: restores the before-image
/// and the page LSN the change replaced. Used when the log itself is being
/// cut back, so the change and everything after it disappear.
///
/// # Errors
///
/// Returns `LogCorruption` for a delta that does not fit the page, and
/// cache errors.
pub(crate) fn revert(cache: &PageCache, lsn: Lsn, delta: &PageDelta) -> CoreResult<bool> {
    if cache.file(delta.file).is_none() {
        return Ok(false);
    }
    let pinned = cache.fetch(delta.page(), FetchMode::Create)?;
    let mut page = pinned.write();
    if page.lsn() < lsn {
        // The change never reached this page.
        return Ok(false);
    }
    let range = delta_range(delta, &page, lsn)?;
    pinned.mark_dirty(delta.page_lsn);
    page.as_bytes_mut()[range].copy_from_slice(&delta.before);
    page.set_lsn(delta.page_lsn);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PageFile;
    use crate::types::FileId;
    use std::sync::Arc;

    fn setup() -> (Arc<LogManager>, PageCache) {
        let log = Arc::new(LogManager::in_memory(1 << 20, 4096));
        let cache = PageCache::new(512, 16, Arc::clone(&log), false, 0);
        cache.register_file(Arc::new(PageFile::in_memory(FileId::new(1), "t", 512)));
        (log, cache)
    }

    fn delta(before: u8, after: u8) -> PageDelta {
        PageDelta {
            file: FileId::new(1),
            pgno: 2,
            page_lsn: Lsn::ZERO,
            offset: 40,
            before: vec![before; 4],
            after: vec![after; 4],
        }
    }

    fn bytes(cache: &PageCache) -> (Vec<u8>, Lsn) {
        let pinned = cache
            .fetch(delta(0, 0).page(), FetchMode::Create)
            .unwrap();
        let page = pinned.read();
        (page.as_bytes()[40..44].to_vec(), page.lsn())
    }

    #[test]
    fn redo_is_idempotent() {
        let (_log, cache) = setup();
        let lsn = Lsn::new(1, 16);
        assert!(redo(&cache, lsn, &delta(0, 7)).unwrap());
        assert!(!redo(&cache, lsn, &delta(0, 7)).unwrap());
        assert_eq!(bytes(&cache), (vec![7; 4], lsn));
    }

    #[test]
    fn compensate_restores_and_logs() {
        let (log, cache) = setup();
        let txid = TransactionId::new(3);
        let update = WalRecord::Update {
            txid,
            prev_lsn: Lsn::ZERO,
            delta: delta(0, 9),
        };
        let lsn = log.append(&update).unwrap();
        redo(&cache, lsn, &delta(0, 9)).unwrap();

        let clr_lsn = compensate(&log, &cache, txid, lsn, &delta(0, 9), Lsn::ZERO)
            .unwrap()
            .unwrap();
        assert_eq!(bytes(&cache), (vec![0; 4], clr_lsn));
        match log.read_record(clr_lsn).unwrap().0 {
            WalRecord::Compensation {
                prev_lsn,
                undo_next,
                delta,
                ..
            } => {
                assert_eq!(prev_lsn, lsn);
                assert_eq!(undo_next, Lsn::ZERO);
                assert_eq!(delta.before, vec![9; 4]);
                assert_eq!(delta.page_lsn, lsn);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn revert_restores_page_lsn() {
        let (_log, cache) = setup();
        let first = Lsn::new(1, 16);
        let second = Lsn::new(1, 80);
        redo(&cache, first, &delta(0, 1)).unwrap();
        let mut d2 = delta(1, 2);
        d2.page_lsn = first;
        redo(&cache, second, &d2).unwrap();

        assert!(revert(&cache, second, &d2).unwrap());
        assert_eq!(bytes(&cache), (vec![1; 4], first));
        assert!(!revert(&cache, second, &d2).unwrap());
    }

    #[test]
    fn oversized_delta_is_corruption() {
        let (_log, cache) = setup();
        let mut d = delta(0, 1);
        d.offset = 510;
        assert!(matches!(
            redo(&cache, Lsn::new(1, 16), &d),
            Err(CoreError::LogCorruption { .. })
        ));
    }

    #[test]
    fn unknown_file_is_skipped() {
        let (_log, cache) = setup();
        let mut d = delta(0, 1);
        d.file = FileId::new(99);
        assert!(!redo(&cache, Lsn::new(1, 16), &d).unwrap());
    }
}
