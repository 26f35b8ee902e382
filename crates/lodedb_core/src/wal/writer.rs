//! Log manager: buffered appends, group flush, file rotation.

use crate::error::{CoreError, CoreResult};
use crate::failpoint;
use crate::stats::LogStats;
use crate::types::Lsn;
use crate::wal::iterator::LogIterator;
use crate::wal::record::{WalRecord, RECORD_CRC_SIZE, RECORD_HEADER_SIZE};
use lodedb_storage::{FileBackend, InMemoryBackend, StorageBackend, StorageResult};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Magic bytes at the start of every log file.
pub const LOG_FILE_MAGIC: [u8; 4] = *b"LDBL";

/// Current log file format version.
pub const LOG_FILE_VERSION: u16 = 1;

/// Size of the log file header; the first record of a file sits here.
pub const LOG_FILE_HEADER_SIZE: u32 = 16;

/// Name of log file `number` inside the environment directory.
#[must_use]
pub fn log_file_name(number: u32) -> String {
    format!("log.{number:010}")
}

fn parse_log_file_name(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("log.")?;
    if digits.len() != 10 {
        return None;
    }
    digits.parse().ok()
}

fn file_header(number: u32) -> [u8; LOG_FILE_HEADER_SIZE as usize] {
    let mut header = [0u8; LOG_FILE_HEADER_SIZE as usize];
    header[0..4].copy_from_slice(&LOG_FILE_MAGIC);
    header[4..6].copy_from_slice(&LOG_FILE_VERSION.to_le_bytes());
    header[8..12].copy_from_slice(&number.to_le_bytes());
    header
}

pub(crate) fn check_file_header(bytes: &[u8], number: u32) -> CoreResult<()> {
    let at = Lsn::new(number, 0);
    if bytes.len() < LOG_FILE_HEADER_SIZE as usize {
        return Err(CoreError::log_corruption(at, "log file header truncated"));
    }
    if bytes[0..4] != LOG_FILE_MAGIC {
        return Err(CoreError::log_corruption(at, "invalid log file magic"));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version > LOG_FILE_VERSION {
        return Err(CoreError::log_corruption(
            at,
            format!("unsupported log file version {version}"),
        ));
    }
    let stored = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    if stored != number {
        return Err(CoreError::log_corruption(
            at,
            format!("log file carries number {stored}"),
        ));
    }
    Ok(())
}

struct LogState {
    files: BTreeMap<u32, Box<dyn StorageBackend>>,
    /// Number of the file new records go to.
    current: u32,
    /// Bytes of the current file already handed to its backend.
    written: u32,
    /// Records not yet written to the backend.
    buffer: Vec<u8>,
    /// Every record below this LSN is durable.
    flushed: Lsn,
}

impl LogState {
    fn end(&self) -> Lsn {
        Lsn::new(self.current, self.written + self.buffer.len() as u32)
    }
}

/// The write-ahead log.
///
/// Records are appended to an in-memory buffer and assigned their LSN
/// immediately. [`LogManager::flush`] writes the buffer out and syncs it;
/// concurrent committers waiting on the same flush share one sync. Records
/// still in the buffer when the process dies are lost, which recovery
/// treats exactly like a crash before the append.
pub struct LogManager {
    dir: Option<PathBuf>,
    state: Mutex<LogState>,
    max_file_size: u32,
    buffer_limit: usize,
    failed: AtomicBool,
    stats: LogStats,
}

impl LogManager {
    /// Opens (or starts) the log in `dir`.
    ///
    /// A torn record at the end of the newest file is cut off.
    ///
    /// # Errors
    ///
    /// Returns `LogCorruption` for damaged headers or records, and storage
    /// errors from the file system.
    pub fn open(dir: &Path, max_file_size: u32, buffer_limit: usize) -> CoreResult<Self> {
        let mut numbers = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(n) = entry.file_name().to_str().and_then(parse_log_file_name) {
                numbers.push(n);
            }
        }
        numbers.sort_unstable();

        let mut files: BTreeMap<u32, Box<dyn StorageBackend>> = BTreeMap::new();
        for &n in &numbers {
            let backend = FileBackend::open_existing(&dir.join(log_file_name(n)))?;
            files.insert(n, Box::new(backend));
        }

        let log = Self {
            dir: Some(dir.to_path_buf()),
            state: Mutex::new(LogState {
                files,
                current: 0,
                written: 0,
                buffer: Vec::new(),
                flushed: Lsn::ZERO,
            }),
            max_file_size,
            buffer_limit,
            failed: AtomicBool::new(false),
            stats: LogStats::default(),
        };

        match numbers.last() {
            None => {
                let mut st = log.state.lock();
                log.start_file(&mut st, 1)?;
            }
            Some(&last) => log.find_end(last)?,
        }
        Ok(log)
    }

    /// Creates a log held entirely in memory.
    #[must_use]
    pub fn in_memory(max_file_size: u32, buffer_limit: usize) -> Self {
        let mut files: BTreeMap<u32, Box<dyn StorageBackend>> = BTreeMap::new();
        files.insert(1, Box::new(InMemoryBackend::with_data(file_header(1).to_vec())));
        Self {
            dir: None,
            state: Mutex::new(LogState {
                files,
                current: 1,
                written: LOG_FILE_HEADER_SIZE,
                buffer: Vec::new(),
                flushed: Lsn::new(1, LOG_FILE_HEADER_SIZE),
            }),
            max_file_size,
            buffer_limit,
            failed: AtomicBool::new(false),
            stats: LogStats::default(),
        }
    }

    /// Scans the newest file for the end of its last complete record.
    fn find_end(&self, last: u32) -> CoreResult<()> {
        let bytes = {
            let st = self.state.lock();
            let backend = st
                .files
                .get(&last)
                .ok_or_else(|| CoreError::log_corruption(Lsn::new(last, 0), "log file missing"))?;
            let size = backend.size()? as usize;
            backend.read_at(0, size)?
        };
        check_file_header(&bytes, last)?;

        let mut pos = LOG_FILE_HEADER_SIZE as usize;
        while pos < bytes.len() {
            let lsn = Lsn::new(last, pos as u32);
            match WalRecord::decode(&bytes[pos..], lsn)? {
                Some((_, len)) => pos += len,
                None => break,
            }
        }

        let mut st = self.state.lock();
        if pos < bytes.len() {
            tracing::warn!(
                file = last,
                valid = pos,
                size = bytes.len(),
                "discarding torn record at log tail"
            );
            if let Some(backend) = st.files.get_mut(&last) {
                backend.truncate(pos as u64)?;
            }
        }
        st.current = last;
        st.written = pos as u32;
        st.flushed = Lsn::new(last, pos as u32);
        Ok(())
    }

    fn fail(&self, what: &str, err: impl std::fmt::Display) -> CoreError {
        self.failed.store(true, Ordering::SeqCst);
        tracing::error!(error = %err, "log {what} failed");
        CoreError::log_io(format!("{what}: {err}"))
    }

    fn check_failed(&self) -> CoreResult<()> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(CoreError::log_io("log unusable after an earlier write failure"));
        }
        Ok(())
    }

    /// Creates file `number`, writes and syncs its header, and makes it current.
    fn start_file(&self, st: &mut LogState, number: u32) -> CoreResult<()> {
        let mut backend: Box<dyn StorageBackend> = match &self.dir {
            Some(dir) => {
                let backend = FileBackend::open(&dir.join(log_file_name(number)))
                    .map_err(|e| self.fail("create file", e))?;
                Box::new(backend)
            }
            None => Box::new(InMemoryBackend::new()),
        };
        let init = |backend: &mut Box<dyn StorageBackend>| -> StorageResult<()> {
            backend.truncate(0)?;
            backend.append(&file_header(number))?;
            backend.sync()
        };
        init(&mut backend).map_err(|e| self.fail("create file", e))?;
        if let Some(dir) = &self.dir {
            crate::env::dir::sync_directory(dir).map_err(|e| self.fail("sync directory", e))?;
        }

        st.files.insert(number, backend);
        st.current = number;
        st.written = LOG_FILE_HEADER_SIZE;
        st.flushed = Lsn::new(number, LOG_FILE_HEADER_SIZE);
        self.stats.record_file_created();
        tracing::debug!(file = number, "started log file");
        Ok(())
    }

    fn write_buffer(&self, st: &mut LogState) -> CoreResult<()> {
        if st.buffer.is_empty() {
            return Ok(());
        }
        let current = st.current;
        let buffer = std::mem::take(&mut st.buffer);
        let backend = st
            .files
            .get_mut(&current)
            .ok_or_else(|| CoreError::log_io("current log file missing"))?;
        backend
            .append(&buffer)
            .map_err(|e| self.fail("write", e))?;
        st.written += buffer.len() as u32;
        self.stats.record_buffer_write();
        Ok(())
    }

    fn sync_current(&self, st: &mut LogState) -> CoreResult<()> {
        failpoint::maybe_fail("log.sync").map_err(|e| self.fail("sync", e))?;
        let current = st.current;
        if let Some(backend) = st.files.get_mut(&current) {
            backend.sync().map_err(|e| self.fail("sync", e))?;
        }
        st.flushed = st.end();
        self.stats.record_sync();
        Ok(())
    }

    /// Moves to the next file, syncing the one being closed.
    fn rotate(&self, st: &mut LogState) -> CoreResult<()> {
        self.write_buffer(st)?;
        self.sync_current(st)?;
        let next = st.current + 1;
        self.start_file(st, next)
    }

    fn push(&self, st: &mut LogState, data: &[u8]) -> CoreResult<Lsn> {
        let end = st.end();
        let fits = u64::from(end.offset()) + data.len() as u64 <= u64::from(self.max_file_size);
        // An oversized record still gets a file of its own.
        if !fits && end.offset() > LOG_FILE_HEADER_SIZE {
            self.rotate(st)?;
        }
        let lsn = st.end();
        if u64::from(lsn.offset()) + data.len() as u64 > u64::from(u32::MAX) {
            return Err(CoreError::invalid_argument("log record too large"));
        }
        st.buffer.extend_from_slice(data);
        if st.buffer.len() >= self.buffer_limit {
            self.write_buffer(st)?;
        }
        self.stats.record_append(data.len() as u64);
        Ok(lsn)
    }

    /// Appends a record and returns its LSN. The record is not durable
    /// until [`Self::flush`] covers it.
    ///
    /// # Errors
    ///
    /// Returns `LogIo` if the log has failed or a buffer write-out fails.
    pub fn append(&self, record: &WalRecord) -> CoreResult<Lsn> {
        self.check_failed()?;
        let data = record.encode()?;
        let mut st = self.state.lock();
        self.push(&mut st, &data)
    }

    /// Appends an already-encoded record at a fixed LSN.
    ///
    /// Replicas use this to keep their log byte-identical to the master's.
    /// `lsn` must be the current end of the log or the header position of
    /// the next file.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `lsn` is not the end of the log or the
    /// bytes are not exactly one valid record.
    pub fn append_raw_at(&self, lsn: Lsn, raw: &[u8]) -> CoreResult<()> {
        self.check_failed()?;
        match WalRecord::decode(raw, lsn)? {
            Some((_, len)) if len == raw.len() => {}
            _ => return Err(CoreError::invalid_argument("raw log bytes are not one record")),
        }

        let mut st = self.state.lock();
        let end = st.end();
        if lsn.file() == st.current + 1 && lsn.offset() == LOG_FILE_HEADER_SIZE {
            self.rotate(&mut st)?;
        } else if lsn != end {
            return Err(CoreError::invalid_argument(format!(
                "record at {lsn} does not continue the log ending at {end}"
            )));
        }
        st.buffer.extend_from_slice(raw);
        if st.buffer.len() >= self.buffer_limit {
            self.write_buffer(&mut st)?;
        }
        self.stats.record_append(raw.len() as u64);
        Ok(())
    }

    /// Makes every record up to and including `lsn` durable.
    ///
    /// # Errors
    ///
    /// Returns `LogIo` if the write or sync fails; the log is then unusable.
    pub fn flush(&self, lsn: Lsn) -> CoreResult<()> {
        let mut st = self.state.lock();
        if st.flushed > lsn {
            return Ok(());
        }
        self.check_failed()?;
        self.write_buffer(&mut st)?;
        self.sync_current(&mut st)
    }

    /// Makes the whole log durable.
    ///
    /// # Errors
    ///
    /// Returns `LogIo` if the write or sync fails.
    pub fn flush_all(&self) -> CoreResult<()> {
        let end = self.end_lsn();
        if self.flushed_lsn() >= end {
            return Ok(());
        }
        self.flush(end)
    }

    /// Position the next record will get.
    pub fn end_lsn(&self) -> Lsn {
        self.state.lock().end()
    }

    /// True if a shipped record at `lsn` would continue this log: either
    /// at its end or at the header of the next file.
    pub fn continues_at(&self, lsn: Lsn) -> bool {
        let st = self.state.lock();
        lsn == st.end() || (lsn.file() == st.current + 1 && lsn.offset() == LOG_FILE_HEADER_SIZE)
    }

    /// Every record below this LSN is durable.
    pub fn flushed_lsn(&self) -> Lsn {
        self.state.lock().flushed
    }

    /// Position of the first record still present.
    pub fn first_lsn(&self) -> Lsn {
        let st = self.state.lock();
        let first = st.files.keys().next().copied().unwrap_or(st.current);
        Lsn::new(first, LOG_FILE_HEADER_SIZE)
    }

    /// Number of the file currently appended to.
    pub fn current_file(&self) -> u32 {
        self.state.lock().current
    }

    /// Numbers of the log files present, oldest first.
    pub fn file_numbers(&self) -> Vec<u32> {
        self.state.lock().files.keys().copied().collect()
    }

    /// Path of the log directory (`None` in memory).
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Counters for this log.
    pub fn stats(&self) -> &LogStats {
        &self.stats
    }

    /// Returns true if a write or sync failure made the log unusable.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Reads the record at `lsn` and returns it with its encoded length.
    ///
    /// # Errors
    ///
    /// Returns `LogCorruption` if no complete, valid record starts at `lsn`.
    pub fn read_record(&self, lsn: Lsn) -> CoreResult<(WalRecord, usize)> {
        let st = self.state.lock();
        if lsn.file() == st.current && lsn.offset() >= st.written {
            let start = (lsn.offset() - st.written) as usize;
            if start < st.buffer.len() {
                if let Some(found) = WalRecord::decode(&st.buffer[start..], lsn)? {
                    return Ok(found);
                }
            }
            return Err(CoreError::log_corruption(lsn, "no record at this position"));
        }

        let backend = st
            .files
            .get(&lsn.file())
            .ok_or_else(|| CoreError::log_corruption(lsn, "log file not present"))?;
        let size = backend.size()?;
        let offset = u64::from(lsn.offset());
        if offset >= size {
            return Err(CoreError::log_corruption(lsn, "position beyond end of file"));
        }
        let header_len = (RECORD_HEADER_SIZE as u64).min(size - offset);
        let header = backend.read_at(offset, header_len as usize)?;
        if header.len() < RECORD_HEADER_SIZE {
            return Err(CoreError::log_corruption(lsn, "truncated record header"));
        }
        let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as u64;
        let total = (RECORD_HEADER_SIZE + RECORD_CRC_SIZE)
            as u64
            + payload_len;
        if offset + total > size {
            return Err(CoreError::log_corruption(lsn, "truncated record"));
        }
        let bytes = backend.read_at(offset, total as usize)?;
        WalRecord::decode(&bytes, lsn)?
            .ok_or_else(|| CoreError::log_corruption(lsn, "truncated record"))
    }

    /// Returns every byte of file `number` that is part of the log,
    /// including records still in the buffer.
    pub(crate) fn load_file(&self, number: u32) -> CoreResult<Vec<u8>> {
        let st = self.state.lock();
        let backend = st
            .files
            .get(&number)
            .ok_or_else(|| CoreError::log_corruption(Lsn::new(number, 0), "log file not present"))?;
        let size = backend.size()? as usize;
        let mut bytes = backend.read_at(0, size)?;
        if number == st.current {
            bytes.extend_from_slice(&st.buffer);
        }
        drop(st);
        check_file_header(&bytes, number)?;
        Ok(bytes)
    }

    /// Iterates over records starting at `from` (`Lsn::ZERO` = first record).
    pub fn iter_from(&self, from: Lsn) -> LogIterator<'_> {
        let start = if from.is_zero() { self.first_lsn() } else { from };
        LogIterator::new(self, start)
    }

    /// Discards every record at or after `lsn`.
    ///
    /// Used when a replica has to give up log records the new master
    /// never wrote.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `lsn` is not inside the log, or
    /// `LogIo` on I/O failure.
    pub fn truncate_at(&self, lsn: Lsn) -> CoreResult<()> {
        self.check_failed()?;
        let mut st = self.state.lock();
        if lsn > st.end() || lsn.offset() < LOG_FILE_HEADER_SIZE || !st.files.contains_key(&lsn.file())
        {
            return Err(CoreError::invalid_argument(format!(
                "cannot truncate log ending at {} to {lsn}",
                st.end()
            )));
        }
        self.write_buffer(&mut st)?;

        let doomed: Vec<u32> = st.files.range(lsn.file() + 1..).map(|(&n, _)| n).collect();
        for n in doomed {
            st.files.remove(&n);
            if let Some(dir) = &self.dir {
                std::fs::remove_file(dir.join(log_file_name(n)))
                    .map_err(|e| self.fail("remove file", e))?;
            }
        }

        let backend = st
            .files
            .get_mut(&lsn.file())
            .ok_or_else(|| CoreError::log_io("log file vanished during truncate"))?;
        backend
            .truncate(u64::from(lsn.offset()))
            .map_err(|e| self.fail("truncate", e))?;
        st.current = lsn.file();
        st.written = lsn.offset();
        st.flushed = lsn;
        tracing::info!(%lsn, "log truncated");
        Ok(())
    }

    /// Removes log files whose records all precede `keep_from`.
    ///
    /// The current file is never removed. Returns the removed file numbers.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a file cannot be deleted.
    pub fn remove_files_before(&self, keep_from: Lsn) -> CoreResult<Vec<u32>> {
        let mut st = self.state.lock();
        let current = st.current;
        let doomed: Vec<u32> = st
            .files
            .keys()
            .copied()
            .filter(|&n| n < keep_from.file() && n != current)
            .collect();
        for &n in &doomed {
            st.files.remove(&n);
            if let Some(dir) = &self.dir {
                std::fs::remove_file(dir.join(log_file_name(n)))?;
            }
        }
        drop(st);
        if !doomed.is_empty() {
            self.stats.record_files_removed(doomed.len() as u64);
            tracing::info!(removed = doomed.len(), "archived log files");
        }
        Ok(doomed)
    }
}

impl std::fmt::Debug for LogManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogManager")
            .field("dir", &self.dir)
            .field("end", &self.end_lsn())
            .field("failed", &self.has_failed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionId;
    use tempfile::tempdir;

    fn abort(n: u64) -> WalRecord {
        WalRecord::Abort {
            txid: TransactionId::new(n),
            prev_lsn: Lsn::ZERO,
        }
    }

    #[test]
    fn first_record_follows_header() {
        let log = LogManager::in_memory(1 << 20, 4096);
        let lsn = log.append(&abort(1)).unwrap();
        assert_eq!(lsn, Lsn::new(1, LOG_FILE_HEADER_SIZE));
        assert!(log.end_lsn() > lsn);
    }

    #[test]
    fn read_back_from_buffer_and_file() {
        let log = LogManager::in_memory(1 << 20, 4096);
        let a = log.append(&abort(1)).unwrap();
        assert_eq!(log.read_record(a).unwrap().0, abort(1));

        log.flush(a).unwrap();
        let b = log.append(&abort(2)).unwrap();
        assert_eq!(log.read_record(a).unwrap().0, abort(1));
        assert_eq!(log.read_record(b).unwrap().0, abort(2));
    }

    #[test]
    fn flush_advances_flushed_lsn() {
        let log = LogManager::in_memory(1 << 20, 4096);
        let lsn = log.append(&abort(1)).unwrap();
        assert!(log.flushed_lsn() <= lsn);
        log.flush(lsn).unwrap();
        assert!(log.flushed_lsn() > lsn);
        assert_eq!(log.stats().snapshot().syncs, 1);

        // Already durable: no second sync.
        log.flush(lsn).unwrap();
        assert_eq!(log.stats().snapshot().syncs, 1);
    }

    #[test]
    fn rotates_at_max_file_size() {
        let log = LogManager::in_memory(256, 64);
        let mut lsns = Vec::new();
        for i in 0..40 {
            lsns.push(log.append(&abort(i)).unwrap());
        }
        assert!(log.current_file() > 1);
        assert!(lsns.windows(2).all(|w| w[0] < w[1]));
        for (i, lsn) in lsns.iter().enumerate() {
            assert_eq!(log.read_record(*lsn).unwrap().0, abort(i as u64));
        }
    }

    #[test]
    fn unflushed_records_lost_on_reopen() {
        let dir = tempdir().unwrap();
        {
            let log = LogManager::open(dir.path(), 1 << 20, 1 << 16).unwrap();
            let a = log.append(&abort(1)).unwrap();
            log.flush(a).unwrap();
            log.append(&abort(2)).unwrap();
        }
        let log = LogManager::open(dir.path(), 1 << 20, 1 << 16).unwrap();
        let records: Vec<_> = log.iter_from(Lsn::ZERO).map(|r| r.unwrap().1).collect();
        assert_eq!(records, vec![abort(1)]);
    }

    #[test]
    fn torn_tail_is_cut() {
        let dir = tempdir().unwrap();
        let end = {
            let log = LogManager::open(dir.path(), 1 << 20, 1 << 16).unwrap();
            let a = log.append(&abort(1)).unwrap();
            log.flush(a).unwrap();
            log.end_lsn()
        };
        // Half a record at the tail.
        let path = dir.path().join(log_file_name(1));
        let partial = abort(2).encode().unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&partial[..partial.len() / 2]);
        std::fs::write(&path, bytes).unwrap();

        let log = LogManager::open(dir.path(), 1 << 20, 1 << 16).unwrap();
        assert_eq!(log.end_lsn(), end);
        let next = log.append(&abort(3)).unwrap();
        assert_eq!(next, end);
    }

    #[test]
    fn corrupt_record_fails_open() {
        let dir = tempdir().unwrap();
        {
            let log = LogManager::open(dir.path(), 1 << 20, 1 << 16).unwrap();
            let a = log.append(&abort(1)).unwrap();
            log.flush(a).unwrap();
        }
        let path = dir.path().join(log_file_name(1));
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let err = LogManager::open(dir.path(), 1 << 20, 1 << 16).unwrap_err();
        assert!(matches!(err, CoreError::LogCorruption { .. }));
    }

    #[test]
    fn sync_failure_poisons_log() {
        let log = LogManager::in_memory(1 << 20, 4096);
        let lsn = log.append(&abort(1)).unwrap();
        failpoint::enable("log.sync");
        let err = log.flush(lsn).unwrap_err();
        failpoint::disable("log.sync");
        assert!(matches!(err, CoreError::LogIo { .. }));
        assert!(log.has_failed());
        assert!(log.append(&abort(2)).is_err());
    }

    #[test]
    fn append_raw_at_requires_log_end() {
        let master = LogManager::in_memory(1 << 20, 4096);
        let replica = LogManager::in_memory(1 << 20, 4096);
        let lsn = master.append(&abort(9)).unwrap();
        let raw = abort(9).encode().unwrap();

        assert!(replica.append_raw_at(Lsn::new(1, 500), &raw).is_err());
        replica.append_raw_at(lsn, &raw).unwrap();
        assert_eq!(replica.end_lsn(), master.end_lsn());
        assert_eq!(replica.read_record(lsn).unwrap().0, abort(9));
    }

    #[test]
    fn truncate_drops_later_records() {
        let log = LogManager::in_memory(256, 64);
        let mut lsns = Vec::new();
        for i in 0..30 {
            lsns.push(log.append(&abort(i)).unwrap());
        }
        let cut = lsns[10];
        log.truncate_at(cut).unwrap();
        assert_eq!(log.end_lsn(), cut);
        let count = log.iter_from(Lsn::ZERO).count();
        assert_eq!(count, 10);
        assert_eq!(log.append(&abort(99)).unwrap(), cut);
    }

    #[test]
    fn remove_files_keeps_current() {
        let dir = tempdir().unwrap();
        let log = LogManager::open(dir.path(), 256, 64).unwrap();
        for i in 0..40 {
            log.append(&abort(i)).unwrap();
        }
        log.flush_all().unwrap();
        let current = log.current_file();
        let removed = log.remove_files_before(Lsn::new(current + 5, 0)).unwrap();
        assert!(!removed.is_empty());
        assert_eq!(log.file_numbers(), vec![current]);
        assert!(!dir.path().join(log_file_name(1)).exists());
    }
}
