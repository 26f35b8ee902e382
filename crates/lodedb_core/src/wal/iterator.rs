//! Sequential log reader.

use crate::error::{CoreError, CoreResult};
use crate::types::Lsn;
use crate::wal::record::WalRecord;
use crate::wal::writer::{LogManager, LOG_FILE_HEADER_SIZE};

/// Iterator over log records in LSN order, crossing file boundaries.
///
/// One log file is held in memory at a time, so memory use is bounded by
/// the configured log file size. The iterator sees records appended before
/// it reaches the end of the current file, including ones still in the
/// log buffer.
pub struct LogIterator<'a> {
    log: &'a LogManager,
    file: u32,
    data: Option<Vec<u8>>,
    pos: usize,
    done: bool,
}

impl<'a> LogIterator<'a> {
    pub(crate) fn new(log: &'a LogManager, start: Lsn) -> Self {
        Self {
            log,
            file: start.file(),
            data: None,
            pos: start.offset().max(LOG_FILE_HEADER_SIZE) as usize,
            done: false,
        }
    }

    /// Returns the next record together with its encoded bytes.
    ///
    /// # Errors
    ///
    /// Returns `LogCorruption` for damaged records or a record torn in the
    /// middle of the log.
    pub fn next_raw(&mut self) -> CoreResult<Option<(Lsn, WalRecord, Vec<u8>)>> {
        if self.done {
            return Ok(None);
        }
        loop {
            if self.data.is_none() {
                self.data = Some(self.log.load_file(self.file)?);
            }
            let data = self.data.as_deref().unwrap_or_default();

            if self.pos < data.len() {
                let lsn = Lsn::new(self.file, self.pos as u32);
                match WalRecord::decode(&data[self.pos..], lsn)? {
                    Some((record, len)) => {
                        let raw = data[self.pos..self.pos + len].to_vec();
                        self.pos += len;
                        return Ok(Some((lsn, record, raw)));
                    }
                    None => {
                        if self.file >= self.log.current_file() {
                            self.done = true;
                            return Ok(None);
                        }
                        return Err(CoreError::log_corruption(
                            lsn,
                            "torn record before the end of the log",
                        ));
                    }
                }
            }

            if self.file >= self.log.current_file() {
                self.done = true;
                return Ok(None);
            }
            self.file += 1;
            self.data = None;
            self.pos = LOG_FILE_HEADER_SIZE as usize;
        }
    }

    /// Position the next record will be read from.
    #[must_use]
    pub fn position(&self) -> Lsn {
        Lsn::new(self.file, self.pos as u32)
    }
}

impl Iterator for LogIterator<'_> {
    type Item = CoreResult<(Lsn, WalRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_raw() {
            Ok(Some((lsn, record, _))) => Some(Ok((lsn, record))),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
